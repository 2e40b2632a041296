//! 优雅关闭
//!
//! ShutdownManager 监听 Ctrl+C / SIGTERM 并广播关闭原因；ShutdownCoordinator 按注册顺序执行清理
//! （取消活跃任务、等待沙箱退出、关闭存储），每项清理都有超时。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 所有任务已结束，正常退出
    Completed,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason_tx,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// 关闭 token；引擎的任务取消令牌可以挂在它下面
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling active tasks...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling active tasks...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理项
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名称
    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanups: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanups: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理项的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, cleanup: T) {
        self.cleanups.push(Arc::new(cleanup));
    }

    /// 按注册顺序执行；失败或超时只记日志，不影响后续清理
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(count = self.cleanups.len(), reason = ?self.manager.reason(), "running shutdown cleanup");
        let mut succeeded = 0;
        for cleanup in &self.cleanups {
            let name = cleanup.name();
            match tokio::time::timeout(self.timeout, cleanup.cleanup()).await {
                Ok(Ok(())) => {
                    succeeded += 1;
                    tracing::info!(cleanup = name, "cleanup finished");
                }
                Ok(Err(e)) => tracing::warn!(cleanup = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(cleanup = name, timeout_ms = self.timeout.as_millis() as u64, "cleanup timed out"),
            }
        }
        succeeded
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(coordinator: &ShutdownCoordinator, app: F) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    let manager = Arc::clone(coordinator.manager());
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => manager.shutdown(ShutdownReason::Completed),
        _ = manager.wait_for_shutdown() => {}
    }

    coordinator.run_cleanup().await;
    manager.reason().unwrap_or(ShutdownReason::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct CountingCleanup {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for CountingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store already closed");
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    struct SlowCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for SlowCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures_and_timeouts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator =
            ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(Duration::from_millis(20));
        coordinator.register(CountingCleanup { calls: calls.clone(), fail: true });
        coordinator.register(SlowCleanup);
        coordinator.register(CountingCleanup { calls: calls.clone(), fail: false });

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_app_completion_triggers_cleanup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(CountingCleanup { calls: calls.clone(), fail: false });

        let reason = run_with_graceful_shutdown(&coordinator, async {}).await;
        assert_eq!(reason, ShutdownReason::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
