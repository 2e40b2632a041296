//! 确认闸门：dangerous / requires_confirmation 的步骤在运行前等待外部批准
//!
//! 每个步骤一个 watch 通道；批准可以早于等待发生，等待方读到 true 立即返回。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::ToolFailure;

#[derive(Debug, Default)]
pub struct ConfirmationGate {
    approvals: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, step_id: &str) -> watch::Receiver<bool> {
        let mut approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
        approvals
            .entry(step_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// 记录批准；返回 false 表示此前已批准
    pub fn approve(&self, step_id: &str) -> bool {
        let mut approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
        let sender = approvals
            .entry(step_id.to_string())
            .or_insert_with(|| watch::channel(false).0);
        let first = !*sender.borrow();
        sender.send_replace(true);
        first
    }

    pub fn is_approved(&self, step_id: &str) -> bool {
        let approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
        approvals.get(step_id).map(|s| *s.borrow()).unwrap_or(false)
    }

    /// 等待批准，最多 deadline；超时返回 ConfirmationTimeout，取消返回 Cancelled
    pub async fn wait(
        &self,
        step_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ToolFailure> {
        let mut rx = self.channel(step_id);
        if *rx.borrow_and_update() {
            return Ok(());
        }
        tracing::info!(step_id = %step_id, "waiting for confirmation");

        let approved = async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow_and_update() {
                    return true;
                }
            }
        };

        tokio::select! {
            r = tokio::time::timeout(deadline, approved) => match r {
                Ok(true) => Ok(()),
                Ok(false) => Err(ToolFailure::Cancelled),
                Err(_) => Err(ToolFailure::ConfirmationTimeout(step_id.to_string())),
            },
            _ = cancel.cancelled() => Err(ToolFailure::Cancelled),
        }
    }

    /// 步骤结束后清理
    pub fn clear(&self, step_id: &str) {
        let mut approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
        approvals.remove(step_id);
    }

    /// 仍保留批准状态的步骤数
    pub fn tracked_steps(&self) -> usize {
        self.approvals.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
