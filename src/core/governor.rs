//! 资源调控：全局 + 单用户两级执行槽位
//!
//! 两级信号量：先取用户池再取全局池（固定顺序，不会死锁）；tokio Semaphore 按请求顺序排队，
//! 不会饿死早到的请求。SlotGrant 被 drop 时两个池同时归还。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::GovernorSection;
use crate::core::GovernorError;

/// 一个已授予的执行槽位，持有两个池各一个许可
#[derive(Debug)]
pub struct SlotGrant {
    user_id: String,
    _user: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl SlotGrant {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// 资源调控器
#[derive(Debug)]
pub struct ResourceGovernor {
    global: Arc<Semaphore>,
    global_slots: usize,
    per_user_slots: usize,
    users: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ResourceGovernor {
    pub fn new(global_slots: usize, per_user_slots: usize) -> Self {
        let global_slots = global_slots.max(1);
        Self {
            global: Arc::new(Semaphore::new(global_slots)),
            global_slots,
            per_user_slots: per_user_slots.max(1),
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &GovernorSection) -> Self {
        Self::new(cfg.global_slots, cfg.per_user_slots)
    }

    fn user_pool(&self, user_id: &str) -> Arc<Semaphore> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_user_slots)))
            .clone()
    }

    /// 等待两个池都有空位后各扣一个；超过 wait 返回 Timeout
    pub async fn acquire(&self, user_id: &str, wait: Duration) -> Result<SlotGrant, GovernorError> {
        let user_pool = self.user_pool(user_id);
        let global = Arc::clone(&self.global);

        let acquire_both = async move {
            let user = user_pool.acquire_owned().await.map_err(|_| GovernorError::Closed)?;
            let global = global.acquire_owned().await.map_err(|_| GovernorError::Closed)?;
            Ok::<_, GovernorError>((user, global))
        };

        match tokio::time::timeout(wait, acquire_both).await {
            Ok(Ok((user, global))) => {
                tracing::debug!(user_id = %user_id, available = self.global.available_permits(), "slot granted");
                Ok(SlotGrant {
                    user_id: user_id.to_string(),
                    _user: user,
                    _global: global,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GovernorError::Timeout(wait)),
        }
    }

    /// 显式归还槽位（等价于 drop grant）
    pub fn release(&self, grant: SlotGrant) {
        tracing::debug!(user_id = %grant.user_id, "slot released");
        drop(grant);
    }

    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }

    pub fn global_slots(&self) -> usize {
        self.global_slots
    }

    /// 关闭后所有等待中与之后的 acquire 都返回 Closed
    pub fn close(&self) {
        self.global.close();
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        for pool in users.values() {
            pool.close();
        }
    }
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::from_config(&GovernorSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_both_pools() {
        let governor = ResourceGovernor::new(2, 1);
        let grant = governor.acquire("alice", Duration::from_millis(50)).await.unwrap();
        assert_eq!(grant.user_id(), "alice");
        assert_eq!(governor.available_global(), 1);
        assert!(governor.acquire("alice", Duration::from_millis(20)).await.is_err());

        governor.release(grant);
        assert_eq!(governor.available_global(), 2);
        let again = governor.acquire("alice", Duration::from_millis(20)).await.unwrap();
        assert_eq!(again.user_id(), "alice");
    }

    #[tokio::test]
    async fn test_per_user_pool_times_out() {
        let governor = ResourceGovernor::new(4, 1);
        let _held = governor.acquire("alice", Duration::from_millis(50)).await.unwrap();
        let err = governor
            .acquire("alice", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, GovernorError::Timeout(Duration::from_millis(30)));

        // 其他用户不受影响
        assert!(governor.acquire("bob", Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_global_pool_is_shared() {
        let governor = ResourceGovernor::new(1, 4);
        let held = governor.acquire("alice", Duration::from_millis(50)).await.unwrap();
        assert!(governor.acquire("bob", Duration::from_millis(30)).await.is_err());
        drop(held);
        assert!(governor.acquire("bob", Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let governor = Arc::new(ResourceGovernor::new(1, 1));
        let held = governor.acquire("alice", Duration::from_millis(50)).await.unwrap();

        let g = Arc::clone(&governor);
        let waiter = tokio::spawn(async move { g.acquire("alice", Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        governor.release(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_governor_rejects() {
        let governor = ResourceGovernor::new(1, 1);
        governor.close();
        let err = governor.acquire("alice", Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err, GovernorError::Closed);
    }
}
