//! 失败恢复策略
//!
//! 根据 ToolFailure 的类别与已重试次数返回 RecoveryAction：瞬时失败在预算内按指数退避重试，
//! 永久失败直接失败，取消类失败不重试。

use std::time::Duration;

use crate::config::RetrySection;
use crate::core::{FailureClass, ToolFailure};

/// 调度器对一次失败执行应采取的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 退避 delay 后重新置为 ready
    Retry { delay: Duration },
    /// 步骤失败，依赖它的步骤级联 skipped
    Fail,
    /// 步骤取消（协作式），不重试
    Cancel,
}

/// 指数退避：delay = base * multiplier^retry_count，上限 max_delay
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RecoveryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }

    pub fn from_config(cfg: &RetrySection) -> Self {
        Self::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.multiplier,
        )
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// 第 retry_count 次重试前的等待时间（retry_count 从 0 开始）
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.powi(retry_count.min(32) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// retry_count 为该步骤已经消耗的重试次数
    pub fn handle(&self, failure: &ToolFailure, retry_count: u32, max_retries: u32) -> RecoveryAction {
        match failure.class() {
            FailureClass::Transient if retry_count < max_retries => RecoveryAction::Retry {
                delay: self.backoff(retry_count),
            },
            FailureClass::Transient | FailureClass::Permanent => RecoveryAction::Fail,
            FailureClass::Cancellation => match failure {
                ToolFailure::Cancelled => RecoveryAction::Cancel,
                _ => RecoveryAction::Fail,
            },
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0)
    }

    #[test]
    fn test_recovery_transient_within_budget() {
        let action = policy().handle(&ToolFailure::Timeout(50), 0, 2);
        assert_eq!(
            action,
            RecoveryAction::Retry {
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_recovery_transient_exhausted() {
        let action = policy().handle(&ToolFailure::SandboxInfraFailure("spawn".into()), 2, 2);
        assert_eq!(action, RecoveryAction::Fail);
    }

    #[test]
    fn test_recovery_permanent_never_retried() {
        let action = policy().handle(&ToolFailure::InvalidParameters("missing url".into()), 0, 5);
        assert_eq!(action, RecoveryAction::Fail);
    }

    #[test]
    fn test_recovery_cancellation() {
        assert_eq!(policy().handle(&ToolFailure::Cancelled, 0, 5), RecoveryAction::Cancel);
        assert_eq!(
            policy().handle(&ToolFailure::ConfirmationTimeout("s1".into()), 0, 5),
            RecoveryAction::Fail
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(10), Duration::from_millis(1000));
    }
}
