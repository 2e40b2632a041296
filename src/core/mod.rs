//! 核心层：错误分类、失败恢复、资源调控、优雅关闭

pub mod error;
pub mod governor;
pub mod recovery;
pub mod shutdown;

pub use error::{EngineError, FailureClass, GovernorError, ToolFailure};
pub use governor::{ResourceGovernor, SlotGrant};
pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
