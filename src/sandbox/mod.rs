//! 沙箱：资源上限、访问策略、确认闸门、执行器与审计记录

pub mod context;
pub mod executor;
pub mod gate;
pub mod limits;
pub mod record;

pub use context::{SandboxContext, UsageMeter};
pub use executor::{ExecutionOutcome, ExecutionRequest, SandboxExecutor};
pub use gate::ConfirmationGate;
pub use limits::{ResourceLimits, SandboxPolicy};
pub use record::{ExecutionExit, ExecutionRecord, ResourceUsage};
