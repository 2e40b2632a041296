//! 计划层：提交格式、依赖图与编译器

pub mod compiler;
pub mod graph;
pub mod types;

pub use compiler::{CompiledPlan, PlanCompiler};
pub use graph::{CycleDetected, PlanGraph};
pub use types::*;
