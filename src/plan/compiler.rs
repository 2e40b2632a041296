//! 计划编译器：校验提交的步骤列表并编译为 DAG
//!
//! 校验失败时不产生任何副作用；成功后每一步得到 `{task_id}_step_{n}` 形式的 id，
//! 无依赖的步骤初始为 ready，其余为 pending。

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::EngineError;
use crate::plan::graph::PlanGraph;
use crate::plan::types::*;
use crate::tools::ToolRegistry;

/// 编译结果：尚未持久化的任务与步骤
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub task: Task,
    pub steps: Vec<Step>,
    pub graph: PlanGraph,
}

impl CompiledPlan {
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }
}

pub struct PlanCompiler {
    registry: Arc<ToolRegistry>,
    default_max_retries: u32,
}

impl PlanCompiler {
    pub fn new(registry: Arc<ToolRegistry>, default_max_retries: u32) -> Self {
        Self {
            registry,
            default_max_retries,
        }
    }

    pub fn compile(&self, submission: TaskSubmission) -> Result<CompiledPlan, EngineError> {
        if submission.steps.is_empty() {
            return Err(EngineError::PlanInvalid("plan has no steps".into()));
        }
        if submission.user_id.trim().is_empty() {
            return Err(EngineError::PlanInvalid("user_id is required".into()));
        }

        let task_id = match submission.task_id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::PlanInvalid("task_id cannot be empty".into()))
            }
            Some(id) => id,
            None => format!("task_{}", uuid::Uuid::new_v4().simple()),
        };

        // 工具存在性与描述
        let mut descriptors = Vec::with_capacity(submission.steps.len());
        for spec in &submission.steps {
            let descriptor = self
                .registry
                .describe(&spec.tool_name)
                .ok_or_else(|| EngineError::UnknownTool(spec.tool_name.clone()))?;
            descriptor.resource_limits.validate().map_err(|e| {
                EngineError::PlanInvalid(format!("tool '{}' has invalid limits: {e}", descriptor.name))
            })?;
            descriptors.push(descriptor);
        }

        let step_ids: Vec<StepId> = (0..submission.steps.len())
            .map(|i| format!("{task_id}_step_{}", i + 1))
            .collect();

        let mut keys: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in submission.steps.iter().enumerate() {
            if let Some(key) = spec.key.as_deref() {
                if keys.insert(key, i).is_some() {
                    return Err(EngineError::PlanInvalid(format!("duplicate step key '{key}'")));
                }
            }
        }

        let mut dependencies: Vec<Vec<StepId>> = Vec::with_capacity(submission.steps.len());
        for (i, spec) in submission.steps.iter().enumerate() {
            let mut deps: Vec<StepId> = Vec::new();
            for dep_ref in &spec.dependency_refs {
                let target = match dep_ref {
                    DependencyRef::Index(idx) if *idx < step_ids.len() => *idx,
                    DependencyRef::Key(key) if keys.contains_key(key.as_str()) => keys[key.as_str()],
                    other => {
                        return Err(EngineError::PlanInvalid(format!(
                            "step {} references unknown dependency '{other}'",
                            i + 1
                        )))
                    }
                };
                if target == i {
                    return Err(EngineError::PlanInvalid(format!("step {} depends on itself", i + 1)));
                }
                let dep_id = &step_ids[target];
                if !deps.contains(dep_id) {
                    deps.push(dep_id.clone());
                }
            }
            dependencies.push(deps);
        }

        let mut graph = PlanGraph::new();
        for (id, deps) in step_ids.iter().zip(&dependencies) {
            graph.add_node(id.clone(), deps.clone());
        }
        if let Err(cycle) = graph.topological_order() {
            return Err(EngineError::PlanInvalid(format!(
                "dependency cycle among steps: {}",
                cycle.involved.join(", ")
            )));
        }

        let now = now_millis();
        let task = Task {
            id: task_id.clone(),
            user_id: submission.user_id,
            title: submission.title,
            description: submission.description,
            status: TaskStatus::Pending,
            priority: submission.priority,
            progress_percent: 0,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        };

        let steps = submission
            .steps
            .into_iter()
            .zip(descriptors)
            .zip(step_ids.into_iter().zip(dependencies))
            .enumerate()
            .map(|(seq, ((spec, descriptor), (id, deps)))| Step {
                id,
                task_id: task_id.clone(),
                seq,
                name: spec.name.or(spec.key),
                tool_name: spec.tool_name,
                input_parameters: spec.input_parameters,
                status: if deps.is_empty() {
                    StepStatus::Ready
                } else {
                    StepStatus::Pending
                },
                dependency_ids: deps,
                retry_count: 0,
                max_retries: descriptor.max_retries.unwrap_or(self.default_max_retries),
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
                version: 0,
            })
            .collect();

        tracing::debug!(task_id = %task.id, steps = graph.len(), "plan compiled");
        Ok(CompiledPlan { task, steps, graph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, ToolDescriptor};
    use serde_json::json;

    fn compiler() -> PlanCompiler {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register_as(
            ToolDescriptor::new("web_search", "search stub").retries(5),
            Arc::new(EchoTool),
        );
        PlanCompiler::new(Arc::new(registry), 2)
    }

    fn echo() -> StepSpec {
        StepSpec::new("echo", json!({"text": "hi"}))
    }

    #[test]
    fn test_compile_assigns_ids_and_initial_status() {
        let plan = compiler()
            .compile(
                TaskSubmission::new("u1", "demo")
                    .with_id("t1")
                    .step(echo())
                    .step(StepSpec::new("web_search", json!({})).after(0))
                    .step(echo().after(0).after(1).after(0)),
            )
            .unwrap();

        assert_eq!(plan.step_ids(), vec!["t1_step_1", "t1_step_2", "t1_step_3"]);
        assert_eq!(plan.steps[0].status, StepStatus::Ready);
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
        assert_eq!(plan.steps[1].max_retries, 5);
        assert_eq!(plan.steps[0].max_retries, 2);
        // 重复引用去重
        assert_eq!(plan.steps[2].dependency_ids, vec!["t1_step_1", "t1_step_2"]);
        assert_eq!(plan.task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_compile_generates_task_id() {
        let plan = compiler().compile(TaskSubmission::new("u1", "demo").step(echo())).unwrap();
        assert!(plan.task.id.starts_with("task_"));
        assert_eq!(plan.steps[0].id, format!("{}_step_1", plan.task.id));
    }

    #[test]
    fn test_compile_resolves_keys() {
        let plan = compiler()
            .compile(
                TaskSubmission::new("u1", "demo")
                    .with_id("t1")
                    .step(echo().key("fetch"))
                    .step(echo().depends_on(DependencyRef::Key("fetch".into()))),
            )
            .unwrap();
        assert_eq!(plan.steps[1].dependency_ids, vec!["t1_step_1"]);
        assert_eq!(plan.steps[0].name.as_deref(), Some("fetch"));
    }

    #[test]
    fn test_compile_rejects_cycle() {
        let err = compiler()
            .compile(
                TaskSubmission::new("u1", "cycle")
                    .step(echo().after(1))
                    .step(echo().after(0)),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PlanInvalid(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_compile_rejects_unknown_tool() {
        let err = compiler()
            .compile(TaskSubmission::new("u1", "x").step(StepSpec::new("rm_rf", json!({}))))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTool(name) if name == "rm_rf"));
    }

    #[test]
    fn test_compile_rejects_malformed_plans() {
        let c = compiler();
        assert!(matches!(
            c.compile(TaskSubmission::new("u1", "empty")),
            Err(EngineError::PlanInvalid(_))
        ));
        assert!(matches!(
            c.compile(TaskSubmission::new("u1", "self").step(echo().after(0))),
            Err(EngineError::PlanInvalid(_))
        ));
        assert!(matches!(
            c.compile(TaskSubmission::new("u1", "oob").step(echo().after(3))),
            Err(EngineError::PlanInvalid(_))
        ));
        assert!(matches!(
            c.compile(
                TaskSubmission::new("u1", "dup")
                    .step(echo().key("a"))
                    .step(echo().key("a"))
            ),
            Err(EngineError::PlanInvalid(_))
        ));
        assert!(matches!(
            c.compile(TaskSubmission::new("", "anon").step(echo())),
            Err(EngineError::PlanInvalid(_))
        ));
    }
}
