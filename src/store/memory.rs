//! 内存任务存储：按任务分区，每个分区一把锁，没有全局写锁

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::plan::{Step, Task};
use crate::sandbox::{ExecutionExit, ExecutionRecord, ResourceUsage};
use crate::store::{StoreError, TaskFilter, TaskStore};

#[derive(Debug)]
struct Partition {
    task: Task,
    /// 按 seq 排列
    steps: Vec<Step>,
    records: Vec<ExecutionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    partitions: RwLock<HashMap<String, Arc<Mutex<Partition>>>>,
    /// step_id / record_id -> task_id
    step_index: RwLock<HashMap<String, String>>,
    record_index: RwLock<HashMap<String, String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, task_id: &str) -> Option<Arc<Mutex<Partition>>> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.get(task_id).cloned()
    }

    fn all_partitions(&self) -> Vec<Arc<Mutex<Partition>>> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.values().cloned().collect()
    }

    fn owner_of(index: &RwLock<HashMap<String, String>>, id: &str) -> Option<String> {
        index.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}

fn lock(p: &Mutex<Partition>) -> std::sync::MutexGuard<'_, Partition> {
    p.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        if partitions.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        {
            let index = self.step_index.read().unwrap_or_else(|e| e.into_inner());
            if let Some(step) = steps.iter().find(|s| index.contains_key(&s.id)) {
                return Err(StoreError::Duplicate(step.id.clone()));
            }
        }

        let mut sorted = steps.to_vec();
        sorted.sort_by_key(|s| s.seq);
        partitions.insert(
            task.id.clone(),
            Arc::new(Mutex::new(Partition {
                task: task.clone(),
                steps: sorted,
                records: Vec::new(),
            })),
        );

        let mut index = self.step_index.write().unwrap_or_else(|e| e.into_inner());
        for step in steps {
            index.insert(step.id.clone(), task.id.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.partition(task_id).map(|p| lock(&p).task.clone()))
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError> {
        let Some(task_id) = Self::owner_of(&self.step_index, step_id) else {
            return Ok(None);
        };
        Ok(self
            .partition(&task_id)
            .and_then(|p| lock(&p).steps.iter().find(|s| s.id == step_id).cloned()))
    }

    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .partition(task_id)
            .map(|p| lock(&p).steps.clone())
            .unwrap_or_default())
    }

    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<Task, StoreError> {
        let p = self
            .partition(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        let mut part = lock(&p);
        if part.task.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.clone(),
                expected: expected_version,
                found: part.task.version,
            });
        }
        let mut stored = task.clone();
        stored.version = expected_version + 1;
        part.task = stored.clone();
        Ok(stored)
    }

    async fn update_step(&self, step: &Step, expected_version: u64) -> Result<Step, StoreError> {
        let p = self
            .partition(&step.task_id)
            .ok_or_else(|| StoreError::NotFound(step.task_id.clone()))?;
        let mut part = lock(&p);
        let slot = part
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or_else(|| StoreError::NotFound(step.id.clone()))?;
        if slot.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: "step",
                id: step.id.clone(),
                expected: expected_version,
                found: slot.version,
            });
        }
        let mut stored = step.clone();
        stored.version = expected_version + 1;
        *slot = stored.clone();
        Ok(stored)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .all_partitions()
            .iter()
            .map(|p| lock(p).task.clone())
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn start_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let p = self
            .partition(&record.task_id)
            .ok_or_else(|| StoreError::NotFound(record.task_id.clone()))?;
        {
            let mut index = self.record_index.write().unwrap_or_else(|e| e.into_inner());
            if index.contains_key(&record.id) {
                return Err(StoreError::Duplicate(record.id.clone()));
            }
            index.insert(record.id.clone(), record.task_id.clone());
        }
        lock(&p).records.push(record.clone());
        Ok(())
    }

    async fn finish_record(
        &self,
        record_id: &str,
        exit: ExecutionExit,
        usage: ResourceUsage,
        ended_at: i64,
    ) -> Result<ExecutionRecord, StoreError> {
        let task_id = Self::owner_of(&self.record_index, record_id)
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        let p = self
            .partition(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
        let mut part = lock(&p);
        let record = part
            .records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        if record.is_finalized() {
            return Err(StoreError::AlreadyFinalized(record_id.to_string()));
        }
        record.exit_status = Some(exit);
        record.resource_usage = usage;
        record.ended_at = Some(ended_at);
        Ok(record.clone())
    }

    async fn list_records(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records = self
            .partition(task_id)
            .map(|p| lock(&p).records.clone())
            .unwrap_or_default();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn tool_records(&self, tool_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .all_partitions()
            .iter()
            .flat_map(|p| {
                lock(p)
                    .records
                    .iter()
                    .filter(|r| r.tool_name == tool_name)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }
}
