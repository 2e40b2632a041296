//! 步骤依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序（Kahn）；所有遍历都按步骤创建顺序，
//! 保证就绪步骤的派发顺序稳定。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::plan::types::{Step, StepId, StepStatus};

/// 步骤依赖图
#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    /// 创建顺序
    order: Vec<StepId>,
    /// 步骤 ID -> 它依赖的步骤
    dependencies: HashMap<StepId, Vec<StepId>>,
    /// 步骤 ID -> 依赖它的步骤
    dependents: HashMap<StepId, Vec<StepId>>,
}

/// 拓扑排序失败：仍有步骤入度不为 0，即存在环
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleDetected {
    /// 参与环（或被环阻塞）的步骤，按创建顺序
    pub involved: Vec<StepId>,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按创建顺序加入一个节点；依赖边可以指向尚未加入的节点
    pub fn add_node(&mut self, id: impl Into<StepId>, deps: Vec<StepId>) {
        let id = id.into();
        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        self.dependents.entry(id.clone()).or_default();
        self.dependencies.insert(id.clone(), deps);
        self.order.push(id);
    }

    /// 从已持久化的步骤重建（按 seq 排序）
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut sorted: Vec<&Step> = steps.iter().collect();
        sorted.sort_by_key(|s| s.seq);
        let mut graph = Self::new();
        for step in sorted {
            graph.add_node(step.id.clone(), step.dependency_ids.clone());
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    pub fn dependencies(&self, id: &str) -> &[StepId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[StepId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kahn 拓扑排序；入度为 0 的节点按创建顺序出队
    pub fn topological_order(&self) -> Result<Vec<StepId>, CycleDetected> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());

            let mut unlocked: Vec<&str> = Vec::new();
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(dependent.as_str());
                    }
                }
            }
            unlocked.sort_by_key(|d| position.get(d).copied().unwrap_or(usize::MAX));
            queue.extend(unlocked);
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let done: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let involved = self
                .order
                .iter()
                .filter(|id| !done.contains(id.as_str()))
                .cloned()
                .collect();
            Err(CycleDetected { involved })
        }
    }

    /// 所有依赖都已完成、自身仍为 pending 的步骤（按创建顺序）
    pub fn promotable(&self, statuses: &HashMap<StepId, StepStatus>) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| statuses.get(id.as_str()) == Some(&StepStatus::Pending))
            .filter(|id| self.dependencies_completed(id, statuses))
            .cloned()
            .collect()
    }

    pub fn dependencies_completed(&self, id: &str, statuses: &HashMap<StepId, StepStatus>) -> bool {
        self.dependencies(id)
            .iter()
            .all(|dep| statuses.get(dep.as_str()) == Some(&StepStatus::Completed))
    }

    /// 传递依赖于 id 的全部步骤（BFS，不含自身，按创建顺序返回）
    pub fn descendants(&self, id: &str) -> Vec<StepId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        self.order
            .iter()
            .filter(|s| seen.contains(s.as_str()))
            .cloned()
            .collect()
    }
}
