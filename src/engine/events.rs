//! 任务事件：按任务分通道的有序事件流
//!
//! 每个任务一个 broadcast 通道，seq 由发布方统一递增（同一任务内因而单调递增，重试后继续增长）；事件只由 StateTracker 在持有任务锁时发布，
//! 因此同一任务的事件顺序与提交顺序一致。订阅者先拿到快照，再接收之后的实时事件；
//! 缓冲区满时慢订阅者丢失实时事件（Lagged），不会阻塞发布方。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::plan::{Step, Task, TaskId};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 计划编译并持久化完成
    TaskAccepted,
    /// 步骤状态变化
    StepStatus,
    /// 任务聚合状态或进度变化
    TaskStatus,
}

/// 推送给订阅者的事件
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    /// 任务内单调递增
    pub seq: u64,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub status: String,
    pub progress_percent: u8,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// 订阅时的状态快照
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task: Task,
    pub steps: Vec<Step>,
    /// 快照对应的最后一个事件序号，之后的实时事件 seq 都大于它
    pub last_seq: u64,
}

/// 待发布的事件（seq 与时间戳由发布方填写）
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub step_id: Option<String>,
    pub status: String,
    pub progress_percent: u8,
    pub detail: Option<Value>,
}

type Observers = Arc<Mutex<HashMap<String, TaskId>>>;

pub struct EventPublisher {
    buffer: usize,
    /// 只保存未结束任务的通道，任务结束即移除
    channels: Mutex<HashMap<TaskId, broadcast::Sender<TaskEvent>>>,
    seq: AtomicU64,
    observers: Observers,
}

impl EventPublisher {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            channels: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            observers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 为任务打开（或重新打开）事件通道
    pub fn open(&self, task_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0);
    }

    /// 关闭通道：已订阅者读完缓冲后收到流结束
    pub fn close(&self, task_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(task_id);
    }

    /// 分配 seq 并广播；通道已关闭或没有订阅者时事件直接丢弃
    pub fn publish(&self, task_id: &str, draft: EventDraft) -> TaskEvent {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let event = TaskEvent {
            task_id: task_id.to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            event_type: draft.event_type,
            step_id: draft.step_id,
            status: draft.status,
            progress_percent: draft.progress_percent,
            timestamp: crate::plan::now_millis(),
            detail: draft.detail,
        };
        if let Some(tx) = channels.get(task_id) {
            let _ = tx.send(event.clone());
        }
        event
    }

    /// 已分配的最大 seq；任务锁内取到的值小于该任务之后的所有事件
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// 仍打开的任务通道数
    pub fn open_channels(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 调用方需保证快照与订阅之间没有新事件提交（StateTracker 在任务锁内调用）
    pub fn subscribe(&self, snapshot: TaskSnapshot) -> Subscription {
        let task_id = snapshot.task.id.clone();
        let rx = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.get(&task_id).map(|tx| tx.subscribe())
        };
        let observer_id = format!("obs_{}", uuid::Uuid::new_v4().simple());
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(observer_id.clone(), task_id.clone());
        tracing::debug!(task_id = %task_id, observer_id = %observer_id, "observer subscribed");

        Subscription {
            observer_id,
            task_id,
            snapshot,
            rx,
            missed: 0,
            observers: Arc::clone(&self.observers),
        }
    }

    /// 取消订阅；之后该订阅的 next() 返回 None
    pub fn unsubscribe(&self, task_id: &str, observer_id: &str) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        match observers.get(observer_id) {
            Some(t) if t == task_id => {
                observers.remove(observer_id);
                true
            }
            _ => false,
        }
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.values().filter(|t| t.as_str() == task_id).count()
    }
}

/// 一个观察者对某任务的订阅；drop 时自动注销
pub struct Subscription {
    pub observer_id: String,
    pub task_id: TaskId,
    pub snapshot: TaskSnapshot,
    rx: Option<broadcast::Receiver<TaskEvent>>,
    missed: u64,
    observers: Observers,
}

impl Subscription {
    fn is_registered(&self) -> bool {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.contains_key(&self.observer_id)
    }

    /// 下一个实时事件；任务事件流结束或已取消订阅时返回 None
    pub async fn next(&mut self) -> Option<TaskEvent> {
        loop {
            if !self.is_registered() {
                self.rx = None;
            }
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) if event.seq <= self.snapshot.last_seq => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::warn!(task_id = %self.task_id, observer_id = %self.observer_id, missed = n, "slow observer dropped events");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// 因缓冲区溢出而丢失的事件数
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.remove(&self.observer_id);
    }
}
