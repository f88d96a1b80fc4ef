use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::agent_engine::memory::StepStatus;
use crate::scheduler::task::TaskStatus;

pub const EVENT_LOG_CAPACITY: usize = 200;

/// One executed step as reported to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: u32,
    pub tool: String,
    pub reason: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: StepStatus,
    pub error: Option<String>,
    /// JSON of the tool output, clipped to 300 chars.
    pub output: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentMessage {
    Status {
        status: TaskStatus,
    },
    Log(StepLog),
    NeedsConfirmation {
        step: u32,
        tool: String,
        summary: String,
        reason: String,
        args: Map<String, Value>,
    },
    NeedsUserInput {
        question: String,
    },
    Result {
        result: String,
    },
    Error {
        error: String,
        hint: Option<String>,
    },
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Status { .. } => "status",
            AgentMessage::Log(_) => "log",
            AgentMessage::NeedsConfirmation { .. } => "needs_confirmation",
            AgentMessage::NeedsUserInput { .. } => "needs_user_input",
            AgentMessage::Result { .. } => "result",
            AgentMessage::Error { .. } => "error",
        }
    }

    /// A status event after which the task never emits again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentMessage::Status { status } if status.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(flatten)]
    pub message: AgentMessage,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Callback a session uses to publish events without knowing where they go.
pub type EventSink = Arc<dyn Fn(AgentMessage) + Send + Sync>;

/// Per-task event log: a bounded ring of past events plus live fan-out.
pub struct EventLog {
    backlog: Mutex<VecDeque<TaskEvent>>,
    tx: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            backlog: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TaskEvent>> {
        self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, message: AgentMessage) -> TaskEvent {
        let event = TaskEvent {
            message,
            timestamp: chrono::Utc::now(),
        };
        let mut backlog = self.lock();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(event.clone());
        // No live subscribers is fine; the backlog keeps the event.
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn snapshot(&self) -> Vec<TaskEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replays the backlog, then follows live events. Subscribing under the
    /// backlog lock means no event is missed or seen twice.
    pub fn subscribe(&self) -> EventSubscription {
        let backlog = self.lock();
        let rx = self.tx.subscribe();
        EventSubscription {
            replay: backlog.iter().cloned().collect(),
            rx,
            finished: false,
        }
    }
}

pub struct EventSubscription {
    replay: VecDeque<TaskEvent>,
    rx: broadcast::Receiver<TaskEvent>,
    finished: bool,
}

impl EventSubscription {
    /// Next event, or `None` once a terminal status was delivered.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }
        let event = match self.replay.pop_front() {
            Some(event) => event,
            None => loop {
                match self.rx.recv().await {
                    Ok(event) => break event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
        };
        if event.message.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }
}
