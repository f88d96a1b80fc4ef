use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_engine::signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingConfirm,
    WaitingUser,
    Done,
    Stopped,
    Error,
}

impl TaskStatus {
    /// Holds (or is about to hold) the shared browser.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::WaitingConfirm | TaskStatus::WaitingUser
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TaskStatus::WaitingConfirm | TaskStatus::WaitingUser)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Stopped | TaskStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::WaitingConfirm => "waiting_confirm",
            TaskStatus::WaitingUser => "waiting_user",
            TaskStatus::Done => "done",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Agent,
    Direct,
}

impl TaskMode {
    /// Browser-only tasks always use the agent. Otherwise prompts that ask to
    /// stay out of the browser, or show no browser intent, are answered directly.
    pub fn for_prompt(prompt: &str, browser_only: bool) -> Self {
        if browser_only {
            return TaskMode::Agent;
        }
        if signals::force_direct(prompt) || !signals::is_browser_task(prompt) {
            TaskMode::Direct
        } else {
            TaskMode::Agent
        }
    }
}

/// Per-task knobs accepted at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default = "default_true")]
    pub browser_only: bool,
    #[serde(default)]
    pub search_engine: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// False runs against the real profile in `browser.unsafe_user_data_dir`.
    #[serde(default = "default_true")]
    pub safe_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            browser_only: true,
            search_engine: None,
            provider: None,
            model: None,
            safe_mode: true,
        }
    }
}

impl TaskOptions {
    /// The task picked its own provider or model.
    pub fn is_pinned(&self) -> bool {
        self.provider.as_deref().map_or(false, |p| !p.trim().is_empty())
            || self.model.as_deref().map_or(false, |m| !m.trim().is_empty())
    }
}

/// Immutable description of a submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub mode: TaskMode,
    pub options: TaskOptions,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: impl Into<String>, options: TaskOptions) -> Self {
        let prompt = prompt.into();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            mode: TaskMode::for_prompt(&prompt, options.browser_only),
            prompt,
            options,
            created_at: Utc::now(),
        }
    }
}

/// What `get task` returns.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub browser_only: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
