pub mod llm_agent;
pub mod prompts;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::agent_engine::memory::StepRecord;
use crate::agent_engine::state::ToolCall;
use crate::browser::Observation;
use crate::errors::PilotResult;

/// Decision-maker specialisations picked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Navigator,
    Extractor,
    Reflector,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Navigator => "navigator",
            Role::Extractor => "extractor",
            Role::Reflector => "reflector",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form completions that are not action decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Summarize,
    Extract,
    Answer,
}

/// Everything a decision-maker sees for one step.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub goal: String,
    pub memory_summary: String,
    pub recent_facts: Vec<String>,
    pub recent_steps: Vec<StepRecord>,
    pub observation: Observation,
    pub browser_only: bool,
    pub has_browser_action: bool,
    /// Goal URLs in the order they must be visited; empty when no ordering applies.
    pub ordered_goal_urls: Vec<String>,
    pub visited_goal_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub tool_call: Option<ToolCall>,
    pub rationale: String,
}

impl Decision {
    pub fn act(call: ToolCall, rationale: impl Into<String>) -> Self {
        Self {
            tool_call: Some(call),
            rationale: rationale.into(),
        }
    }

    pub fn none(rationale: impl Into<String>) -> Self {
        Self {
            tool_call: None,
            rationale: rationale.into(),
        }
    }
}

/// The Decision Interface. Implementations may return no action.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, role: Role, ctx: &DecisionContext) -> PilotResult<Decision>;

    async fn complete(&self, purpose: Purpose, system: &str, user: &str) -> PilotResult<String>;
}
