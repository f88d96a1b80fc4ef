use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::browser::{ClickStrategy, ElementTarget, Observation};

/// Lifecycle states of one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Running,
    WaitingConfirm,
    WaitingUser { question: String },
    Done { result: String },
    Stopped,
}

impl SessionState {
    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::WaitingConfirm | SessionState::WaitingUser { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done { .. } | SessionState::Stopped)
    }
}

/// A named action with arguments, as proposed by a decision-maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Non-object argument values are dropped rather than rejected.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            arguments,
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn tool(&self) -> Option<ToolName> {
        ToolName::parse(&self.name)
    }

    /// `element_id` (string or number) plus optional `click_strategy` hints.
    pub fn element_target(&self) -> ElementTarget {
        let element_id = self.arguments.get("element_id").and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let strategy = self
            .arguments
            .get("click_strategy")
            .cloned()
            .and_then(|v| serde_json::from_value::<ClickStrategy>(v).ok())
            .filter(|s| !s.is_empty());
        ElementTarget {
            element_id,
            strategy,
        }
    }

    /// Text a human would associate with the action's target: the resolved
    /// element's label followed by any strategy hints.
    pub fn target_text(&self, observation: &Observation) -> String {
        let target = self.element_target();
        let mut parts: Vec<String> = Vec::new();
        if let Some(element) = target.element_id.as_deref().and_then(|id| observation.element(id)) {
            parts.push(element.label());
        }
        if let Some(strategy) = &target.strategy {
            for hint in [&strategy.text, &strategy.name, &strategy.role].into_iter().flatten() {
                parts.push(hint.clone());
            }
        }
        parts
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The closed action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    Navigate,
    Snapshot,
    Click,
    Type,
    Scroll,
    Wait,
    Back,
    Forward,
    Extract,
    Screenshot,
    AskUser,
    Finish,
    StopTask,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        let tool = match name.trim() {
            "navigate" => ToolName::Navigate,
            "snapshot" => ToolName::Snapshot,
            "click" => ToolName::Click,
            "type" => ToolName::Type,
            "scroll" => ToolName::Scroll,
            "wait" => ToolName::Wait,
            "back" => ToolName::Back,
            "forward" => ToolName::Forward,
            "extract" => ToolName::Extract,
            "screenshot" | "take_screenshot" => ToolName::Screenshot,
            "ask_user" => ToolName::AskUser,
            "finish" => ToolName::Finish,
            "stop" | "stop_task" => ToolName::StopTask,
            _ => return None,
        };
        Some(tool)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Navigate => "navigate",
            ToolName::Snapshot => "snapshot",
            ToolName::Click => "click",
            ToolName::Type => "type",
            ToolName::Scroll => "scroll",
            ToolName::Wait => "wait",
            ToolName::Back => "back",
            ToolName::Forward => "forward",
            ToolName::Extract => "extract",
            ToolName::Screenshot => "take_screenshot",
            ToolName::AskUser => "ask_user",
            ToolName::Finish => "finish",
            ToolName::StopTask => "stop_task",
        }
    }

    /// Actions that change what the browser shows.
    pub fn is_browser_action(&self) -> bool {
        matches!(
            self,
            ToolName::Navigate
                | ToolName::Click
                | ToolName::Type
                | ToolName::Scroll
                | ToolName::Back
                | ToolName::Forward
        )
    }

    /// Pure history moves; they never count as acting on a page.
    pub fn is_navigational(&self) -> bool {
        matches!(self, ToolName::Navigate | ToolName::Back | ToolName::Forward)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action held back until the user confirms it.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub call: ToolCall,
    pub rationale: String,
    pub observation: Observation,
}
