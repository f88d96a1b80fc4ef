use serde_json::json;

use crate::agent_engine::memory::MemoryState;
use crate::agent_engine::signals::{self, Language};
use crate::agent_engine::state::{ToolCall, ToolName};
use crate::browser::Observation;

/// Outcome of running the guards over a proposed action.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Proceed,
    Replace { call: ToolCall, reason: String },
    Pause { question: String },
}

/// What the guards look at for one proposed action.
pub struct GuardInput<'a> {
    pub goal: &'a str,
    pub call: &'a ToolCall,
    pub observation: &'a Observation,
    pub memory: &'a MemoryState,
    /// Stall counter reached the no-progress limit.
    pub stalled: bool,
    /// The fallback was already used in this stall episode.
    pub fallback_used: bool,
    pub language: Language,
}

/// Runs loop, progress, off-task and search-box guards in that order.
/// Session-control tools (`ask_user`, `finish`, `stop_task`) and unknown
/// names always pass.
pub fn check(input: &GuardInput<'_>) -> GuardVerdict {
    match input.call.tool() {
        None | Some(ToolName::AskUser | ToolName::Finish | ToolName::StopTask) => {
            return GuardVerdict::Proceed
        }
        Some(_) => {}
    }
    if let Some(verdict) = loop_guard(input) {
        return verdict;
    }
    if let Some(verdict) = progress_guard(input) {
        return verdict;
    }
    if let Some(verdict) = off_task_guard(input) {
        return verdict;
    }
    if let Some(verdict) = search_box_guard(input) {
        return verdict;
    }
    GuardVerdict::Proceed
}

/// A navigate to the URL the last two recorded steps already show.
fn loop_guard(input: &GuardInput<'_>) -> Option<GuardVerdict> {
    if input.call.tool() != Some(ToolName::Navigate) {
        return None;
    }
    let target = signals::normalize_url(input.call.str_arg("url")?)?;
    let recent = input.memory.recent_steps(2);
    if recent.len() < 2 {
        return None;
    }
    let stuck = recent
        .iter()
        .all(|s| signals::normalize_url(&s.url).as_deref() == Some(target.as_str()));
    if !stuck {
        return None;
    }
    tracing::warn!(url = %target, "navigation loop detected");
    let question = match input.language {
        Language::En => format!(
            "I keep navigating to {target} without getting further. How should I continue?"
        ),
        Language::Ru => format!(
            "Я повторно открываю {target} и не продвигаюсь дальше. Как продолжить?"
        ),
    };
    Some(GuardVerdict::Pause { question })
}

fn progress_guard(input: &GuardInput<'_>) -> Option<GuardVerdict> {
    if !input.stalled {
        return None;
    }
    let repeats_last = input
        .memory
        .last_step()
        .map(|s| s.tool == input.call.name && s.args == input.call.arguments)
        .unwrap_or(false);
    if repeats_last {
        tracing::warn!(tool = %input.call.name, "identical action repeated without progress");
        let question = match input.language {
            Language::En => format!(
                "Repeating '{}' is not changing the page. What should I do next?",
                input.call.name
            ),
            Language::Ru => format!(
                "Повтор действия '{}' не меняет страницу. Что сделать дальше?",
                input.call.name
            ),
        };
        return Some(GuardVerdict::Pause { question });
    }
    if !input.fallback_used {
        if let Some(call) = fallback_action(input.goal, input.observation, input.memory) {
            return Some(GuardVerdict::Replace {
                call,
                reason: "No progress; trying a fallback action.".into(),
            });
        }
    }
    let question = match input.language {
        Language::En => "No progress is being made on this page. Please advise how to continue.",
        Language::Ru => "На этой странице нет прогресса. Подскажите, как продолжить.",
    };
    Some(GuardVerdict::Pause {
        question: question.to_string(),
    })
}

fn off_task_guard(input: &GuardInput<'_>) -> Option<GuardVerdict> {
    if signals::goal_wants_informational(input.goal) {
        return None;
    }
    let off_task = match input.call.tool()? {
        ToolName::Navigate => input
            .call
            .str_arg("url")
            .map(signals::is_informational_url)
            .unwrap_or(false),
        ToolName::Click => signals::is_informational_label(&input.call.target_text(input.observation)),
        _ => false,
    };
    if !off_task {
        return None;
    }
    tracing::info!(tool = %input.call.name, "blocked informational-page action");
    let call = fallback_action(input.goal, input.observation, input.memory)
        .unwrap_or_else(|| ToolCall::new("scroll", json!({"direction": "down", "amount": 600})));
    Some(GuardVerdict::Replace {
        call,
        reason: "Skipped an about/privacy/terms page the goal did not ask for.".into(),
    })
}

fn search_box_guard(input: &GuardInput<'_>) -> Option<GuardVerdict> {
    if input.call.tool()? != ToolName::Click || !signals::is_search_landing(&input.observation.url) {
        return None;
    }
    let call = type_into_search(input.goal, input.observation)?;
    Some(GuardVerdict::Replace {
        call,
        reason: "Typing the query into the search field instead of clicking.".into(),
    })
}

fn type_into_search(goal: &str, observation: &Observation) -> Option<ToolCall> {
    let query = signals::goal_query(goal);
    if query.is_empty() {
        return None;
    }
    let field = observation
        .interactive_elements
        .iter()
        .find(|e| signals::looks_like_search_field(e))?;
    Some(ToolCall::new(
        "type",
        json!({"element_id": field.id, "text": query, "press_enter": true}),
    ))
}

/// Deterministic, LLM-free next action: search the goal query when a search
/// field is visible, else scroll down once, else go back.
pub fn fallback_action(goal: &str, observation: &Observation, memory: &MemoryState) -> Option<ToolCall> {
    let last = memory.last_step();
    if let Some(call) = type_into_search(goal, observation) {
        let already_typed = last
            .map(|s| s.tool == call.name && s.args == call.arguments)
            .unwrap_or(false);
        if !already_typed {
            return Some(call);
        }
    }
    let has_content = !observation.visible_text.trim().is_empty();
    if has_content && last.map(|s| s.tool.as_str()) != Some("scroll") {
        return Some(ToolCall::new("scroll", json!({"direction": "down", "amount": 600})));
    }
    if memory.len() > 1 && last.map(|s| s.tool.as_str()) != Some("back") {
        return Some(ToolCall::new("back", json!({})));
    }
    None
}
