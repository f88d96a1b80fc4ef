// Maps validated tool calls onto browser primitives.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::agent_engine::signals;
use crate::agent_engine::state::{ToolCall, ToolName};
use crate::agents::llm_agent::extract_json_object;
use crate::agents::prompts::EXTRACT_SYSTEM;
use crate::agents::{DecisionMaker, Purpose};
use crate::browser::{BrowserController, Observation, ScrollDirection};
use crate::errors::{PilotError, PilotResult};

const DEFAULT_SCROLL: i64 = 600;
const DEFAULT_WAIT_MS: u64 = 1000;
const MAX_WAIT_MS: u64 = 30_000;

pub struct ToolExecutor {
    controller: Arc<dyn BrowserController>,
    decider: Arc<dyn DecisionMaker>,
    screenshot_dir: PathBuf,
}

impl ToolExecutor {
    pub fn new(
        controller: Arc<dyn BrowserController>,
        decider: Arc<dyn DecisionMaker>,
        screenshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            decider,
            screenshot_dir: screenshot_dir.into(),
        }
    }

    /// Runs one action against `observation`, the page it was computed on.
    /// Returns a JSON payload describing the outcome.
    pub async fn execute(&self, call: &ToolCall, observation: &Observation) -> PilotResult<Value> {
        let tool = call
            .tool()
            .ok_or_else(|| PilotError::UnknownTool(call.name.clone()))?;
        tracing::debug!(tool = %tool, args = %serde_json::Value::Object(call.arguments.clone()), "executing tool");

        match tool {
            ToolName::Navigate => {
                let url = absolute_url(required(call, "url")?);
                self.controller.navigate(&url).await?;
                Ok(json!({ "url": url }))
            }
            ToolName::Snapshot => {
                let snapshot = self.controller.snapshot().await?;
                Ok(serde_json::to_value(snapshot)?)
            }
            ToolName::Click => {
                let target = call.element_target();
                if target.element_id.is_none() && target.strategy.is_none() {
                    return Err(PilotError::InvalidArguments(
                        "click needs element_id or click_strategy".into(),
                    ));
                }
                let clicked = self.controller.click(&target).await?;
                Ok(json!({ "clicked": clicked }))
            }
            ToolName::Type => {
                let text = call
                    .arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PilotError::InvalidArguments("type needs text".into()))?;
                let target = call.element_target();
                if target.element_id.is_none() && target.strategy.is_none() {
                    return Err(PilotError::InvalidArguments(
                        "type needs element_id or click_strategy".into(),
                    ));
                }
                let press_enter = match call.arguments.get("press_enter").and_then(Value::as_bool) {
                    Some(explicit) => explicit,
                    None => observation
                        .resolve(&target)
                        .map(signals::looks_like_search_field)
                        .unwrap_or(false),
                };
                let typed_into = self.controller.type_text(&target, text, press_enter).await?;
                Ok(json!({ "typed_into": typed_into, "press_enter": press_enter }))
            }
            ToolName::Scroll => {
                let direction = match call.str_arg("direction").map(str::to_lowercase).as_deref() {
                    Some("up") => ScrollDirection::Up,
                    _ => ScrollDirection::Down,
                };
                let amount = call
                    .arguments
                    .get("amount")
                    .and_then(Value::as_i64)
                    .filter(|a| *a > 0)
                    .unwrap_or(DEFAULT_SCROLL);
                self.controller.scroll(direction, amount).await?;
                Ok(json!({ "direction": direction, "amount": amount }))
            }
            ToolName::Wait => {
                let ms = call
                    .arguments
                    .get("ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WAIT_MS)
                    .min(MAX_WAIT_MS);
                self.controller.wait(ms).await?;
                Ok(json!({ "waited_ms": ms }))
            }
            ToolName::Back => {
                self.controller.back().await?;
                Ok(json!({}))
            }
            ToolName::Forward => {
                self.controller.forward().await?;
                Ok(json!({}))
            }
            ToolName::Extract => self.extract(call, observation).await,
            ToolName::Screenshot => {
                let label = call.str_arg("label").unwrap_or("screenshot");
                let path = self.screenshot(label).await?;
                Ok(json!({ "path": path }))
            }
            ToolName::AskUser | ToolName::Finish | ToolName::StopTask => Err(PilotError::InvalidArguments(
                format!("{tool} is handled by the session, not executed"),
            )),
        }
    }

    async fn extract(&self, call: &ToolCall, observation: &Observation) -> PilotResult<Value> {
        let schema = call.arguments.get("schema").cloned().unwrap_or_else(|| json!({}));
        let page = serde_json::to_string(observation)?;
        let user = format!("Schema:\n{schema}\n\nPage snapshot:\n{page}\n\nReturn JSON matching the schema.");
        let reply = self.decider.complete(Purpose::Extract, EXTRACT_SYSTEM, &user).await?;
        extract_json_object(&reply)
            .map(Value::Object)
            .ok_or_else(|| PilotError::Agent("extractor did not return a JSON object".into()))
    }

    /// Writes `shot_<utc stamp>_<label>.png` under the screenshot directory.
    pub async fn screenshot(&self, label: &str) -> PilotResult<PathBuf> {
        let path = artifact_path(&self.screenshot_dir, label);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.controller.screenshot(&path).await?;
        tracing::info!(path = %path.display(), "screenshot saved");
        Ok(path)
    }
}

fn required<'a>(call: &'a ToolCall, key: &str) -> PilotResult<&'a str> {
    call.str_arg(key)
        .ok_or_else(|| PilotError::InvalidArguments(format!("{} needs {key}", call.name)))
}

fn absolute_url(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("://") || lower.starts_with("about:") || lower.starts_with("data:") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

pub(crate) fn safe_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(40)
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "shot".to_string()
    } else {
        cleaned
    }
}

fn artifact_path(dir: &Path, label: &str) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("shot_{stamp}_{}.png", safe_label(label)))
}
