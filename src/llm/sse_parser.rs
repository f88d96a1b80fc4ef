use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::{PilotError, PilotResult};
use crate::llm::types::{FunctionCall, LlmResponse, WireToolCall};

/// One meaningful piece of an OpenAI-compatible streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum SseDelta {
    Content(String),
    ToolCalls(Vec<ToolCallFragment>),
    Done,
}

/// Partial tool call; fragments sharing an `index` are concatenated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallFragment {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FragmentFunction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FragmentFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

/// Parses a raw SSE line. Returns None for keep-alives, comments and
/// frames that carry nothing we accumulate (e.g. role-only deltas).
pub fn parse_sse_line(line: &str) -> PilotResult<Option<SseDelta>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(Some(SseDelta::Done));
    }

    let frame: StreamFrame =
        serde_json::from_str(data).map_err(|e| PilotError::SseParsing(e.to_string()))?;
    let Some(choice) = frame.choices.into_iter().next() else {
        return Ok(None);
    };

    if let Some(calls) = choice.delta.tool_calls.filter(|c| !c.is_empty()) {
        return Ok(Some(SseDelta::ToolCalls(calls)));
    }
    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        return Ok(Some(SseDelta::Content(content)));
    }
    if choice.finish_reason.is_some() {
        return Ok(Some(SseDelta::Done));
    }
    Ok(None)
}

/// Folds streamed deltas into a complete response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    // index → (id, name, arguments)
    calls: BTreeMap<usize, (String, String, String)>,
    done: bool,
}

impl StreamAccumulator {
    pub fn push(&mut self, delta: SseDelta) {
        match delta {
            SseDelta::Content(text) => self.content.push_str(&text),
            SseDelta::ToolCalls(fragments) => {
                for fragment in fragments {
                    let slot = self.calls.entry(fragment.index).or_default();
                    if let Some(id) = fragment.id {
                        slot.0 = id;
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name {
                            slot.1.push_str(&name);
                        }
                        if let Some(args) = function.arguments {
                            slot.2.push_str(&args);
                        }
                    }
                }
            }
            SseDelta::Done => self.done = true,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish(self) -> LlmResponse {
        let tool_calls = self
            .calls
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| WireToolCall {
                id,
                call_type: "function".into(),
                function: FunctionCall { name, arguments },
            })
            .collect();
        LlmResponse {
            content: self.content,
            tool_calls,
        }
    }
}
