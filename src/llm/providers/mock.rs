use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::llm::provider::LlmProvider;
use crate::llm::types::{CallConfig, ChatMessage, FunctionCall, LlmResponse, ToolDef, WireToolCall};

pub const DRY_RUN_MESSAGE: &str = "Dry-run mode: configure an API key to enable real actions.";

/// Stand-in used for dry runs: every call answers with a `finish` tool call.
pub struct MockProvider {
    message: String,
}

impl MockProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(DRY_RUN_MESSAGE)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        _messages: Vec<ChatMessage>,
        _tools: Vec<ToolDef>,
        _cfg: &CallConfig,
    ) -> PilotResult<LlmResponse> {
        let arguments = serde_json::json!({ "result": self.message }).to_string();
        Ok(LlmResponse {
            content: self.message.clone(),
            tool_calls: vec![WireToolCall {
                id: "mock-0".into(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: "finish".into(),
                    arguments,
                },
            }],
        })
    }
}
