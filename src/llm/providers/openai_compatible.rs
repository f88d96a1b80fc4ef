use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;

use crate::errors::{PilotError, PilotResult};
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser::{self, StreamAccumulator};
use crate::llm::types::{CallConfig, ChatMessage, FunctionCall, LlmResponse, ToolDef, WireToolCall};

/// Any endpoint speaking the OpenAI chat-completions dialect (OpenAI, Ollama,
/// vLLM, LM Studio, ...).
pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    supports_tools: bool,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: String,
        api_base: String,
        api_key: String,
        supports_tools: bool,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(5)))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            id,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            supports_tools,
            client,
        }
    }

    fn endpoint(&self) -> String {
        chat_endpoint(&self.api_base)
    }
}

pub(crate) fn chat_endpoint(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Maps a non-success HTTP status onto the error taxonomy: rate limits and
/// credential/model problems end the task, everything else is retryable.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> PilotError {
    let detail = format!("{status}: {}", compact(body, 300));
    match status.as_u16() {
        429 => PilotError::RateLimited(detail),
        401 | 403 => PilotError::Config(format!("provider rejected credentials ({detail})")),
        404 => PilotError::Config(format!("unsupported model or endpoint ({detail})")),
        _ => PilotError::LlmProvider(detail),
    }
}

fn compact(text: &str, limit: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.chars().count() > limit {
        let cut: String = joined.chars().take(limit).collect();
        format!("{cut}...")
    } else {
        joined
    }
}

/// Models of the gpt-5 family reject `temperature` and want `max_completion_tokens`.
fn is_reasoning_model(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("gpt-5")
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDef>,
        cfg: &CallConfig,
    ) -> PilotResult<LlmResponse> {
        let mut body = serde_json::json!({
            "model": cfg.model,
            "messages": &messages,
            "stream": cfg.stream,
        });
        if is_reasoning_model(&cfg.model) {
            body["max_completion_tokens"] = serde_json::json!(cfg.max_tokens);
        } else {
            body["temperature"] = serde_json::json!(cfg.temperature);
            body["max_tokens"] = serde_json::json!(cfg.max_tokens);
        }

        if !tools.is_empty() && self.supports_tools {
            body["tools"] = serde_json::to_value(&tools)?;
            body["tool_choice"] = serde_json::json!("auto");
        }

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            stream = cfg.stream,
            messages = messages.len(),
            "sending LLM request"
        );

        let mut request = self.client.post(self.endpoint()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &err_body));
        }

        if cfg.stream {
            self.handle_stream(response).await
        } else {
            self.handle_json(response).await
        }
    }
}

impl OpenAiCompatibleProvider {
    /// Handle SSE streaming response, accumulating the full message.
    async fn handle_stream(&self, response: reqwest::Response) -> PilotResult<LlmResponse> {
        let mut byte_stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut acc = StreamAccumulator::default();

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                match sse_parser::parse_sse_line(&line) {
                    Ok(Some(delta)) => {
                        acc.push(delta);
                        if acc.is_done() {
                            break 'stream;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("SSE parse skipped: {e}");
                    }
                }
            }
        }

        let response = acc.finish();
        tracing::info!(
            provider = %self.id,
            content_len = response.content.len(),
            tool_calls = response.tool_calls.len(),
            "LLM stream complete"
        );
        Ok(response)
    }

    /// Handle a non-streaming JSON response.
    async fn handle_json(&self, response: reqwest::Response) -> PilotResult<LlmResponse> {
        let json: serde_json::Value = response.json().await?;
        let parsed = parse_completion(&json)?;
        tracing::info!(
            provider = %self.id,
            content_len = parsed.content.len(),
            tool_calls = parsed.tool_calls.len(),
            "LLM JSON response received"
        );
        Ok(parsed)
    }
}

pub(crate) fn parse_completion(json: &serde_json::Value) -> PilotResult<LlmResponse> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| PilotError::LlmProvider("response has no choices[0].message".into()))?;

    let content = message["content"].as_str().unwrap_or("").to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let name = tc["function"]["name"].as_str()?;
                    // Some servers return arguments as an object instead of a string.
                    let arguments = match &tc["function"]["arguments"] {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => "{}".to_string(),
                        other => other.to_string(),
                    };
                    Some(WireToolCall {
                        id: tc["id"].as_str().unwrap_or("").to_string(),
                        call_type: tc["type"].as_str().unwrap_or("function").to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments,
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(LlmResponse { content, tool_calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            chat_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:11434/v1/"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://gw.example/v1/chat/completions"),
            "https://gw.example/v1/chat/completions"
        );
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            PilotError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            PilotError::Config(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no such model"),
            PilotError::Config(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            PilotError::LlmProvider(_)
        ));
    }

    #[test]
    fn parses_tool_calls_with_object_arguments() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "click", "arguments": {"element_id": "4"}}
                    }]
                }
            }]
        });
        let parsed = parse_completion(&json).unwrap();
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.tool_calls[0].function.name, "click");
        assert_eq!(parsed.tool_calls[0].function.arguments, r#"{"element_id":"4"}"#);
    }

    #[test]
    fn missing_message_is_a_provider_error() {
        let err = parse_completion(&serde_json::json!({"choices": []})).unwrap_err();
        assert!(matches!(err, PilotError::LlmProvider(_)));
    }
}
