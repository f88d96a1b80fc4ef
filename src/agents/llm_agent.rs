use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agent_engine::state::ToolCall;
use crate::agents::prompts;
use crate::agents::{Decision, DecisionContext, DecisionMaker, Purpose, Role};
use crate::errors::PilotResult;
use crate::llm::registry::{ModelBinding, ProviderRegistry};
use crate::llm::tools::{describe_for_prompt, load_builtin_tools};
use crate::llm::types::{ChatMessage, LlmResponse, ToolDef};

/// Decision-maker backed by LLM providers, one binding per role.
pub struct LlmDecisionMaker {
    navigator: ModelBinding,
    extractor: ModelBinding,
    reflector: ModelBinding,
    summarizer: ModelBinding,
    tools: Vec<ToolDef>,
}

impl LlmDecisionMaker {
    /// `pinned` is true when the task chose its own provider or model; role
    /// overrides from config.toml are then ignored.
    pub fn from_registry(
        registry: &ProviderRegistry,
        task_binding: ModelBinding,
        pinned: bool,
    ) -> PilotResult<Self> {
        let role = |name: &str| registry.binding_for_role(name, &task_binding, pinned);
        Ok(Self {
            navigator: role("navigator"),
            extractor: role("extractor"),
            reflector: role("reflector"),
            summarizer: role("summarizer"),
            tools: load_builtin_tools()?,
        })
    }

    /// Same binding for every role.
    pub fn uniform(binding: ModelBinding) -> PilotResult<Self> {
        Ok(Self {
            navigator: binding.clone(),
            extractor: binding.clone(),
            reflector: binding.clone(),
            summarizer: binding,
            tools: load_builtin_tools()?,
        })
    }

    fn for_role(&self, role: Role) -> &ModelBinding {
        match role {
            Role::Navigator => &self.navigator,
            Role::Extractor => &self.extractor,
            Role::Reflector => &self.reflector,
        }
    }

    fn for_purpose(&self, purpose: Purpose) -> &ModelBinding {
        match purpose {
            Purpose::Summarize => &self.summarizer,
            Purpose::Extract => &self.extractor,
            Purpose::Answer => &self.navigator,
        }
    }
}

#[async_trait]
impl DecisionMaker for LlmDecisionMaker {
    async fn decide(&self, role: Role, ctx: &DecisionContext) -> PilotResult<Decision> {
        let binding = self.for_role(role);
        let system = prompts::system_prompt(role, ctx.browser_only, !ctx.ordered_goal_urls.is_empty());
        let mut messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(serde_json::to_string(ctx)?),
        ];

        tracing::debug!(
            role = %role,
            provider = binding.provider.name(),
            structured = binding.provider.supports_tools(),
            "requesting decision"
        );

        if binding.provider.supports_tools() {
            let response = binding
                .provider
                .chat(messages, self.tools.clone(), &binding.config)
                .await?;
            Ok(decision_from_tool_calls(response))
        } else {
            messages.push(ChatMessage::system(prompts::json_tool_spec(
                &describe_for_prompt(&self.tools),
            )));
            let response = binding
                .provider
                .chat(messages, Vec::new(), &binding.config)
                .await?;
            Ok(decision_from_text(&response.content))
        }
    }

    async fn complete(&self, purpose: Purpose, system: &str, user: &str) -> PilotResult<String> {
        let binding = self.for_purpose(purpose);
        let response = binding
            .provider
            .chat(
                vec![ChatMessage::system(system), ChatMessage::user(user)],
                Vec::new(),
                &binding.config,
            )
            .await?;
        Ok(response.content)
    }
}

fn decision_from_tool_calls(response: LlmResponse) -> Decision {
    let rationale = response.content.trim().to_string();
    let Some(call) = response.tool_calls.into_iter().next() else {
        return Decision::none(if rationale.is_empty() {
            "No tool call".to_string()
        } else {
            rationale
        });
    };
    let raw = call.function.arguments.trim();
    let args = if raw.is_empty() {
        Value::Object(Map::new())
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tool = %call.function.name, error = %e, "malformed tool arguments");
                return Decision::none(format!(
                    "Malformed arguments for {}: {e}",
                    call.function.name
                ));
            }
        }
    };
    Decision::act(ToolCall::new(call.function.name, args), rationale)
}

/// Parses `{"tool": ..., "args": {...}, "reason": ...}` out of free text.
fn decision_from_text(text: &str) -> Decision {
    let Some(payload) = extract_json_object(text) else {
        return Decision::none(text.trim());
    };
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match payload.get("tool").and_then(Value::as_str).map(str::trim) {
        Some(tool) if !tool.is_empty() => {
            let args = payload.get("args").cloned().unwrap_or(Value::Null);
            Decision::act(ToolCall::new(tool, args), reason)
        }
        _ => Decision::none(reason),
    }
}

/// The whole text if it is a JSON object, otherwise the span from the first
/// `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::browser::Observation;
    use crate::llm::provider::LlmProvider;
    use crate::llm::types::{CallConfig, FunctionCall, WireToolCall};

    struct ScriptedProvider {
        structured: bool,
        reply: LlmResponse,
        seen_tools: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_tools(&self) -> bool {
            self.structured
        }

        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            tools: Vec<ToolDef>,
            _cfg: &CallConfig,
        ) -> PilotResult<LlmResponse> {
            self.seen_tools.lock().unwrap().push(tools.len());
            Ok(self.reply.clone())
        }
    }

    fn ctx() -> DecisionContext {
        DecisionContext {
            goal: "open example.com".into(),
            memory_summary: String::new(),
            recent_facts: Vec::new(),
            recent_steps: Vec::new(),
            observation: Observation::default(),
            browser_only: true,
            has_browser_action: false,
            ordered_goal_urls: Vec::new(),
            visited_goal_urls: Vec::new(),
        }
    }

    fn maker(provider: Arc<ScriptedProvider>) -> LlmDecisionMaker {
        LlmDecisionMaker::uniform(ModelBinding {
            provider,
            config: CallConfig::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn structured_provider_returns_first_tool_call() {
        let provider = Arc::new(ScriptedProvider {
            structured: true,
            reply: LlmResponse {
                content: "go there".into(),
                tool_calls: vec![WireToolCall {
                    id: "1".into(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: "navigate".into(),
                        arguments: r#"{"url":"https://example.com"}"#.into(),
                    },
                }],
            },
            seen_tools: Mutex::new(Vec::new()),
        });
        let decision = maker(provider.clone()).decide(Role::Navigator, &ctx()).await.unwrap();
        let call = decision.tool_call.unwrap();
        assert_eq!(call.name, "navigate");
        assert_eq!(call.str_arg("url"), Some("https://example.com"));
        assert_eq!(decision.rationale, "go there");
        assert!(provider.seen_tools.lock().unwrap()[0] > 0);
    }

    #[tokio::test]
    async fn plain_text_provider_falls_back_to_embedded_json() {
        let provider = Arc::new(ScriptedProvider {
            structured: false,
            reply: LlmResponse {
                content: "Sure! {\"tool\": \"scroll\", \"args\": {\"direction\": \"down\"}, \"reason\": \"look further\"} ok".into(),
                tool_calls: Vec::new(),
            },
            seen_tools: Mutex::new(Vec::new()),
        });
        let decision = maker(provider.clone()).decide(Role::Reflector, &ctx()).await.unwrap();
        let call = decision.tool_call.unwrap();
        assert_eq!(call.name, "scroll");
        assert_eq!(decision.rationale, "look further");
        assert_eq!(provider.seen_tools.lock().unwrap()[0], 0);
    }

    #[test]
    fn malformed_arguments_yield_no_action() {
        let decision = decision_from_tool_calls(LlmResponse {
            content: String::new(),
            tool_calls: vec![WireToolCall {
                id: String::new(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: "click".into(),
                    arguments: "{element_id: 3".into(),
                },
            }],
        });
        assert!(decision.tool_call.is_none());
        assert!(decision.rationale.contains("Malformed"));
    }

    #[test]
    fn json_extraction() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
        let map = extract_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(map["a"], 1);
    }
}
