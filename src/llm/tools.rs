use crate::errors::{PilotError, PilotResult};
use crate::llm::types::ToolDef;

/// Loads built-in tool definitions from the prompts/tools/builtin.json file.
/// The JSON is embedded at compile time via include_str!.
pub fn load_builtin_tools() -> PilotResult<Vec<ToolDef>> {
    let json = include_str!("../../prompts/tools/builtin.json");
    serde_json::from_str(json)
        .map_err(|e| PilotError::Config(format!("Failed to parse builtin tools: {e}")))
}

/// Compact `name(arg, arg)` listing used when the provider cannot take
/// structured tool definitions and the tool list goes into the prompt text.
pub fn describe_for_prompt(tools: &[ToolDef]) -> String {
    tools
        .iter()
        .map(|t| {
            let args = t
                .function
                .parameters
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|props| props.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            format!("- {}({}): {}", t.function.name, args, t.function.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
