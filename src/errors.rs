use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("LLM rate limited: {0}")]
    RateLimited(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Task cancelled")]
    Cancelled,
}

impl PilotError {
    /// Provider/configuration failures end the task instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PilotError::Config(_) | PilotError::RateLimited(_))
    }

    /// Extra guidance attached to the `error` event for the user.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            PilotError::RateLimited(_) => Some(
                "The LLM provider is rate limiting requests. Wait a moment and submit the task again, or switch provider/model.",
            ),
            PilotError::Config(_) => Some("Check the provider, model and API key settings."),
            _ => None,
        }
    }
}

impl serde::Serialize for PilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type PilotResult<T> = Result<T, PilotError>;
