use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. If a role is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
    /// Forces the mock provider regardless of credentials.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderEntry {
                display_name: "OpenAI".into(),
                api_base: "https://api.openai.com".into(),
                model: "gpt-4o-mini".into(),
                temperature: default_temperature(),
                api_key: None,
                supports_tools: true,
                requires_key: true,
            },
        );
        Self {
            active_provider: "openai".into(),
            providers,
            roles: RolesConfig::default(),
            dry_run: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var WEBPILOT_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whether the endpoint returns structured tool calls. When false, decisions
    /// are requested as a JSON object embedded in plain text.
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    /// Local servers (e.g. Ollama) run without credentials.
    #[serde(default = "default_true")]
    pub requires_key: bool,
}

/// Maps decision roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    pub navigator: Option<RoleEntry>,
    pub extractor: Option<RoleEntry>,
    pub reflector: Option<RoleEntry>,
    /// Memory compression calls.
    pub summarizer: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,
    /// Real browser profile used by tasks created with `safe_mode = false`.
    #[serde(default)]
    pub unsafe_user_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
    #[serde(default = "default_search_engine")]
    pub search_engine: String,
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            user_data_dir: default_user_data_dir(),
            unsafe_user_data_dir: None,
            headless: false,
            chrome_path: None,
            search_engine: default_search_engine(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_no_progress_limit")]
    pub no_progress_limit: u32,
    /// Capacity of the rolling step log. Must exceed `summarize_above`
    /// for summarization to ever trigger.
    #[serde(default = "default_memory_max_steps")]
    pub memory_max_steps: usize,
    #[serde(default = "default_summarize_above")]
    pub summarize_above: usize,
    #[serde(default = "default_summary_keep_last")]
    pub summary_keep_last: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_retries: default_max_retries(),
            no_progress_limit: default_no_progress_limit(),
            memory_max_steps: default_memory_max_steps(),
            summarize_above: default_summarize_above(),
            summary_keep_last: default_summary_keep_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_temperature() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    60
}

fn default_user_data_dir() -> PathBuf {
    PathBuf::from(".browser-data")
}

fn default_search_engine() -> String {
    "google".into()
}

/// `~/.local/share/webpilot/screenshots` (or the platform equivalent),
/// falling back to a relative `artifacts/screenshots`.
fn default_screenshot_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("webpilot").join("screenshots"))
        .unwrap_or_else(|| PathBuf::from("artifacts").join("screenshots"))
}

fn default_max_steps() -> u32 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_no_progress_limit() -> u32 {
    5
}

fn default_memory_max_steps() -> usize {
    120
}

fn default_summarize_above() -> usize {
    80
}

fn default_summary_keep_last() -> usize {
    12
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}

fn resolve_config_path() -> PilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(PilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> PilotResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.agent.summary_keep_last == 0 {
        return Err(PilotError::Config("agent.summary_keep_last must be at least 1".into()));
    }
    Ok(config)
}

pub fn load_config() -> PilotResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.llm.active_provider, "openai");
        assert_eq!(cfg.agent.max_steps, 60);
        assert_eq!(cfg.agent.max_retries, 2);
        assert_eq!(cfg.agent.no_progress_limit, 5);
        assert_eq!(cfg.agent.summarize_above, 80);
        assert_eq!(cfg.agent.summary_keep_last, 12);
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
        assert_eq!(cfg.browser.search_engine, "google");
    }

    #[test]
    fn provider_table_and_roles_parse() {
        let cfg = parse_config(
            r#"
            [llm]
            active_provider = "ollama"

            [llm.providers.ollama]
            display_name = "Local"
            api_base = "http://localhost:11434"
            model = "llama3.1"
            supports_tools = false
            requires_key = false

            [llm.roles.summarizer]
            provider = "ollama"
            model = "llama3.1:8b"

            [agent]
            max_retries = 4
            "#,
        )
        .unwrap();
        let entry = &cfg.llm.providers["ollama"];
        assert!(!entry.supports_tools);
        assert!(!entry.requires_key);
        assert!((entry.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.llm.roles.summarizer.as_ref().unwrap().model, "llama3.1:8b");
        assert_eq!(cfg.agent.max_retries, 4);
        assert_eq!(cfg.agent.max_steps, 60);
    }

    #[test]
    fn zero_keep_last_is_rejected() {
        let err = parse_config("[agent]\nsummary_keep_last = 0\n").unwrap_err();
        assert!(matches!(err, PilotError::Config(_)));
    }
}
