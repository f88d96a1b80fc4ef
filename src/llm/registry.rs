use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{AppConfig, LlmConfig};
use crate::errors::{PilotError, PilotResult};
use crate::llm::provider::LlmProvider;
use crate::llm::providers::mock::MockProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::CallConfig;

/// A provider plus the call settings to use with it.
#[derive(Clone)]
pub struct ModelBinding {
    pub provider: Arc<dyn LlmProvider>,
    pub config: CallConfig,
}

impl std::fmt::Debug for ModelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBinding")
            .field("provider", &self.provider.name())
            .field("model", &self.config.model)
            .finish()
    }
}

/// Registry of all available LLM providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    with_credentials: HashSet<String>,
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(llm_config: LlmConfig) -> Self {
        Self {
            providers: HashMap::new(),
            with_credentials: HashSet::new(),
            llm_config,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>, has_credentials: bool) {
        let name = provider.name().to_string();
        if has_credentials {
            self.with_credentials.insert(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn active(&self) -> &str {
        &self.llm_config.active_provider
    }

    /// Resolves the provider for one task. `provider` and `model` are the
    /// optional per-task overrides; unknown providers and missing credentials
    /// are configuration errors.
    pub fn binding_for_task(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> PilotResult<ModelBinding> {
        if self.llm_config.dry_run {
            tracing::info!("dry-run enabled, using mock provider");
            return Ok(ModelBinding {
                provider: Arc::new(MockProvider::default()),
                config: CallConfig::default(),
            });
        }

        let id = provider
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.llm_config.active_provider.clone());

        let (handle, entry) = match (self.providers.get(&id), self.llm_config.providers.get(&id)) {
            (Some(handle), Some(entry)) => (handle.clone(), entry),
            _ => return Err(PilotError::Config(format!("Unsupported provider: {id}"))),
        };

        if entry.requires_key && !self.with_credentials.contains(&id) {
            return Err(PilotError::Config(format!(
                "Missing API key for provider '{id}' (set {})",
                key_env_var(&id)
            )));
        }

        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| entry.model.clone());
        if model.is_empty() {
            return Err(PilotError::Config(format!("No model configured for provider '{id}'")));
        }

        tracing::debug!(provider = %id, model = %model, "resolved task provider");
        Ok(ModelBinding {
            provider: handle,
            config: CallConfig {
                model,
                stream: false,
                temperature: entry.temperature,
                ..CallConfig::default()
            },
        })
    }

    /// Return the binding for a named agent role.
    ///
    /// Resolution order:
    /// 1. `[llm.roles.<role>]` in config.toml, unless the task pinned its own provider/model
    /// 2. Fallback: the task binding
    pub fn binding_for_role(
        &self,
        role: &str,
        task_binding: &ModelBinding,
        task_pinned: bool,
    ) -> ModelBinding {
        if task_pinned || self.llm_config.dry_run {
            return task_binding.clone();
        }
        let roles = &self.llm_config.roles;
        let role_entry = match role {
            "navigator" => roles.navigator.as_ref(),
            "extractor" => roles.extractor.as_ref(),
            "reflector" => roles.reflector.as_ref(),
            "summarizer" => roles.summarizer.as_ref(),
            other => {
                tracing::warn!(role = other, "unknown role, falling back to task provider");
                None
            }
        };
        let Some(entry) = role_entry else {
            return task_binding.clone();
        };
        let Some(provider) = self.providers.get(&entry.provider).cloned() else {
            tracing::warn!(
                role = role,
                provider = %entry.provider,
                "role references unknown provider, falling back to task provider"
            );
            return task_binding.clone();
        };
        let temperature = entry.temperature.unwrap_or_else(|| {
            self.llm_config
                .providers
                .get(&entry.provider)
                .map(|p| p.temperature)
                .unwrap_or(task_binding.config.temperature)
        });
        tracing::debug!(
            role = role,
            provider = %entry.provider,
            model = %entry.model,
            stream = entry.stream,
            "resolved role config"
        );
        ModelBinding {
            provider,
            config: CallConfig {
                model: entry.model.clone(),
                stream: entry.stream,
                temperature,
                ..task_binding.config.clone()
            },
        }
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `WEBPILOT_<ID>_API_KEY`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(config.llm.clone());
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(key_env_var(id))
                .ok()
                .filter(|k| !k.trim().is_empty())
                .or_else(|| entry.api_key.clone().filter(|k| !k.trim().is_empty()))
                .unwrap_or_default();
            let has_credentials = !api_key.is_empty();
            let provider = OpenAiCompatibleProvider::new(
                id.clone(),
                entry.api_base.clone(),
                api_key,
                entry.supports_tools,
                config.llm.request_timeout_secs,
            );
            registry.register(Arc::new(provider), has_credentials);
        }
        tracing::info!(
            providers = ?registry.list_names(),
            active = %registry.active(),
            dry_run = config.llm.dry_run,
            "provider registry ready"
        );
        registry
    }
}

fn key_env_var(id: &str) -> String {
    format!("WEBPILOT_{}_API_KEY", id.to_uppercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderEntry, RoleEntry};

    fn entry(model: &str, requires_key: bool) -> ProviderEntry {
        ProviderEntry {
            display_name: model.into(),
            api_base: "http://localhost".into(),
            model: model.into(),
            temperature: 0.3,
            api_key: None,
            supports_tools: true,
            requires_key,
        }
    }

    fn registry(dry_run: bool) -> ProviderRegistry {
        let mut cfg = LlmConfig::default();
        cfg.providers.clear();
        cfg.providers.insert("openai".into(), entry("gpt-4o-mini", true));
        cfg.providers.insert("local".into(), entry("llama3.1", false));
        cfg.active_provider = "openai".into();
        cfg.dry_run = dry_run;
        cfg.roles.summarizer = Some(RoleEntry {
            provider: "local".into(),
            model: "llama3.1:8b".into(),
            stream: false,
            temperature: None,
        });
        let mut reg = ProviderRegistry::new(cfg);
        reg.register(
            Arc::new(OpenAiCompatibleProvider::new("openai".into(), "http://x".into(), "sk".into(), true, 5)),
            true,
        );
        reg.register(
            Arc::new(OpenAiCompatibleProvider::new("local".into(), "http://y".into(), String::new(), false, 5)),
            false,
        );
        reg
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let err = registry(false).binding_for_task(Some("nope"), None).unwrap_err();
        assert!(matches!(err, PilotError::Config(ref m) if m.contains("Unsupported provider")));
    }

    #[test]
    fn model_override_wins() {
        let binding = registry(false)
            .binding_for_task(Some("OpenAI"), Some("gpt-4.1"))
            .unwrap();
        assert_eq!(binding.provider.name(), "openai");
        assert_eq!(binding.config.model, "gpt-4.1");
    }

    #[test]
    fn keyless_provider_allowed_when_not_required() {
        let binding = registry(false).binding_for_task(Some("local"), None).unwrap();
        assert_eq!(binding.config.model, "llama3.1");
        assert!(!binding.provider.supports_tools());
    }

    #[test]
    fn dry_run_uses_mock() {
        let binding = registry(true).binding_for_task(Some("nope"), None).unwrap();
        assert_eq!(binding.provider.name(), "mock");
    }

    #[test]
    fn role_config_applies_unless_task_pinned() {
        let reg = registry(false);
        let base = reg.binding_for_task(None, None).unwrap();
        let summarizer = reg.binding_for_role("summarizer", &base, false);
        assert_eq!(summarizer.provider.name(), "local");
        assert_eq!(summarizer.config.model, "llama3.1:8b");

        let pinned = reg.binding_for_role("summarizer", &base, true);
        assert_eq!(pinned.config.model, "gpt-4o-mini");

        let navigator = reg.binding_for_role("navigator", &base, false);
        assert_eq!(navigator.provider.name(), "openai");
    }

    #[test]
    fn env_var_name() {
        assert_eq!(key_env_var("open-router"), "WEBPILOT_OPEN_ROUTER_API_KEY");
    }
}
