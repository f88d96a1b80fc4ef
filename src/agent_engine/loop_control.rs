use crate::browser::Observation;
use crate::config::AgentConfig;

/// Consecutive-error and no-progress counters for one session.
#[derive(Debug, Clone)]
pub struct LoopController {
    max_retries: u32,
    no_progress_limit: u32,
    error_count: u32,
    stall_count: u32,
    last_url: Option<String>,
    last_title: Option<String>,
    /// Set once the deterministic fallback was used in the current stall episode.
    fallback_used: bool,
}

impl LoopController {
    pub fn new(max_retries: u32, no_progress_limit: u32) -> Self {
        Self {
            max_retries,
            no_progress_limit: no_progress_limit.max(1),
            error_count: 0,
            stall_count: 0,
            last_url: None,
            last_title: None,
            fallback_used: false,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.max_retries, config.no_progress_limit)
    }

    /// Compares the fresh observation with the previous one.
    pub fn observe(&mut self, observation: &Observation) {
        let same = self.last_url.as_deref() == Some(observation.url.as_str())
            && self.last_title.as_deref() == Some(observation.title.as_str());
        if same {
            self.stall_count += 1;
        } else {
            self.stall_count = 0;
            self.fallback_used = false;
        }
        self.last_url = Some(observation.url.clone());
        self.last_title = Some(observation.title.clone());
    }

    pub fn record_success(&mut self) {
        self.error_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.error_count += 1;
        tracing::debug!(errors = self.error_count, budget = self.max_retries, "failure recorded");
    }

    /// True once consecutive failures exceed the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.error_count > self.max_retries
    }

    pub fn is_stalled(&self) -> bool {
        self.stall_count >= self.no_progress_limit
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    pub fn no_progress_limit(&self) -> u32 {
        self.no_progress_limit
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn mark_fallback_used(&mut self) {
        self.fallback_used = true;
    }
}
