use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::prompts::SUMMARIZER_SYSTEM;
use crate::agents::{DecisionMaker, Purpose};

pub const DEFAULT_MAX_STEPS: usize = 40;
pub const DEFAULT_SUMMARIZE_ABOVE: usize = 80;
pub const DEFAULT_KEEP_LAST: usize = 12;

const SUMMARIZER_FALLBACK: &str = "Condensed history; LLM summarizer failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
}

/// One executed (or failed) action. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub tool: String,
    pub args: Map<String, Value>,
    pub rationale: String,
    /// Page state observed after the action ran.
    pub url: String,
    pub title: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }
}

/// Rolling execution memory. `steps.len() <= max_steps` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryState {
    max_steps: usize,
    steps: VecDeque<StepRecord>,
    pub summary: String,
    pub facts: Vec<String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl MemoryState {
    pub fn new(max_steps: usize) -> Self {
        let max_steps = max_steps.max(1);
        Self {
            max_steps,
            steps: VecDeque::with_capacity(max_steps),
            summary: String::new(),
            facts: Vec::new(),
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Appends a step, evicting the oldest once the capacity is reached.
    pub fn add_step(&mut self, record: StepRecord) {
        while self.steps.len() >= self.max_steps {
            self.steps.pop_front();
        }
        self.steps.push_back(record);
    }

    pub fn steps(&self) -> impl DoubleEndedIterator<Item = &StepRecord> + ExactSizeIterator {
        self.steps.iter()
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.steps.back()
    }

    /// The last `limit` steps, oldest first.
    pub fn recent_steps(&self, limit: usize) -> Vec<StepRecord> {
        let skip = self.steps.len().saturating_sub(limit);
        self.steps.iter().skip(skip).cloned().collect()
    }

    pub fn recent_facts(&self, limit: usize) -> Vec<String> {
        let skip = self.facts.len().saturating_sub(limit);
        self.facts[skip..].to_vec()
    }

    pub fn add_fact(&mut self, fact: impl Into<String>) {
        self.facts.push(fact.into());
    }

    fn truncate_to_last(&mut self, keep: usize) {
        while self.steps.len() > keep {
            self.steps.pop_front();
        }
    }
}

/// Compresses the step log once it grows past a high-water mark.
#[derive(Debug, Clone)]
pub struct Summarizer {
    summarize_above: usize,
    keep_last: usize,
}

impl Default for Summarizer {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARIZE_ABOVE, DEFAULT_KEEP_LAST)
    }
}

impl Summarizer {
    pub fn new(summarize_above: usize, keep_last: usize) -> Self {
        Self {
            summarize_above,
            keep_last: keep_last.max(1),
        }
    }

    pub fn should_summarize(&self, memory: &MemoryState) -> bool {
        memory.len() > self.summarize_above
    }

    /// Returns true when the memory was condensed.
    pub async fn maybe_summarize(&self, memory: &mut MemoryState, decider: &dyn DecisionMaker) -> bool {
        if !self.should_summarize(memory) {
            return false;
        }
        let transcript = render_transcript(memory);
        let prompt = format!(
            "Summarize the following steps into concise memory. \
             Preserve goals, progress, blockers, and facts. \
             Output 5-8 bullet points.\n\n\
             Existing summary:\n{}\n\nSteps:\n{}",
            memory.summary, transcript
        );

        match decider
            .complete(Purpose::Summarize, SUMMARIZER_SYSTEM, &prompt)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                memory.summary = text.trim().to_string();
            }
            Ok(_) => {
                tracing::debug!("summarizer returned empty text, keeping previous summary");
            }
            Err(e) => {
                tracing::warn!(error = %e, "summarizer failed, condensing without LLM");
                if memory.summary.is_empty() {
                    memory.summary = SUMMARIZER_FALLBACK.to_string();
                } else {
                    memory.summary = format!("{} | {}", memory.summary, SUMMARIZER_FALLBACK);
                }
            }
        }
        let before = memory.len();
        memory.truncate_to_last(self.keep_last);
        tracing::info!(before, after = memory.len(), "memory condensed");
        true
    }
}

fn render_transcript(memory: &MemoryState) -> String {
    memory
        .steps()
        .map(|s| {
            let args = Value::Object(s.args.clone());
            let status = match s.status {
                StepStatus::Ok => "ok",
                StepStatus::Error => "error",
            };
            format!("{}. {} {} => {}", s.step, s.tool, args, status)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
