//! Scripted stand-ins for the browser and the decision-maker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent_engine::event_bus::{AgentMessage, EventSink};
use crate::agent_engine::state::ToolCall;
use crate::agents::{Decision, DecisionContext, DecisionMaker, Purpose, Role};
use crate::browser::{BrowserController, ElementTarget, Observation, ScrollDirection};
use crate::errors::{PilotError, PilotResult};

pub fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<AgentMessage>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let store = events.clone();
    let sink: EventSink = Arc::new(move |message| store.lock().unwrap().push(message));
    (sink, events)
}

/// In-memory browser. Pages are keyed by exact URL; unknown URLs yield an
/// empty page titled with the URL. Clicking an element registered with
/// `with_link` navigates.
#[derive(Default)]
pub struct FakeBrowser {
    pages: HashMap<String, Observation>,
    links: HashMap<String, String>,
    failing: HashSet<String>,
    history: Mutex<Vec<String>>,
    current: Mutex<String>,
    calls: Mutex<Vec<String>>,
    visited: Mutex<Vec<String>>,
    screenshots: AtomicUsize,
    closed: AtomicBool,
}

impl FakeBrowser {
    pub fn with_page(mut self, observation: Observation) -> Self {
        self.pages.insert(observation.url.clone(), observation);
        self
    }

    pub fn with_link(mut self, element_id: &str, url: &str) -> Self {
        self.links.insert(element_id.into(), url.into());
        self
    }

    pub fn starting_at(self, url: &str) -> Self {
        *self.current.lock().unwrap() = url.to_string();
        self.history.lock().unwrap().push(url.to_string());
        self
    }

    /// Every call of this primitive returns a browser error.
    pub fn failing(mut self, primitive: &str) -> Self {
        self.failing.insert(primitive.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }

    pub fn current_url(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    pub fn screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, primitive: &str, call: String) -> PilotResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.failing.contains(primitive) {
            return Err(PilotError::Browser(format!("{primitive} failed")));
        }
        Ok(())
    }

    fn go(&self, url: &str) {
        *self.current.lock().unwrap() = url.to_string();
        self.history.lock().unwrap().push(url.to_string());
        self.visited.lock().unwrap().push(url.to_string());
    }

    fn page(&self) -> Observation {
        let url = self.current_url();
        if url.is_empty() {
            return Observation {
                url: "about:blank".into(),
                ..Default::default()
            };
        }
        self.pages.get(&url).cloned().unwrap_or(Observation {
            title: url.clone(),
            url,
            ..Default::default()
        })
    }

    fn label(&self, target: &ElementTarget) -> PilotResult<String> {
        self.page()
            .resolve(target)
            .map(|e| e.label())
            .ok_or_else(|| PilotError::Browser("element not found".into()))
    }
}

#[async_trait]
impl BrowserController for FakeBrowser {
    async fn select_page(&self, new_window: bool) -> PilotResult<()> {
        let call = if new_window { "select_page new" } else { "select_page" };
        self.record("select_page", call.into())
    }

    async fn snapshot(&self) -> PilotResult<Observation> {
        if self.failing.contains("snapshot") {
            return Err(PilotError::Browser("snapshot failed".into()));
        }
        Ok(self.page())
    }

    async fn navigate(&self, url: &str) -> PilotResult<()> {
        self.record("navigate", format!("navigate {url}"))?;
        self.go(url);
        Ok(())
    }

    async fn click(&self, target: &ElementTarget) -> PilotResult<String> {
        let id = target.element_id.clone().unwrap_or_default();
        self.record("click", format!("click {id}"))?;
        let label = self.label(target)?;
        if let Some(url) = self.links.get(&id) {
            self.go(url);
        }
        Ok(label)
    }

    async fn type_text(&self, target: &ElementTarget, text: &str, press_enter: bool) -> PilotResult<String> {
        let id = target.element_id.clone().unwrap_or_default();
        self.record("type", format!("type {id} {text} enter={press_enter}"))?;
        self.label(target)
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> PilotResult<()> {
        self.record("scroll", format!("scroll {direction:?} {amount}"))
    }

    async fn wait(&self, ms: u64) -> PilotResult<()> {
        self.record("wait", format!("wait {ms}"))
    }

    async fn back(&self) -> PilotResult<()> {
        self.record("back", "back".into())?;
        let mut history = self.history.lock().unwrap();
        if history.len() > 1 {
            history.pop();
            if let Some(previous) = history.last() {
                *self.current.lock().unwrap() = previous.clone();
            }
        }
        Ok(())
    }

    async fn forward(&self) -> PilotResult<()> {
        self.record("forward", "forward".into())
    }

    async fn screenshot(&self, path: &Path) -> PilotResult<()> {
        if self.failing.contains("screenshot") {
            return Err(PilotError::Browser("screenshot failed".into()));
        }
        std::fs::write(path, b"\x89PNG")?;
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> PilotResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

enum Scripted {
    Act(ToolCall),
    Nothing,
    Fail(PilotError),
}

/// Returns scripted decisions in order, then empty decisions. `complete`
/// answers with the configured text or fails when none is set.
#[derive(Default)]
pub struct FakeDecider {
    script: Mutex<VecDeque<Scripted>>,
    completion: Option<String>,
    completion_error: Mutex<Option<PilotError>>,
    contexts: Mutex<Vec<(Role, DecisionContext)>>,
}

impl FakeDecider {
    pub fn then(self, call: ToolCall) -> Self {
        self.script.lock().unwrap().push_back(Scripted::Act(call));
        self
    }

    pub fn nothing(self) -> Self {
        self.script.lock().unwrap().push_back(Scripted::Nothing);
        self
    }

    pub fn failing(self, error: PilotError) -> Self {
        self.script.lock().unwrap().push_back(Scripted::Fail(error));
        self
    }

    pub fn with_completion(mut self, text: &str) -> Self {
        self.completion = Some(text.to_string());
        self
    }

    /// The next `complete` call fails with `error`.
    pub fn completion_failing(self, error: PilotError) -> Self {
        *self.completion_error.lock().unwrap() = Some(error);
        self
    }

    /// Every decision request seen so far, with the role it was routed to.
    pub fn contexts(&self) -> Vec<(Role, DecisionContext)> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionMaker for FakeDecider {
    async fn decide(&self, role: Role, ctx: &DecisionContext) -> PilotResult<Decision> {
        self.contexts.lock().unwrap().push((role, ctx.clone()));
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Act(call)) => Ok(Decision::act(call, format!("scripted {role}"))),
            Some(Scripted::Nothing) | None => Ok(Decision::none("no scripted decision")),
            Some(Scripted::Fail(error)) => Err(error),
        }
    }

    async fn complete(&self, _purpose: Purpose, _system: &str, _user: &str) -> PilotResult<String> {
        if let Some(error) = self.completion_error.lock().unwrap().take() {
            return Err(error);
        }
        self.completion
            .clone()
            .ok_or_else(|| PilotError::LlmProvider("no completion scripted".into()))
    }
}
