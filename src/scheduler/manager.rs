use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::agent_engine::engine::{AgentSession, SessionSettings};
use crate::agent_engine::event_bus::{AgentMessage, EventLog, EventSink, EventSubscription, StepLog};
use crate::agent_engine::memory::StepStatus;
use crate::agent_engine::state::SessionState;
use crate::agents::llm_agent::LlmDecisionMaker;
use crate::agents::{prompts, DecisionMaker, Purpose};
use crate::browser::BrowserLauncher;
use crate::config::AppConfig;
use crate::errors::{PilotError, PilotResult};
use crate::llm::registry::ProviderRegistry;
use crate::scheduler::browser_slot::{profile_dir, BrowserSlot};
use crate::scheduler::task::{Task, TaskMode, TaskOptions, TaskStatus, TaskView};

const LOG_MIRROR_CHARS: usize = 200;
const DIRECT_OUTPUT_CHARS: usize = 300;

/// Builds what a task needs to run. The scheduler only sequences turns.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, task: &Task, emit: EventSink) -> PilotResult<AgentSession>;

    /// One completion for tasks that never touch the browser.
    async fn direct_answer(&self, task: &Task) -> PilotResult<String>;

    async fn shutdown(&self) {}
}

struct TaskRecord {
    status: TaskStatus,
    result: Option<String>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

struct TaskEntry {
    task: Task,
    record: Mutex<TaskRecord>,
    events: EventLog,
    session: AsyncMutex<Option<AgentSession>>,
    stop: Notify,
    stop_requested: AtomicBool,
}

impl TaskEntry {
    fn new(task: Task) -> Arc<Self> {
        let entry = Arc::new(Self {
            record: Mutex::new(TaskRecord {
                status: TaskStatus::Queued,
                result: None,
                error: None,
                updated_at: task.created_at,
            }),
            task,
            events: EventLog::default(),
            session: AsyncMutex::new(None),
            stop: Notify::new(),
            stop_requested: AtomicBool::new(false),
        });
        entry.publish(AgentMessage::Status {
            status: TaskStatus::Queued,
        });
        entry
    }

    fn record(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> TaskStatus {
        self.record().status
    }

    fn view(&self) -> TaskView {
        let record = self.record();
        TaskView {
            id: self.task.id.clone(),
            prompt: self.task.prompt.clone(),
            status: record.status,
            mode: self.task.mode,
            browser_only: self.task.options.browser_only,
            result: record.result.clone(),
            error: record.error.clone(),
            created_at: self.task.created_at,
            updated_at: record.updated_at,
        }
    }

    fn publish(&self, message: AgentMessage) {
        let event = self.events.publish(message);
        let body = serde_json::to_string(&event.message).unwrap_or_default();
        tracing::info!(
            task_id = %self.task.id,
            kind = event.message.kind(),
            event = %compact(&body, LOG_MIRROR_CHARS),
            "task event"
        );
    }

    /// Sink handed to the session; forwards its events into this task's log.
    fn sink(self: &Arc<Self>) -> EventSink {
        let entry = Arc::downgrade(self);
        Arc::new(move |message| {
            if let Some(entry) = entry.upgrade() {
                entry.publish(message);
            }
        })
    }

    /// Moves to `status` unless the task already ended. `before` is published
    /// ahead of the status event, and only when the move happens.
    fn settle(
        &self,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
        before: Option<AgentMessage>,
    ) -> bool {
        let mut record = self.record();
        if record.status.is_terminal() {
            return false;
        }
        if let Some(message) = before {
            self.publish(message);
        }
        if result.is_some() {
            record.result = result;
        }
        if error.is_some() {
            record.error = error;
        }
        record.updated_at = Utc::now();
        if record.status != status {
            tracing::info!(task_id = %self.task.id, from = %record.status, to = %status, "task status");
            record.status = status;
            self.publish(AgentMessage::Status { status });
        }
        true
    }

    fn transition(&self, status: TaskStatus) -> bool {
        self.settle(status, None, None, None)
    }

    fn finish(&self, result: String) {
        self.settle(TaskStatus::Done, Some(result), None, None);
    }

    fn fail(&self, error: &PilotError) {
        tracing::error!(task_id = %self.task.id, error = %error, "task failed");
        let message = AgentMessage::Error {
            error: error.to_string(),
            hint: error.hint().map(str::to_string),
        };
        self.settle(TaskStatus::Error, None, Some(error.to_string()), Some(message));
    }

    fn stop_is_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

struct Shared {
    tasks: Mutex<HashMap<String, Arc<TaskEntry>>>,
    factory: Arc<dyn SessionFactory>,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskEntry>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, id: &str) -> PilotResult<Arc<TaskEntry>> {
        self.tasks()
            .get(id)
            .cloned()
            .ok_or_else(|| PilotError::NotFound(format!("Task {id} not found")))
    }

    async fn process(&self, entry: Arc<TaskEntry>) {
        if entry.status().is_terminal() {
            // Stopped while queued; drop whatever session is left.
            if let Some(mut session) = entry.session.lock().await.take() {
                session.abort().await;
            }
            return;
        }
        entry.transition(TaskStatus::Running);
        match entry.task.mode {
            TaskMode::Direct => self.answer_directly(&entry).await,
            TaskMode::Agent => self.run_agent(&entry).await,
        }
    }

    async fn answer_directly(&self, entry: &Arc<TaskEntry>) {
        let started = Instant::now();
        let answer = tokio::select! {
            answer = self.factory.direct_answer(&entry.task) => answer,
            _ = entry.stop.notified() => return,
        };
        match answer {
            Ok(text) => {
                entry.publish(AgentMessage::Log(StepLog {
                    step: 1,
                    tool: "direct_answer".into(),
                    reason: "Browser-only disabled and task is not explicit.".into(),
                    url: None,
                    title: None,
                    status: StepStatus::Ok,
                    error: None,
                    output: Some(text.chars().take(DIRECT_OUTPUT_CHARS).collect()),
                    duration_ms: started.elapsed().as_millis() as u64,
                }));
                entry.publish(AgentMessage::Result { result: text.clone() });
                entry.finish(text);
            }
            Err(e) => entry.fail(&e),
        }
    }

    async fn run_agent(&self, entry: &Arc<TaskEntry>) {
        let mut slot = entry.session.lock().await;
        if slot.is_none() {
            match self.factory.create_session(&entry.task, entry.sink()).await {
                Ok(session) => *slot = Some(session),
                Err(e) => {
                    entry.fail(&e);
                    return;
                }
            }
        }
        let Some(session) = slot.as_mut() else {
            return;
        };

        // Dropping the run future is the forced stop: no further browser
        // call is issued once `stop_task` fires.
        let outcome = tokio::select! {
            result = session.run() => Some(result),
            _ = entry.stop.notified() => None,
        };

        let ended = match outcome {
            None => {
                tracing::info!(task_id = %entry.task.id, "turn interrupted by stop");
                session.abort().await;
                entry.transition(TaskStatus::Stopped);
                true
            }
            Some(Err(e)) => {
                session.abort().await;
                entry.fail(&e);
                true
            }
            Some(Ok(())) if entry.stop_is_requested() => {
                session.abort().await;
                entry.transition(TaskStatus::Stopped);
                true
            }
            Some(Ok(())) => match session.state().clone() {
                SessionState::Done { result } => {
                    entry.finish(result);
                    true
                }
                SessionState::Stopped => {
                    entry.transition(TaskStatus::Stopped);
                    true
                }
                SessionState::WaitingConfirm => !entry.transition(TaskStatus::WaitingConfirm),
                SessionState::WaitingUser { .. } => !entry.transition(TaskStatus::WaitingUser),
                SessionState::Running => {
                    entry.fail(&PilotError::Agent(
                        "session yielded without pausing or finishing".into(),
                    ));
                    true
                }
            },
        };
        if ended {
            *slot = None;
        }
    }
}

/// Single-worker task queue over one shared browser.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<String>,
}

impl TaskScheduler {
    /// Spawns the worker; must be called inside a tokio runtime.
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            factory,
        });
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(work(shared.clone(), rx));
        Self { shared, queue }
    }

    pub fn create_task(&self, prompt: &str, options: TaskOptions) -> PilotResult<TaskView> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PilotError::InvalidInput("Prompt must not be empty.".into()));
        }
        let entry = {
            let mut tasks = self.shared.tasks();
            if let Some(active) = tasks.values().find(|e| e.status().is_active()) {
                tracing::warn!(active = %active.task.id, "task rejected, another task is active");
                return Err(PilotError::Conflict(
                    "Only one active task is supported with a shared browser profile.".into(),
                ));
            }
            let entry = TaskEntry::new(Task::new(prompt, options));
            tasks.insert(entry.task.id.clone(), entry.clone());
            entry
        };
        tracing::info!(task_id = %entry.task.id, mode = ?entry.task.mode, "task created");
        self.enqueue(&entry.task.id)?;
        Ok(entry.view())
    }

    pub fn get_task(&self, id: &str) -> PilotResult<TaskView> {
        Ok(self.shared.entry(id)?.view())
    }

    pub fn subscribe(&self, id: &str) -> PilotResult<EventSubscription> {
        Ok(self.shared.entry(id)?.events.subscribe())
    }

    /// Resumes a paused task. A non-empty `response` is passed to the session
    /// as the user's reply; otherwise the pending action is approved.
    pub async fn confirm_task(&self, id: &str, response: Option<String>) -> PilotResult<TaskView> {
        let entry = self.shared.entry(id)?;
        {
            let mut slot = entry.session.lock().await;
            let status = entry.status();
            if !status.is_paused() {
                return Err(PilotError::Conflict(format!("Task is {status}, nothing to confirm.")));
            }
            let session = slot
                .as_mut()
                .ok_or_else(|| PilotError::Conflict("Task has no session to resume.".into()))?;
            match response.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                Some(reply) => session.provide_user_input(reply),
                None => session.confirm(),
            }
            entry.transition(TaskStatus::Queued);
        }
        self.enqueue(id)?;
        Ok(entry.view())
    }

    /// Ends the task now, interrupting a turn in progress.
    pub async fn stop_task(&self, id: &str) -> PilotResult<TaskView> {
        let entry = self.shared.entry(id)?;
        if entry.status().is_terminal() {
            return Ok(entry.view());
        }
        entry.stop_requested.store(true, Ordering::SeqCst);
        entry.stop.notify_one();
        // Busy means the worker is mid-turn; it aborts the session itself.
        if let Ok(mut slot) = entry.session.try_lock() {
            if let Some(mut session) = slot.take() {
                session.abort().await;
            }
        }
        entry.transition(TaskStatus::Stopped);
        tracing::info!(task_id = %id, "task stopped");
        Ok(entry.view())
    }

    pub async fn shutdown(&self) {
        self.shared.factory.shutdown().await;
    }

    fn enqueue(&self, id: &str) -> PilotResult<()> {
        self.queue
            .send(id.to_string())
            .map_err(|_| PilotError::Agent("task worker is not running".into()))
    }
}

async fn work(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = rx.recv().await {
        match shared.entry(&id) {
            Ok(entry) => shared.process(entry).await,
            Err(e) => tracing::warn!(error = %e, "dequeued unknown task"),
        }
    }
    tracing::debug!("task worker exiting");
}

fn compact(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut clipped: String = collapsed.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

/// Production factory: LLM decision-maker from the registry, browser from
/// the shared slot.
pub struct RuntimeFactory {
    config: AppConfig,
    registry: ProviderRegistry,
    slot: AsyncMutex<BrowserSlot>,
}

impl RuntimeFactory {
    pub fn new(config: AppConfig, registry: ProviderRegistry, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            config,
            registry,
            slot: AsyncMutex::new(BrowserSlot::new(launcher)),
        }
    }

    fn decider(&self, options: &TaskOptions) -> PilotResult<LlmDecisionMaker> {
        let binding = self
            .registry
            .binding_for_task(options.provider.as_deref(), options.model.as_deref())?;
        LlmDecisionMaker::from_registry(&self.registry, binding, options.is_pinned())
    }
}

#[async_trait]
impl SessionFactory for RuntimeFactory {
    async fn create_session(&self, task: &Task, emit: EventSink) -> PilotResult<AgentSession> {
        let decider = Arc::new(self.decider(&task.options)?);
        let profile = profile_dir(&self.config.browser, task.options.safe_mode)?;
        let controller = self.slot.lock().await.acquire(&profile).await?;
        let search_engine = task
            .options
            .search_engine
            .clone()
            .filter(|engine| !engine.trim().is_empty())
            .unwrap_or_else(|| self.config.browser.search_engine.clone());
        let settings = SessionSettings {
            goal: task.prompt.clone(),
            browser_only: task.options.browser_only,
            search_engine,
            screenshot_dir: self.config.browser.screenshot_dir.clone(),
            agent: self.config.agent.clone(),
        };
        Ok(AgentSession::new(settings, controller, false, decider, emit))
    }

    async fn direct_answer(&self, task: &Task) -> PilotResult<String> {
        let decider = self.decider(&task.options)?;
        decider
            .complete(Purpose::Answer, prompts::DIRECT_ANSWER_SYSTEM, &task.prompt)
            .await
    }

    async fn shutdown(&self) {
        self.slot.lock().await.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::ToolCall;
    use crate::agents::{Decision, DecisionContext, Role};
    use crate::config::AgentConfig;
    use crate::testing::{FakeBrowser, FakeDecider};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Never answers; stands in for a provider call that hangs.
    struct Hanging;

    #[async_trait]
    impl DecisionMaker for Hanging {
        async fn decide(&self, _role: Role, _ctx: &DecisionContext) -> PilotResult<Decision> {
            std::future::pending().await
        }

        async fn complete(&self, _purpose: Purpose, _system: &str, _user: &str) -> PilotResult<String> {
            std::future::pending().await
        }
    }

    struct TestFactory {
        browser: Arc<FakeBrowser>,
        deciders: Mutex<VecDeque<Arc<dyn DecisionMaker>>>,
        answer: Option<String>,
        failure: Mutex<Option<PilotError>>,
        dir: tempfile::TempDir,
    }

    impl TestFactory {
        fn new(deciders: Vec<Arc<dyn DecisionMaker>>) -> Self {
            Self {
                browser: Arc::new(FakeBrowser::default()),
                deciders: Mutex::new(deciders.into()),
                answer: None,
                failure: Mutex::new(None),
                dir: tempfile::tempdir().unwrap(),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for TestFactory {
        async fn create_session(&self, task: &Task, emit: EventSink) -> PilotResult<AgentSession> {
            if let Some(error) = self.failure.lock().unwrap().take() {
                return Err(error);
            }
            let decider = self
                .deciders
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Arc::new(FakeDecider::default()));
            let settings = SessionSettings {
                goal: task.prompt.clone(),
                browser_only: task.options.browser_only,
                search_engine: "google".into(),
                screenshot_dir: self.dir.path().to_path_buf(),
                agent: AgentConfig::default(),
            };
            Ok(AgentSession::new(settings, self.browser.clone(), false, decider, emit))
        }

        async fn direct_answer(&self, _task: &Task) -> PilotResult<String> {
            self.answer
                .clone()
                .ok_or_else(|| PilotError::LlmProvider("no answer".into()))
        }
    }

    fn finishing(result: &str) -> Arc<dyn DecisionMaker> {
        Arc::new(FakeDecider::default().then(ToolCall::new("finish", json!({ "result": result }))))
    }

    async fn wait_for(scheduler: &TaskScheduler, id: &str, status: TaskStatus) -> TaskView {
        for _ in 0..300 {
            let view = scheduler.get_task(id).unwrap();
            if view.status == status {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}: {:?}", scheduler.get_task(id).unwrap());
    }

    #[tokio::test]
    async fn one_active_task_at_a_time() {
        let asking: Arc<dyn DecisionMaker> = Arc::new(
            FakeDecider::default()
                .then(ToolCall::new("ask_user", json!({ "question": "Which account?" })))
                .then(ToolCall::new("finish", json!({ "result": "done" }))),
        );
        let scheduler = TaskScheduler::new(Arc::new(TestFactory::new(vec![asking, finishing("again")])));

        let first = scheduler.create_task("say hi", TaskOptions::default()).unwrap();
        wait_for(&scheduler, &first.id, TaskStatus::WaitingUser).await;

        let rejected = scheduler.create_task("another one", TaskOptions::default());
        assert!(matches!(rejected, Err(PilotError::Conflict(_))));

        scheduler
            .confirm_task(&first.id, Some("the work one".into()))
            .await
            .unwrap();
        let done = wait_for(&scheduler, &first.id, TaskStatus::Done).await;
        assert_eq!(done.result.as_deref(), Some("done"));

        let second = scheduler.create_task("another one", TaskOptions::default()).unwrap();
        wait_for(&scheduler, &second.id, TaskStatus::Done).await;
    }

    #[tokio::test]
    async fn event_stream_ends_after_terminal_status() {
        let scheduler = TaskScheduler::new(Arc::new(TestFactory::new(vec![finishing("done")])));
        let task = scheduler.create_task("say hi", TaskOptions::default()).unwrap();
        wait_for(&scheduler, &task.id, TaskStatus::Done).await;

        let mut sub = scheduler.subscribe(&task.id).unwrap();
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event.message);
        }
        assert_eq!(
            events.first(),
            Some(&AgentMessage::Status {
                status: TaskStatus::Queued
            })
        );
        assert!(events.contains(&AgentMessage::Status {
            status: TaskStatus::Running
        }));
        assert!(events.contains(&AgentMessage::Result { result: "done".into() }));
        assert_eq!(
            events.last(),
            Some(&AgentMessage::Status {
                status: TaskStatus::Done
            })
        );
    }

    #[tokio::test]
    async fn stop_while_paused() {
        let asking: Arc<dyn DecisionMaker> =
            Arc::new(FakeDecider::default().then(ToolCall::new("ask_user", json!({ "question": "?" }))));
        let factory = Arc::new(TestFactory::new(vec![asking]));
        let scheduler = TaskScheduler::new(factory.clone());
        let task = scheduler.create_task("say hi", TaskOptions::default()).unwrap();
        wait_for(&scheduler, &task.id, TaskStatus::WaitingUser).await;

        let view = scheduler.stop_task(&task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Stopped);
        // The slot's browser is shared and stays open.
        assert!(!factory.browser.is_closed());
        assert!(matches!(
            scheduler.confirm_task(&task.id, None).await,
            Err(PilotError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stop_interrupts_a_hanging_turn() {
        let hanging: Arc<dyn DecisionMaker> = Arc::new(Hanging);
        let scheduler = TaskScheduler::new(Arc::new(TestFactory::new(vec![hanging, finishing("next")])));
        let task = scheduler.create_task("say hi", TaskOptions::default()).unwrap();
        wait_for(&scheduler, &task.id, TaskStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            scheduler.create_task("other", TaskOptions::default()),
            Err(PilotError::Conflict(_))
        ));

        let view = scheduler.stop_task(&task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Stopped);

        // The worker is free again.
        let next = scheduler.create_task("say hi again", TaskOptions::default()).unwrap();
        let done = wait_for(&scheduler, &next.id, TaskStatus::Done).await;
        assert_eq!(done.result.as_deref(), Some("next"));
        assert_eq!(scheduler.get_task(&task.id).unwrap().status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn direct_mode_answers_without_a_session() {
        let mut factory = TestFactory::new(vec![]);
        factory.answer = Some("4".into());
        let scheduler = TaskScheduler::new(Arc::new(factory));
        let options = TaskOptions {
            browser_only: false,
            ..TaskOptions::default()
        };
        let task = scheduler.create_task("what is 2+2", options).unwrap();
        assert_eq!(task.mode, TaskMode::Direct);

        let done = wait_for(&scheduler, &task.id, TaskStatus::Done).await;
        assert_eq!(done.result.as_deref(), Some("4"));
        let mut sub = scheduler.subscribe(&task.id).unwrap();
        let mut tools = Vec::new();
        while let Some(event) = sub.next().await {
            if let AgentMessage::Log(log) = event.message {
                tools.push(log.tool);
            }
        }
        assert_eq!(tools, vec!["direct_answer".to_string()]);
    }

    #[tokio::test]
    async fn configuration_error_ends_task() {
        let factory = TestFactory::new(vec![]);
        *factory.failure.lock().unwrap() = Some(PilotError::Config("Missing API key for provider 'openai'".into()));
        let scheduler = TaskScheduler::new(Arc::new(factory));
        let task = scheduler.create_task("say hi", TaskOptions::default()).unwrap();

        let failed = wait_for(&scheduler, &task.id, TaskStatus::Error).await;
        assert!(failed.error.unwrap().contains("Missing API key"));
        let events = {
            let mut sub = scheduler.subscribe(&task.id).unwrap();
            let mut kinds = Vec::new();
            while let Some(event) = sub.next().await {
                kinds.push(event.message.kind());
            }
            kinds
        };
        assert_eq!(events, vec!["status", "status", "error", "status"]);
    }

    #[tokio::test]
    async fn unknown_ids_and_empty_prompts() {
        let scheduler = TaskScheduler::new(Arc::new(TestFactory::new(vec![])));
        assert!(matches!(scheduler.get_task("nope"), Err(PilotError::NotFound(_))));
        assert!(matches!(scheduler.stop_task("nope").await, Err(PilotError::NotFound(_))));
        assert!(matches!(
            scheduler.create_task("   ", TaskOptions::default()),
            Err(PilotError::InvalidInput(_))
        ));
    }

    #[test]
    fn compact_collapses_and_clips() {
        assert_eq!(compact("a\n  b\tc", 200), "a b c");
        assert_eq!(compact("abcdef", 3), "abc...");
    }
}
