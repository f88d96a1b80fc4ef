use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::agent_engine::coordinator::Coordinator;
use crate::agent_engine::event_bus::{AgentMessage, EventSink, StepLog};
use crate::agent_engine::goals::GoalTracker;
use crate::agent_engine::guards::{self, GuardInput, GuardVerdict};
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::memory::{MemoryState, StepRecord, StepStatus, Summarizer};
use crate::agent_engine::signals::{self, AccessIssue, Language};
use crate::agent_engine::state::{PendingAction, SessionState, ToolCall, ToolName};
use crate::agents::{Decision, DecisionContext, DecisionMaker, Role};
use crate::browser::{BrowserController, Observation};
use crate::config::AgentConfig;
use crate::errors::PilotResult;
use crate::executor::dispatcher::ToolExecutor;
use crate::executor::safety::SecurityPolicy;

const RECENT_STEPS: usize = 12;
const RECENT_FACTS: usize = 10;
const FACT_CHARS: usize = 500;
const OUTPUT_CHARS: usize = 300;

/// Per-task inputs of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub goal: String,
    pub browser_only: bool,
    pub search_engine: String,
    pub screenshot_dir: PathBuf,
    pub agent: AgentConfig,
}

enum Flow {
    Continue,
    Yield,
}

/// The per-task state machine. `run()` advances until a pause or terminal
/// state and may be called again after `confirm()`/`provide_user_input()`.
pub struct AgentSession {
    goal: String,
    browser_only: bool,
    search_engine: String,
    language: Language,

    controller: Arc<dyn BrowserController>,
    /// False when the browser belongs to the scheduler's slot.
    owns_controller: bool,
    decider: Arc<dyn DecisionMaker>,
    executor: ToolExecutor,
    emit: EventSink,

    memory: MemoryState,
    summarizer: Summarizer,
    security: SecurityPolicy,
    coordinator: Coordinator,
    loop_ctrl: LoopController,
    goals: GoalTracker,

    state: SessionState,
    pending: Option<PendingAction>,
    confirmed: bool,
    step: u32,
    max_steps: u32,
    has_browser_action: bool,
    bootstrapped: bool,
    stop_requested: Arc<AtomicBool>,
    reported_issues: HashSet<(String, AccessIssue)>,
}

impl AgentSession {
    pub fn new(
        settings: SessionSettings,
        controller: Arc<dyn BrowserController>,
        owns_controller: bool,
        decider: Arc<dyn DecisionMaker>,
        emit: EventSink,
    ) -> Self {
        let agent = &settings.agent;
        let executor = ToolExecutor::new(controller.clone(), decider.clone(), settings.screenshot_dir.clone());
        let goals = GoalTracker::from_goal(&settings.goal);
        if goals.is_ordered() {
            tracing::info!(urls = ?goals.urls(), "goal URLs must be visited in order");
        }
        Self {
            language: signals::detect_language(&settings.goal),
            goal: settings.goal.clone(),
            browser_only: settings.browser_only,
            search_engine: settings.search_engine.clone(),
            controller,
            owns_controller,
            decider,
            executor,
            emit,
            memory: MemoryState::new(agent.memory_max_steps),
            summarizer: Summarizer::new(agent.summarize_above, agent.summary_keep_last),
            security: SecurityPolicy,
            coordinator: Coordinator,
            loop_ctrl: LoopController::from_config(agent),
            goals,
            state: SessionState::Running,
            pending: None,
            confirmed: false,
            step: 0,
            max_steps: agent.max_steps,
            has_browser_action: false,
            bootstrapped: false,
            stop_requested: Arc::new(AtomicBool::new(false)),
            reported_issues: HashSet::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn memory(&self) -> &MemoryState {
        &self.memory
    }

    pub fn goals(&self) -> &GoalTracker {
        &self.goals
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn steps_taken(&self) -> u32 {
        self.step
    }

    /// Shared flag checked at the top of every loop iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stop_is_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resumes a paused session. A pending action will run on the next `run()`.
    pub fn confirm(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(url) = self.goals.note_user_reply() {
            self.memory.add_fact(format!("Skipped unreachable goal URL: {url}"));
        }
        self.confirmed = self.pending.is_some();
        // A human stepped in; the consecutive-failure budget starts over.
        self.loop_ctrl.record_success();
        self.state = SessionState::Running;
    }

    /// Records the reply as a fact and resumes. A declining reply discards
    /// the pending action instead of confirming it.
    pub fn provide_user_input(&mut self, reply: &str) {
        if self.state.is_terminal() {
            return;
        }
        let reply = reply.trim();
        if !reply.is_empty() {
            self.memory.add_fact(format!("User reply: {reply}"));
        }
        if self.pending.is_some() && signals::is_decline(reply) {
            if let Some(declined) = self.pending.take() {
                tracing::info!(tool = %declined.call.name, "pending action declined by user");
                self.memory.add_fact(format!(
                    "User declined: {} {}",
                    declined.call.name,
                    Value::Object(declined.call.arguments)
                ));
            }
            self.confirmed = false;
            self.loop_ctrl.record_success();
            self.state = SessionState::Running;
            return;
        }
        self.confirm();
    }

    /// Forced termination from outside the loop.
    pub async fn abort(&mut self) {
        self.request_stop();
        self.pending = None;
        self.confirmed = false;
        if !self.state.is_terminal() {
            self.state = SessionState::Stopped;
        }
        self.close_if_owned().await;
    }

    pub async fn run(&mut self) -> PilotResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.stop_is_requested() {
            self.stop("stop requested").await;
            return Ok(());
        }

        if self.confirmed {
            self.confirmed = false;
            if let Some(pending) = self.pending.take() {
                tracing::info!(tool = %pending.call.name, "executing confirmed action");
                let ok = self
                    .execute_step(pending.call, pending.rationale, &pending.observation)
                    .await?;
                if !ok && self.loop_ctrl.retries_exhausted() {
                    let question = self.localized(
                        "Action failed repeatedly. Please assist.",
                        "Действие несколько раз завершилось ошибкой. Помогите, пожалуйста.",
                    );
                    self.pause_for_user(question);
                    return Ok(());
                }
            }
        }

        if self.state.is_paused() {
            return Ok(());
        }

        if !self.bootstrapped {
            self.bootstrapped = true;
            if self.browser_only && !self.bootstrap().await {
                return Ok(());
            }
        }

        while self.step < self.max_steps {
            if self.stop_is_requested() {
                self.stop("stop requested").await;
                return Ok(());
            }
            if let Flow::Yield = self.advance().await? {
                return Ok(());
            }
        }

        tracing::info!(steps = self.step, "step budget exhausted");
        self.finish("Max steps reached without completion.".into()).await;
        Ok(())
    }

    /// One loop iteration: observe, pick an action, gate it, execute it.
    async fn advance(&mut self) -> PilotResult<Flow> {
        let observation = match self.controller.snapshot().await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot failed");
                self.loop_ctrl.record_failure();
                self.emit_log(StepLog {
                    step: self.step,
                    tool: "snapshot".into(),
                    reason: "observe".into(),
                    url: None,
                    title: None,
                    status: StepStatus::Error,
                    error: Some(e.to_string()),
                    output: None,
                    duration_ms: 0,
                });
                if self.loop_ctrl.retries_exhausted() {
                    let question = self.localized(
                        "The browser page cannot be read. Please check the browser window.",
                        "Не удаётся прочитать страницу браузера. Проверьте окно браузера.",
                    );
                    self.pause_for_user(question);
                    return Ok(Flow::Yield);
                }
                return Ok(Flow::Continue);
            }
        };
        self.loop_ctrl.observe(&observation);

        if let Some(issue) = signals::detect_access_issue(&observation.title, &observation.visible_text) {
            if self.reported_issues.insert((observation.url.clone(), issue)) {
                tracing::warn!(issue = issue.as_str(), url = %observation.url, "access issue detected");
                self.pause_for_user(issue.message(self.language).to_string());
                return Ok(Flow::Yield);
            }
        }

        let forced = self.goals.forced_action(
            &observation,
            self.loop_ctrl.stall_count(),
            self.loop_ctrl.no_progress_limit(),
        );
        let (call, rationale) = match forced {
            Some(call) => {
                tracing::info!(tool = %call.name, args = %serde_json::Value::Object(call.arguments.clone()), "goal URL order forces action");
                (call, "Visiting the goal URLs in the requested order.".to_string())
            }
            None => match self.choose_action(&observation).await? {
                Some(chosen) => chosen,
                None => return Ok(Flow::Yield),
            },
        };

        match call.tool() {
            Some(ToolName::AskUser) => {
                let question = match call.str_arg("question") {
                    Some(q) => q.to_string(),
                    None => self.localized("Need your input to continue.", "Нужен ваш ответ, чтобы продолжить."),
                };
                self.pause_for_user(question);
                return Ok(Flow::Yield);
            }
            Some(ToolName::Finish) => {
                let result = call.str_arg("result").unwrap_or("Task completed.").to_string();
                self.finish(result).await;
                return Ok(Flow::Yield);
            }
            Some(ToolName::StopTask) => {
                let reason = call.str_arg("reason").unwrap_or("stopped by agent").to_string();
                self.stop(&reason).await;
                return Ok(Flow::Yield);
            }
            _ => {}
        }

        if let Some(confirmation) = self.security.check(&call.name, &call.arguments, &observation) {
            self.emit(AgentMessage::NeedsConfirmation {
                step: self.step,
                tool: call.name.clone(),
                summary: confirmation.summary,
                reason: rationale.clone(),
                args: call.arguments.clone(),
            });
            self.pending = Some(PendingAction {
                call,
                rationale,
                observation,
            });
            self.state = SessionState::WaitingConfirm;
            return Ok(Flow::Yield);
        }

        let ok = self.execute_step(call, rationale, &observation).await?;
        if !ok && self.loop_ctrl.retries_exhausted() {
            let question = self.localized(
                "Action failed repeatedly. Please assist.",
                "Действие несколько раз завершилось ошибкой. Помогите, пожалуйста.",
            );
            self.pause_for_user(question);
            return Ok(Flow::Yield);
        }
        Ok(Flow::Continue)
    }

    /// Asks the routed role, recovers from an empty answer, then runs the
    /// guards. `None` means the session paused.
    async fn choose_action(&mut self, observation: &Observation) -> PilotResult<Option<(ToolCall, String)>> {
        let role = if self.loop_ctrl.is_stalled() {
            Role::Reflector
        } else {
            self.coordinator.select(
                &self.goal,
                &self.memory,
                observation,
                self.loop_ctrl.error_count(),
                self.loop_ctrl.stall_count(),
            )
        };
        tracing::debug!(role = %role, step = self.step, "decision requested");

        let decision = self.decide(role, observation).await?;
        let (call, rationale) = match decision.tool_call {
            Some(call) => (call, decision.rationale),
            None => {
                self.loop_ctrl.record_failure();
                let reason = if decision.rationale.trim().is_empty() {
                    "No tool call".to_string()
                } else {
                    decision.rationale
                };
                self.emit_log(StepLog {
                    step: self.step,
                    tool: "none".into(),
                    reason,
                    url: Some(observation.url.clone()),
                    title: Some(observation.title.clone()),
                    status: StepStatus::Error,
                    error: None,
                    output: None,
                    duration_ms: 0,
                });
                if self.loop_ctrl.retries_exhausted() {
                    let question = self.localized(
                        "Unable to choose next action. Please assist.",
                        "Не удаётся выбрать следующее действие. Помогите, пожалуйста.",
                    );
                    self.pause_for_user(question);
                    return Ok(None);
                }
                if let Some(fallback) = guards::fallback_action(&self.goal, observation, &self.memory) {
                    tracing::info!(tool = %fallback.name, "empty decision, using fallback heuristic");
                    (fallback, "Fallback heuristic after an empty decision.".to_string())
                } else {
                    let retry = self.decide(Role::Reflector, observation).await?;
                    match retry.tool_call {
                        Some(call) => (call, retry.rationale),
                        None => {
                            let question = self.localized(
                                "Reflection failed. Please assist.",
                                "Не удалось найти выход. Помогите, пожалуйста.",
                            );
                            self.pause_for_user(question);
                            return Ok(None);
                        }
                    }
                }
            }
        };

        let verdict = guards::check(&GuardInput {
            goal: &self.goal,
            call: &call,
            observation,
            memory: &self.memory,
            stalled: self.loop_ctrl.is_stalled(),
            fallback_used: self.loop_ctrl.fallback_used(),
            language: self.language,
        });
        match verdict {
            GuardVerdict::Proceed => Ok(Some((call, rationale))),
            GuardVerdict::Replace { call: replacement, reason } => {
                // While stalled only the progress guard can replace.
                if self.loop_ctrl.is_stalled() {
                    self.loop_ctrl.mark_fallback_used();
                }
                tracing::info!(proposed = %call.name, replacement = %replacement.name, reason = %reason, "guard replaced action");
                Ok(Some((replacement, reason)))
            }
            GuardVerdict::Pause { question } => {
                tracing::info!(proposed = %call.name, "guard paused session");
                self.pause_for_user(question);
                Ok(None)
            }
        }
    }

    /// Fatal errors (bad credentials, rate limits) end the task; anything
    /// else counts as an empty decision.
    async fn decide(&self, role: Role, observation: &Observation) -> PilotResult<Decision> {
        let ctx = self.context(observation);
        match self.decider.decide(role, &ctx).await {
            Ok(decision) => Ok(decision),
            Err(e) if e.is_fatal() => {
                tracing::error!(role = %role, error = %e, "fatal decision error");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(role = %role, error = %e, "decision failed");
                Ok(Decision::none(e.to_string()))
            }
        }
    }

    fn context(&self, observation: &Observation) -> DecisionContext {
        DecisionContext {
            goal: self.goal.clone(),
            memory_summary: self.memory.summary.clone(),
            recent_facts: self.memory.recent_facts(RECENT_FACTS),
            recent_steps: self.memory.recent_steps(RECENT_STEPS),
            observation: observation.clone(),
            browser_only: self.browser_only,
            has_browser_action: self.has_browser_action,
            ordered_goal_urls: self.goals.ordered_urls(),
            visited_goal_urls: self.goals.visited_urls(),
        }
    }

    /// Runs one action and records exactly one step and one log event.
    /// Returns whether the action succeeded; fatal provider errors (from
    /// `extract`) are recorded and then propagated.
    async fn execute_step(&mut self, call: ToolCall, rationale: String, before: &Observation) -> PilotResult<bool> {
        self.step += 1;
        let started = Instant::now();
        let tool = call.tool();
        let mut fatal = None;

        let (status, error, output) = match self.executor.execute(&call, before).await {
            Ok(output) => {
                self.loop_ctrl.record_success();
                if tool.map_or(false, |t| t.is_browser_action()) {
                    self.has_browser_action = true;
                }
                if tool == Some(ToolName::Extract) && output.is_object() {
                    self.memory.add_fact(clip(&output.to_string(), FACT_CHARS));
                }
                (StepStatus::Ok, None, Some(output))
            }
            Err(e) => {
                self.loop_ctrl.record_failure();
                tracing::warn!(step = self.step, tool = %call.name, error = %e, "tool failed");
                if let Err(shot) = self.executor.screenshot("error").await {
                    tracing::debug!(error = %shot, "error screenshot skipped");
                }
                let message = e.to_string();
                if e.is_fatal() {
                    fatal = Some(e);
                }
                (StepStatus::Error, Some(message), None)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let after = match self.controller.snapshot().await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::debug!(error = %e, "post-action snapshot failed");
                before.clone()
            }
        };

        self.goals.record_step(&call, status == StepStatus::Ok, &before.url);
        self.memory.add_step(StepRecord {
            step: self.step,
            tool: call.name.clone(),
            args: call.arguments.clone(),
            rationale: rationale.clone(),
            url: after.url.clone(),
            title: after.title.clone(),
            status,
            error: error.clone(),
            duration_ms,
        });
        self.summarizer
            .maybe_summarize(&mut self.memory, self.decider.as_ref())
            .await;

        self.emit_log(StepLog {
            step: self.step,
            tool: call.name,
            reason: rationale,
            url: Some(after.url),
            title: Some(after.title),
            status,
            error,
            output: output.map(|v| clip(&v.to_string(), OUTPUT_CHARS)),
            duration_ms,
        });
        match fatal {
            Some(e) => {
                tracing::error!(step = self.step, error = %e, "fatal tool error");
                Err(e)
            }
            None => Ok(status == StepStatus::Ok),
        }
    }

    /// First-turn navigation for browser-only tasks, retried once in a new
    /// tab. Returns false when the session paused.
    async fn bootstrap(&mut self) -> bool {
        let url = signals::bootstrap_url(&self.goal, &self.search_engine);
        tracing::info!(url = %url, "bootstrap navigation");
        self.step += 1;
        let started = Instant::now();

        let mut error = None;
        if let Err(first) = self.controller.navigate(&url).await {
            tracing::warn!(error = %first, "bootstrap navigation failed, retrying in a new tab");
            let retry = async {
                self.controller.select_page(true).await?;
                self.controller.navigate(&url).await
            };
            if let Err(second) = retry.await {
                error = Some(format!("{first} | retry: {second}"));
            }
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        let after = self.controller.snapshot().await.unwrap_or_default();

        let ok = error.is_none();
        if ok {
            self.has_browser_action = true;
            self.loop_ctrl.record_success();
        } else {
            self.loop_ctrl.record_failure();
        }
        let call = ToolCall::new("navigate", json!({ "url": url }));
        self.goals.record_step(&call, ok, &after.url);
        let status = if ok { StepStatus::Ok } else { StepStatus::Error };
        self.memory.add_step(StepRecord {
            step: self.step,
            tool: call.name.clone(),
            args: call.arguments.clone(),
            rationale: "bootstrap".into(),
            url: after.url.clone(),
            title: after.title.clone(),
            status,
            error: error.clone(),
            duration_ms,
        });
        self.emit_log(StepLog {
            step: self.step,
            tool: call.name,
            reason: "bootstrap".into(),
            url: Some(after.url),
            title: Some(after.title),
            status,
            error,
            output: Some(json!({ "url": url }).to_string()),
            duration_ms,
        });

        if !ok {
            let question = self.localized(
                "Failed to open the start page. Please provide a URL or guidance.",
                "Не удалось открыть стартовую страницу. Укажите URL или подскажите, что делать.",
            );
            self.pause_for_user(question);
        }
        ok
    }

    fn pause_for_user(&mut self, question: String) {
        tracing::info!(question = %question, "pausing for user input");
        self.emit(AgentMessage::NeedsUserInput {
            question: question.clone(),
        });
        self.state = SessionState::WaitingUser { question };
    }

    async fn finish(&mut self, result: String) {
        tracing::info!(result = %result, steps = self.step, "session finished");
        self.emit(AgentMessage::Result { result: result.clone() });
        self.pending = None;
        self.state = SessionState::Done { result };
        self.close_if_owned().await;
    }

    async fn stop(&mut self, reason: &str) {
        tracing::info!(reason, steps = self.step, "session stopped");
        self.pending = None;
        self.state = SessionState::Stopped;
        self.close_if_owned().await;
    }

    async fn close_if_owned(&self) {
        if !self.owns_controller {
            return;
        }
        if let Err(e) = self.controller.close().await {
            tracing::debug!(error = %e, "closing browser failed");
        }
    }

    fn emit(&self, message: AgentMessage) {
        (self.emit)(message);
    }

    fn emit_log(&self, log: StepLog) {
        self.emit(AgentMessage::Log(log));
    }

    fn localized(&self, en: &str, ru: &str) -> String {
        match self.language {
            Language::En => en.to_string(),
            Language::Ru => ru.to_string(),
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
