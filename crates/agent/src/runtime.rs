//! The agent loop: DECIDE / EXECUTE / PAUSED / DONE.
//!
//! One run drives the model and the browser strictly one step at a time. The
//! [`PauseController`] is sampled only before a queued call is dequeued and
//! before the model is asked, so a pause or cancel never interrupts an action
//! that already started. A cancel records every call it leaves unexecuted. Human
//! overrides run ahead of the queue and suppress queued model calls aimed at
//! the same target.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proto::{Error, LoopState, RunEvent, RunId, StepOutcome, StepSource, ToolCall, ToolResult};
use serde_json::Value;
use tokio::sync::mpsc;
use tools::BrowserDriver;
use tracing::{debug, info, warn};

use crate::{
    control::{PauseController, PauseExit},
    llm::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, TokenUsage, human_step_note},
    tool_registry::{Catalog, ToolRegistry},
    trace::ExecutionTrace,
};

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You complete the user's task by calling the browser tools you are given, one small step at a time.

Guidelines:
1. Check the current page context before acting; prefer the selectors listed there.
2. When a full URL is provided, navigate to it directly.
3. Never type secrets in clear text. Use ${NAME} placeholders (for example ${PASSWORD}); they are resolved when the action runs.
4. If an action fails, read the error and try a different approach.
5. A human operator may take over and act directly. Treat their actions as authoritative and do not repeat or undo them.
6. When the task is complete, reply with a short summary and no tool calls."#;

/// Default number of DECIDE rounds per run.
pub const DEFAULT_MAX_ROUNDS: usize = 25;
/// Default interval between pause reminders.
pub const DEFAULT_PAUSE_REMINDER: Duration = Duration::from_secs(300);

/// Run settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Target model id.
    pub model: String,
    /// DECIDE rounds allowed before the run fails with `RoundLimitExceeded`.
    pub max_rounds: usize,
    /// How often to remind while paused.
    pub pause_reminder: Duration,
    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            pause_reminder: DEFAULT_PAUSE_REMINDER,
            system_prompt: None,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The model decided the task was complete.
    Completed,
    /// An external cancel was honored at a safe point.
    Cancelled,
}

/// Result of a run that ended normally
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub task: String,
    pub status: RunStatus,
    /// Last text the model produced, if any.
    pub final_message: Option<String>,
    pub trace: ExecutionTrace,
    pub usage: TokenUsage,
}

/// A run aborted by a fault other than a failed action. The partial trace is kept.
#[derive(Debug, thiserror::Error)]
#[error("run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: RunId,
    pub task: String,
    #[source]
    pub error: Error,
    pub trace: ExecutionTrace,
}

/// Mutable state threaded through one run.
struct AgentContext {
    messages: Vec<ChatMessage>,
    queue: VecDeque<ToolCall>,
    /// Human actions not yet reported to the model.
    notes: Vec<String>,
    trace: ExecutionTrace,
    round: usize,
    final_message: Option<String>,
    /// Set when the model answered with no calls while a pause or override
    /// was pending. Cleared once a human step runs.
    model_done: bool,
    usage: TokenUsage,
}

/// Drives runs against a model, a tool registry and a browser
pub struct AgentLoop {
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    driver: Arc<dyn BrowserDriver>,
    config: AgentConfig,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        driver: Arc<dyn BrowserDriver>,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            registry,
            driver,
            config,
            events: None,
        }
    }

    /// Sends [`RunEvent`]s to `tx`. Sends never block the loop; events are
    /// dropped when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    fn transition(&self, state: &mut LoopState, to: LoopState) {
        if *state != to {
            debug!(from = %state, to = %to, "Loop transition");
            self.emit(RunEvent::StateChanged { from: *state, to });
            *state = to;
        }
    }

    /// Runs `task` to completion, cancellation, or failure.
    ///
    /// The run uses the registry snapshot taken here. `controller` is the
    /// loop side of the operator's [`crate::ControlHandle`].
    pub async fn run(
        &self,
        task: &str,
        controller: &PauseController,
    ) -> Result<RunReport, RunFailure> {
        let run_id = RunId::new();
        let catalog = self.registry.snapshot();
        controller.begin_run(catalog.clone());
        info!(run_id = %run_id, tools = catalog.len(), "Run started: {task:.80}");

        let mut ctx = AgentContext {
            messages: Vec::new(),
            queue: VecDeque::new(),
            notes: Vec::new(),
            trace: ExecutionTrace::new(),
            round: 0,
            final_message: None,
            model_done: false,
            usage: TokenUsage::default(),
        };

        let outcome = self.drive(task, &catalog, controller, &mut ctx).await;
        controller.finish_run();

        match outcome {
            Ok(status) => {
                info!(
                    run_id = %run_id,
                    ?status,
                    steps = ctx.trace.len(),
                    prompt_tokens = ctx.usage.prompt_tokens,
                    completion_tokens = ctx.usage.completion_tokens,
                    "Run ended"
                );
                if status == RunStatus::Cancelled {
                    self.emit(RunEvent::Cancelled {
                        completed_steps: ctx.trace.executed().count(),
                    });
                } else {
                    self.emit(RunEvent::Finished {
                        steps: ctx.trace.len(),
                    });
                }
                Ok(RunReport {
                    run_id,
                    task: task.to_string(),
                    status,
                    final_message: ctx.final_message,
                    trace: ctx.trace,
                    usage: ctx.usage,
                })
            }
            Err(error) => {
                warn!(run_id = %run_id, steps = ctx.trace.len(), "Run failed: {error}");
                Err(RunFailure {
                    run_id,
                    task: task.to_string(),
                    error,
                    trace: ctx.trace,
                })
            }
        }
    }

    async fn drive(
        &self,
        task: &str,
        catalog: &Catalog,
        controller: &PauseController,
        ctx: &mut AgentContext,
    ) -> Result<RunStatus, Error> {
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        ctx.messages.push(ChatMessage::system(system_prompt));
        let page = self.driver.observe_state().await?;
        ctx.messages.push(ChatMessage::task(task, &page));

        let tool_defs = catalog.definitions();
        let mut state = LoopState::Decide;

        loop {
            match state {
                LoopState::Decide => {
                    if controller.is_cancelled() {
                        return Ok(self.abandon(controller, ctx));
                    }
                    if controller.pause_requested() {
                        self.transition(&mut state, LoopState::Paused);
                        continue;
                    }
                    if controller.has_pending_override() {
                        self.transition(&mut state, LoopState::Execute);
                        continue;
                    }
                    if ctx.round >= self.config.max_rounds {
                        warn!("Max rounds ({}) reached", self.config.max_rounds);
                        return Err(Error::RoundLimitExceeded(self.config.max_rounds));
                    }
                    if ctx.round > 0 {
                        self.refresh_context(ctx).await?;
                    }
                    ctx.round += 1;
                    self.emit(RunEvent::Deciding { round: ctx.round });

                    let req = ChatRequest {
                        messages: ctx.messages.clone(),
                        tools: tool_defs.clone(),
                        model: self.config.model.clone(),
                    };
                    debug!("LLM call (round {})", ctx.round);
                    let t0 = std::time::Instant::now();
                    let response = self.llm.chat(req).await?;
                    debug!(elapsed_ms = %t0.elapsed().as_millis(), round = ctx.round, "LLM response received");

                    let calls = match response {
                        ChatResponse::Text(text, usage) => {
                            ctx.usage.add(&usage);
                            ctx.messages.push(ChatMessage::assistant(&text));
                            ctx.final_message = Some(text);
                            Vec::new()
                        }
                        ChatResponse::ToolCalls(calls, usage) => {
                            ctx.usage.add(&usage);
                            calls
                        }
                    };

                    if calls.is_empty() {
                        // A pause or override that arrived during the call still gets its turn.
                        if controller.pause_requested() || controller.has_pending_override() {
                            ctx.model_done = true;
                            self.transition(&mut state, LoopState::Execute);
                        } else {
                            self.transition(&mut state, LoopState::Done);
                        }
                        continue;
                    }

                    debug!(
                        "Tool calls requested: {:?}",
                        calls.iter().map(|tc| &tc.name).collect::<Vec<_>>()
                    );
                    ctx.final_message = None;
                    ctx.messages.push(ChatMessage::planned(&calls));
                    self.emit(RunEvent::CallsQueued { count: calls.len() });
                    ctx.queue.extend(calls);
                    self.transition(&mut state, LoopState::Execute);
                }

                LoopState::Execute => {
                    // Safe point: nothing is in flight here.
                    if controller.is_cancelled() {
                        return Ok(self.abandon(controller, ctx));
                    }
                    if controller.pause_requested() {
                        self.transition(&mut state, LoopState::Paused);
                        continue;
                    }

                    if let Some(call) = controller.take_override() {
                        self.execute_override(catalog, ctx, call).await?;
                        ctx.model_done = false;
                    } else if let Some(call) = ctx.queue.pop_front() {
                        self.execute_model_call(catalog, ctx, call).await?;
                    }

                    let next = if !ctx.queue.is_empty() {
                        LoopState::Execute
                    } else if ctx.model_done {
                        LoopState::Done
                    } else {
                        LoopState::Decide
                    };
                    self.transition(&mut state, next);
                }

                LoopState::Paused => {
                    let completed_steps = ctx.trace.executed().count();
                    info!(completed_steps, queued = ctx.queue.len(), "Run paused");
                    self.emit(RunEvent::PauseObserved { completed_steps });

                    let exit = controller
                        .wait_for_resume(self.config.pause_reminder, |waited| {
                            warn!(
                                waited_secs = waited.as_secs(),
                                "Run is still paused; resume or cancel to continue"
                            );
                            self.emit(RunEvent::PauseReminder {
                                waited_secs: waited.as_secs(),
                            });
                        })
                        .await;

                    match exit {
                        PauseExit::Resumed => {
                            info!("Run resumed");
                            self.emit(RunEvent::Resumed);
                            self.transition(&mut state, LoopState::Execute);
                        }
                        PauseExit::Cancelled => return Ok(self.abandon(controller, ctx)),
                    }
                }

                LoopState::Done => return Ok(RunStatus::Completed),
            }
        }
    }

    /// Records every call a cancel left unexecuted, then ends the run.
    fn abandon(&self, controller: &PauseController, ctx: &mut AgentContext) -> RunStatus {
        let pending = controller
            .take_override()
            .map(|call| (call, StepSource::Human));
        let queued = ctx.queue.drain(..).map(|call| (call, StepSource::Model));
        for (call, source) in pending.into_iter().chain(queued) {
            let marker = ctx
                .trace
                .record(&call, source, StepOutcome::Abandoned)
                .clone();
            info!(sequence = marker.sequence, %source, "Call abandoned on cancel: {}", call.name);
            self.emit(RunEvent::StepRecorded(marker));
        }
        RunStatus::Cancelled
    }

    /// Appends operator notes and the current page to the conversation.
    async fn refresh_context(&self, ctx: &mut AgentContext) -> Result<(), Error> {
        let page = self.driver.observe_state().await?;
        ctx.messages.push(ChatMessage::observation(&ctx.notes, &page));
        ctx.notes.clear();
        Ok(())
    }

    async fn execute_model_call(
        &self,
        catalog: &Catalog,
        ctx: &mut AgentContext,
        call: ToolCall,
    ) -> Result<(), Error> {
        let result = catalog.execute(&call).await?;
        let step = ctx
            .trace
            .record(&call, StepSource::Model, outcome_of(&result))
            .clone();
        debug!(
            sequence = step.sequence,
            target = %step.target_key,
            is_error = result.is_error,
            "Model step recorded: {}",
            call.name
        );
        ctx.messages.push(ChatMessage::for_step(&step));
        self.emit(RunEvent::StepRecorded(step));
        Ok(())
    }

    async fn execute_override(
        &self,
        catalog: &Catalog,
        ctx: &mut AgentContext,
        call: ToolCall,
    ) -> Result<(), Error> {
        let target = call.target_key();
        self.emit(RunEvent::OverrideAccepted {
            tool_name: call.name.clone(),
            target_key: target.clone(),
        });

        let result = catalog.execute(&call).await?;
        let human = ctx
            .trace
            .record(&call, StepSource::Human, outcome_of(&result))
            .clone();
        info!(
            sequence = human.sequence,
            target = %target,
            is_error = result.is_error,
            "Human step recorded: {}",
            call.name
        );
        self.emit(RunEvent::StepRecorded(human.clone()));

        let (matching, remaining): (VecDeque<ToolCall>, VecDeque<ToolCall>) = ctx
            .queue
            .drain(..)
            .partition(|queued| queued.target_key() == target);
        ctx.queue = remaining;

        for dropped in matching {
            let marker = ctx
                .trace
                .record(
                    &dropped,
                    StepSource::Model,
                    StepOutcome::Suppressed {
                        by_sequence: human.sequence,
                    },
                )
                .clone();
            info!(
                sequence = marker.sequence,
                target = %target,
                "Queued model call suppressed: {}",
                dropped.name
            );
            ctx.messages.push(ChatMessage::for_step(&marker));
            self.emit(RunEvent::StepRecorded(marker));
        }

        ctx.notes.push(human_step_note(&human));
        Ok(())
    }
}

fn outcome_of(result: &ToolResult) -> StepOutcome {
    let output = sanitize_tool_output_for_llm(&result.output);
    if result.is_error {
        StepOutcome::Failed { error: output }
    } else {
        StepOutcome::Succeeded { output }
    }
}

/// Strips large base64 image payloads from tool output before it is recorded
/// or sent to the LLM.
fn sanitize_tool_output_for_llm(output: &str) -> String {
    if let Ok(mut val) = serde_json::from_str::<Value>(output)
        && let Some(obj) = val.as_object_mut()
        && obj.contains_key("data_b64")
        && obj
            .get("mime")
            .and_then(|m| m.as_str())
            .is_some_and(|m| m.starts_with("image/"))
    {
        obj.remove("data_b64");
        obj.insert(
            "note".to_string(),
            Value::String(
                "Image data captured successfully. Base64 data omitted from context.".to_string(),
            ),
        );
        if let Ok(s) = serde_json::to_string(&val) {
            return s;
        }
    }
    output.to_string()
}
