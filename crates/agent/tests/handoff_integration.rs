use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent::{
    AgentConfig, AgentLoop, ChatRequest, ChatResponse, ExecutionTrace, LlmProvider,
    PauseController, RegisterMode, RunStatus, Script, ScriptSynthesizer, TokenUsage, ToolRegistry,
};
use async_trait::async_trait;
use chrono::Utc;
use proto::{
    BrowserError, ControlError, Error, LlmError, RunEvent, RunId, Step, StepOutcome, StepSource,
    ToolCall, ToolError,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, mpsc};
use tools::{ActionSpec, BrowserDriver, PageState, SecretResolver, discover_primitives, standard_actions};

/// Pops queued responses. With `hold_first` the first call blocks until
/// `release` gets a permit, after signalling `started`.
struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    calls: AtomicUsize,
    hold_first: bool,
    started: Notify,
    release: Semaphore,
}

impl ScriptedLlm {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Self::build(responses, false)
    }

    fn holding_first(responses: Vec<ChatResponse>) -> Arc<Self> {
        Self::build(responses, true)
    }

    fn build(responses: Vec<ChatResponse>, hold_first: bool) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(responses)),
            calls: AtomicUsize::new(0),
            hold_first,
            started: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
        if self.hold_first && first {
            self.started.notify_one();
            self.release
                .acquire()
                .await
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?
                .forget();
        }
        self.responses
            .lock()
            .expect("lock responses")
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("no scripted response left".to_string()))
    }
}

/// Records every action. With `hold_first` the first action blocks until
/// `release` gets a permit, after signalling `started`.
struct FakeDriver {
    performed: Mutex<Vec<(String, Value)>>,
    hold_first: bool,
    started: Notify,
    release: Semaphore,
}

impl FakeDriver {
    fn new(hold_first: bool) -> Arc<Self> {
        Arc::new(Self {
            performed: Mutex::new(Vec::new()),
            hold_first,
            started: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    fn holding_first() -> Arc<Self> {
        Self::new(true)
    }

    fn performed(&self) -> Vec<(String, Value)> {
        self.performed.lock().expect("lock performed").clone()
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    fn capabilities(&self) -> Vec<ActionSpec> {
        standard_actions()
    }

    async fn perform_action(&self, name: &str, args: &Value) -> Result<Value, BrowserError> {
        let first = {
            let mut performed = self.performed.lock().expect("lock performed");
            performed.push((name.to_string(), args.clone()));
            performed.len() == 1
        };
        if self.hold_first && first {
            self.started.notify_one();
            self.release
                .acquire()
                .await
                .map_err(|e| BrowserError::Action(e.to_string()))?
                .forget();
        }
        if args["selector"] == "#missing" {
            return Err(BrowserError::Action(
                "Failed to find element '#missing'".to_string(),
            ));
        }
        Ok(json!({"action": name}))
    }

    async fn observe_state(&self) -> Result<PageState, BrowserError> {
        Ok(PageState {
            url: "https://example.com/signup".to_string(),
            title: "Sign up".to_string(),
            elements: Vec::new(),
        })
    }
}

fn fill(id: &str, selector: &str, text: &str) -> ToolCall {
    ToolCall::with_id(id, "browser_fill", json!({"selector": selector, "text": text}))
}

fn calls(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse::ToolCalls(calls, TokenUsage::default())
}

fn text(s: &str) -> ChatResponse {
    ChatResponse::Text(s.to_string(), TokenUsage::default())
}

fn registry_for(driver: Arc<FakeDriver>, secrets: HashMap<String, String>) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    let secrets = Arc::new(SecretResolver::without_env(secrets));
    for tool in discover_primitives(driver, secrets) {
        registry
            .register(tool, RegisterMode::Reject)
            .expect("register primitive");
    }
    registry
}

fn signup_loop(driver: Arc<FakeDriver>, responses: Vec<ChatResponse>) -> AgentLoop {
    loop_with(driver, ScriptedLlm::new(responses))
}

fn loop_with(driver: Arc<FakeDriver>, llm: Arc<ScriptedLlm>) -> AgentLoop {
    let registry = registry_for(driver.clone(), HashMap::new());
    AgentLoop::new(llm, registry, driver, AgentConfig::default())
}

fn texts(steps: &[Step]) -> Vec<(String, String)> {
    steps
        .iter()
        .map(|s| {
            (
                s.target_key.clone(),
                s.arguments["text"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn human_override_suppresses_queued_model_call_and_wins_in_script() {
    let driver = FakeDriver::holding_first();
    let agent = signup_loop(
        driver.clone(),
        vec![
            calls(vec![
                fill("c1", "#name", "John"),
                fill("c2", "#email", "model@x.com"),
            ]),
            text("Form filled."),
        ],
    );
    let registry = agent.registry().clone();
    let controller = PauseController::new();
    let handle = controller.handle();

    let run = tokio::spawn(async move { agent.run("Fill the signup form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);
    assert_eq!(driver.performed().len(), 1, "no step starts while paused");

    handle
        .submit_override(ToolCall::new(
            "browser_fill",
            json!({"selector": "#email", "text": "human@x.com"}),
        ))
        .expect("override accepted");
    handle.resume().expect("resume");

    let report = run.await.expect("join").expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_message.as_deref(), Some("Form filled."));

    let steps = report.trace.steps();
    assert_eq!(steps.len(), 3);
    assert_eq!((steps[0].sequence, steps[0].source), (1, StepSource::Model));
    assert_eq!(steps[0].target_key, "#name");
    assert_eq!((steps[1].sequence, steps[1].source), (2, StepSource::Human));
    assert_eq!(steps[1].arguments["text"], "human@x.com");
    assert_eq!(steps[2].source, StepSource::Model);
    assert_eq!(steps[2].call_id, "c2");
    assert_eq!(steps[2].outcome, StepOutcome::Suppressed { by_sequence: 2 });

    let typed: Vec<Value> = driver
        .performed()
        .into_iter()
        .map(|(_, args)| args["text"].clone())
        .collect();
    assert_eq!(typed, vec![json!("John"), json!("human@x.com")]);

    let synthesizer = ScriptSynthesizer::new(registry.clone());
    let script = synthesizer
        .synthesize_and_register(&report)
        .expect("synthesize");
    assert!(!script.partial);
    assert_eq!(
        texts(&script.steps),
        vec![
            ("#name".to_string(), "John".to_string()),
            ("#email".to_string(), "human@x.com".to_string()),
        ]
    );
    assert_eq!(script.created_from.suppressed().count(), 1);

    let result = registry
        .execute(&ToolCall::with_id("replay-1", &script.name, json!({})))
        .await
        .expect("replay");
    assert!(!result.is_error, "{}", result.output);
    let performed = driver.performed();
    assert_eq!(performed.len(), 4);
    assert_eq!(performed[2].1["text"], "John");
    assert_eq!(performed[3].1["text"], "human@x.com");
}

#[tokio::test]
async fn pause_waits_for_the_running_step_and_cancel_leaves_partial_script() {
    let driver = FakeDriver::holding_first();
    let (tx, mut rx) = mpsc::channel(64);
    let agent = signup_loop(
        driver.clone(),
        vec![calls(vec![
            fill("c1", "#name", "John"),
            fill("c2", "#email", "model@x.com"),
        ])],
    )
    .with_events(tx);
    let registry = agent.registry().clone();
    let controller = PauseController::new();
    let handle = controller.handle();

    let run = tokio::spawn(async move { agent.run("Fill the signup form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    assert!(!handle.is_paused(), "the running step is not interrupted");
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);

    handle
        .submit_override(fill("h1", "#age", "40"))
        .expect("override accepted");
    handle.cancel();
    let report = run.await.expect("join").expect("run");
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(driver.performed().len(), 1);

    // Nothing requested is dropped without a record.
    let steps = report.trace.steps();
    assert_eq!(steps.len(), 3);
    assert_eq!(report.trace.executed().count(), 1);
    assert_eq!(
        (steps[1].call_id.as_str(), steps[1].source, &steps[1].outcome),
        ("h1", StepSource::Human, &StepOutcome::Abandoned)
    );
    assert_eq!(
        (steps[2].call_id.as_str(), steps[2].source, &steps[2].outcome),
        ("c2", StepSource::Model, &StepOutcome::Abandoned)
    );

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let recorded = events
        .iter()
        .position(|e| matches!(e, RunEvent::StepRecorded(s) if s.sequence == 1))
        .expect("step recorded");
    let paused = events
        .iter()
        .position(|e| *e == RunEvent::PauseObserved { completed_steps: 1 })
        .expect("pause observed");
    assert!(recorded < paused);
    assert!(events.iter().any(
        |e| matches!(e, RunEvent::StepRecorded(s) if s.outcome == StepOutcome::Abandoned)
    ));
    assert_eq!(events.last(), Some(&RunEvent::Cancelled { completed_steps: 1 }));

    let script = ScriptSynthesizer::new(registry)
        .synthesize(&report)
        .expect("partial script");
    assert!(script.partial);
    assert_eq!(texts(&script.steps), vec![("#name".to_string(), "John".to_string())]);
}

#[tokio::test]
async fn only_one_override_may_be_pending() {
    let driver = FakeDriver::holding_first();
    let agent = signup_loop(
        driver.clone(),
        vec![
            calls(vec![fill("c1", "#name", "John"), fill("c2", "#age", "40")]),
            text("done"),
        ],
    );
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Fill the form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);

    handle
        .submit_override(fill("h1", "#email", "a@x.com"))
        .expect("first override");
    let err = handle
        .submit_override(fill("h2", "#email", "b@x.com"))
        .expect_err("second override");
    assert!(matches!(
        err,
        Error::Control(ControlError::OverrideAlreadyPending(ref name)) if name == "browser_fill"
    ));

    let err = handle
        .submit_override(ToolCall::new("browser_fill", json!({"selector": "#email"})))
        .expect_err("invalid arguments");
    assert!(matches!(err, Error::Control(ControlError::OverrideAlreadyPending(_))));

    handle.resume().expect("resume");
    let report = run.await.expect("join").expect("run");
    let humans: Vec<&Step> = report
        .trace
        .steps()
        .iter()
        .filter(|s| s.source == StepSource::Human)
        .collect();
    assert_eq!(humans.len(), 1);
    assert_eq!(humans[0].arguments["text"], "a@x.com");
    assert_eq!(report.trace.suppressed().count(), 0);
    assert_eq!(report.trace.len(), 3);
}

#[tokio::test]
async fn override_arguments_are_checked_against_the_run_catalog() {
    let driver = FakeDriver::holding_first();
    let agent = signup_loop(
        driver.clone(),
        vec![calls(vec![fill("c1", "#name", "John")]), text("done")],
    );
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Fill the form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);

    let err = handle
        .submit_override(ToolCall::new("browser_fill", json!({"selector": "#email"})))
        .expect_err("missing text");
    assert!(matches!(err, Error::Tool(ToolError::InvalidArguments { .. })));
    let err = handle
        .submit_override(ToolCall::new("browser_teleport", json!({})))
        .expect_err("unknown tool");
    assert!(matches!(err, Error::Tool(ToolError::NotFound(_))));
    assert_eq!(handle.status().pending_override, None);

    handle.resume().expect("resume");
    let report = run.await.expect("join").expect("run");
    assert!(report.trace.steps().iter().all(|s| s.source == StepSource::Model));
}

#[tokio::test]
async fn pause_during_the_final_decision_keeps_the_model_done() {
    let driver = FakeDriver::new(false);
    let llm = ScriptedLlm::holding_first(vec![text("Nothing left to do.")]);
    let agent = loop_with(driver.clone(), llm.clone());
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Idle", &controller).await });

    llm.started.notified().await;
    handle.request_pause();
    llm.release.add_permits(1);
    assert!(handle.wait_until_paused().await);

    handle.resume().expect("resume");
    let report = run.await.expect("join").expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_message.as_deref(), Some("Nothing left to do."));
    assert_eq!(llm.calls(), 1, "the model is not asked again");
    assert!(report.trace.is_empty());
}

#[tokio::test]
async fn pause_during_the_last_queued_step_halts_before_the_model_is_asked() {
    let driver = FakeDriver::holding_first();
    let llm = ScriptedLlm::new(vec![calls(vec![fill("c1", "#name", "John")]), text("done")]);
    let agent = loop_with(driver.clone(), llm.clone());
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Fill the form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);
    assert_eq!(llm.calls(), 1, "no model call while paused");

    handle.resume().expect("resume");
    let report = run.await.expect("join").expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(llm.calls(), 2);
    assert_eq!(report.trace.len(), 1);
}

#[tokio::test]
async fn override_submitted_before_the_loop_halts_runs_first() {
    let driver = FakeDriver::holding_first();
    let agent = signup_loop(
        driver.clone(),
        vec![
            calls(vec![
                fill("c1", "#name", "John"),
                fill("c2", "#email", "model@x.com"),
            ]),
            text("done"),
        ],
    );
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Fill the signup form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    handle
        .submit_override(fill("h1", "#email", "human@x.com"))
        .expect("accepted while the step is still running");
    assert!(!handle.is_paused());
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);
    assert_eq!(driver.performed().len(), 1);

    handle.resume().expect("resume");
    let report = run.await.expect("join").expect("run");
    let steps = report.trace.steps();
    assert_eq!(steps.len(), 3);
    assert_eq!((steps[1].call_id.as_str(), steps[1].source), ("h1", StepSource::Human));
    assert_eq!(steps[2].outcome, StepOutcome::Suppressed { by_sequence: 2 });
    assert_eq!(driver.performed()[1].1["text"], "human@x.com");
}

#[tokio::test]
async fn failed_override_is_recorded_and_still_suppresses_the_queued_call() {
    let driver = FakeDriver::holding_first();
    let agent = signup_loop(
        driver.clone(),
        vec![
            calls(vec![
                fill("c1", "#name", "John"),
                fill("c2", "#missing", "model"),
            ]),
            text("done"),
        ],
    );
    let registry = agent.registry().clone();
    let controller = PauseController::new();
    let handle = controller.handle();
    let run = tokio::spawn(async move { agent.run("Fill the form", &controller).await });

    driver.started.notified().await;
    handle.request_pause();
    driver.release.add_permits(1);
    assert!(handle.wait_until_paused().await);
    handle
        .submit_override(fill("h1", "#missing", "human"))
        .expect("override accepted");
    handle.resume().expect("resume");

    let report = run.await.expect("join").expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    let steps = report.trace.steps();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[1].source, StepSource::Human);
    assert!(matches!(
        steps[1].outcome,
        StepOutcome::Failed { ref error } if error.contains("#missing")
    ));
    assert_eq!(steps[2].call_id, "c2");
    assert_eq!(steps[2].outcome, StepOutcome::Suppressed { by_sequence: 2 });
    assert_eq!(driver.performed().len(), 2, "the model call never runs");

    let script = ScriptSynthesizer::new(registry)
        .synthesize(&report)
        .expect("script");
    assert_eq!(texts(&script.steps), vec![("#name".to_string(), "John".to_string())]);
}

#[tokio::test]
async fn override_without_pause_is_rejected_and_nothing_is_recorded() {
    let driver = FakeDriver::new(false);
    let agent = signup_loop(driver.clone(), vec![text("nothing to do")]);
    let controller = PauseController::new();
    let handle = controller.handle();

    let err = handle
        .submit_override(fill("h1", "#email", "human@x.com"))
        .expect_err("no pause");
    assert!(matches!(err, Error::Control(ControlError::NoPendingPause)));
    assert!(matches!(handle.resume(), Err(ControlError::NoPendingPause)));

    let report = agent.run("Idle", &controller).await.expect("run");
    assert!(report.trace.is_empty());
    assert!(driver.performed().is_empty());

    let err = handle
        .submit_override(fill("h2", "#email", "human@x.com"))
        .expect_err("run finished");
    assert!(matches!(err, Error::Control(ControlError::NoPendingPause)));
}

#[tokio::test]
async fn secrets_resolve_at_execution_but_trace_keeps_placeholders() {
    let driver = FakeDriver::new(false);
    let registry = registry_for(
        driver.clone(),
        HashMap::from([("PASSWORD".to_string(), "hunter2".to_string())]),
    );
    let agent = AgentLoop::new(
        ScriptedLlm::new(vec![
            calls(vec![fill("c1", "#password", "${PASSWORD}")]),
            text("Logged in."),
        ]),
        registry,
        driver.clone(),
        AgentConfig::default(),
    );

    let report = agent
        .run("Log in", &PauseController::new())
        .await
        .expect("run");
    assert_eq!(driver.performed()[0].1["text"], "hunter2");
    assert_eq!(report.trace.steps()[0].arguments["text"], "${PASSWORD}");
}

fn script_of(name: &str, calls: &[ToolCall]) -> Script {
    let mut trace = ExecutionTrace::new();
    for call in calls {
        trace.record(
            call,
            StepSource::Model,
            StepOutcome::Succeeded {
                output: "{}".to_string(),
            },
        );
    }
    Script {
        name: name.to_string(),
        task: "click through".to_string(),
        steps: trace.steps().to_vec(),
        run_id: RunId::from("run-test"),
        partial: false,
        created_at: Utc::now(),
        created_from: trace,
    }
}

fn click(id: &str, selector: &str) -> ToolCall {
    ToolCall::with_id(id, "browser_click", json!({"selector": selector}))
}

#[tokio::test]
async fn replay_stops_at_the_first_failing_step() {
    let driver = FakeDriver::new(false);
    let registry = registry_for(driver.clone(), HashMap::new());
    let synthesizer = ScriptSynthesizer::new(registry.clone());
    let script = synthesizer
        .register(script_of(
            "script_20250614_151357_click_through",
            &[click("a", "#a"), click("b", "#missing"), click("c", "#c")],
        ))
        .expect("register");

    let result = registry
        .execute(&ToolCall::with_id("r1", &script.name, json!({})))
        .await
        .expect("execute");
    assert!(result.is_error);
    assert!(result.output.contains("step 2"), "{}", result.output);

    let selectors: Vec<Value> = driver
        .performed()
        .into_iter()
        .map(|(_, args)| args["selector"].clone())
        .collect();
    assert_eq!(selectors, vec![json!("#a"), json!("#missing")]);
}

#[tokio::test]
async fn replaying_twice_issues_the_same_calls() {
    let driver = FakeDriver::new(false);
    let registry = registry_for(driver.clone(), HashMap::new());
    let synthesizer = ScriptSynthesizer::new(registry.clone());
    let script = synthesizer
        .register(script_of(
            "script_20250614_151357_click_through",
            &[click("a", "#a"), fill("b", "#q", "rust")],
        ))
        .expect("register");

    for id in ["r1", "r2"] {
        let result = registry
            .execute(&ToolCall::with_id(id, &script.name, json!({})))
            .await
            .expect("execute");
        assert!(!result.is_error, "{}", result.output);
    }

    let performed = driver.performed();
    assert_eq!(performed.len(), 4);
    assert_eq!(performed[..2], performed[2..]);
}

#[test]
fn taken_script_names_get_a_numeric_suffix() {
    let driver = FakeDriver::new(false);
    let registry = registry_for(driver, HashMap::new());
    let synthesizer = ScriptSynthesizer::new(registry.clone());
    let base = "script_20250614_151357_click_through";

    let first = synthesizer
        .register(script_of(base, &[click("a", "#a")]))
        .expect("first");
    let second = synthesizer
        .register(script_of(base, &[click("a", "#b")]))
        .expect("second");
    assert_eq!(first.name, base);
    assert_eq!(second.name, format!("{base}_2"));

    let before = registry.definitions();
    let err = registry
        .register(
            agent::ScriptTool::new(first.clone(), Arc::downgrade(&registry)),
            RegisterMode::Reject,
        )
        .expect_err("duplicate");
    assert!(matches!(err, ToolError::DuplicateName(ref n) if n == base));
    assert_eq!(registry.definitions(), before);
}
