//! CLI entrypoint and subcommand orchestration.

mod config;
mod console;
#[cfg(test)]
mod test_support;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use agent::{
    AgentLoop, AnthropicProvider, LlmProvider, OpenAiProvider, PauseController, RegisterMode,
    RunReport, RunStatus, Script, ScriptStore, ScriptSynthesizer, ToolRegistry,
};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, ProviderPreset};
use proto::{RunEvent, ScriptError, Step, StepOutcome, ToolCall, ToolOrigin};
use tools::{BrowserDriver, ChromiumDriver, SecretResolver, discover_primitives};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for handoff.
#[derive(Parser)]
#[command(name = "handoff")]
#[command(
    about = "Browser agent with human takeover and replayable scripts",
    version = "0.1.0"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Enable debug logging to ~/.handoff/logs
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task with the operator console on stdin
    Run {
        /// Task instruction for the agent
        #[arg(short = 'e', long)]
        exec: String,

        /// Do not turn the finished run into a script
        #[arg(long, default_value_t = false)]
        no_synthesize: bool,

        /// Do not keep a script from a cancelled run
        #[arg(long, default_value_t = false)]
        discard_partial: bool,

        /// Run Chromium without a window
        #[arg(long, default_value_t = false)]
        headless: bool,
    },

    /// Replay a stored script in a fresh browser
    Replay {
        /// Script name (script_...)
        name: String,

        /// Run Chromium without a window
        #[arg(long, default_value_t = false)]
        headless: bool,
    },

    /// Manage stored scripts
    Scripts {
        #[command(subcommand)]
        command: ScriptCommands,
    },

    /// List the tool catalog: browser primitives and stored scripts
    Tools,
}

/// `scripts` sub-subcommands.
#[derive(Subcommand)]
enum ScriptCommands {
    /// List stored scripts, newest first
    List,
    /// Show the steps of a script
    Show { name: String },
    /// Write a script as JSON or as a Playwright program to a file (or stdout)
    Export {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },
    /// Store a script from a JSON file
    Import {
        file: PathBuf,
        /// Replace a stored script with the same name
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Delete a stored script
    Delete { name: String },
}

/// Output format of `scripts export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    /// The stored script, re-importable with `scripts import`
    Json,
    /// A standalone Python program using Playwright's async API
    Playwright,
}

#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&cli.log_level, cli.debug);

    if cli.debug {
        let cmd_label = match &cli.command {
            Commands::Run { .. } => "run",
            Commands::Replay { .. } => "replay",
            Commands::Scripts { .. } => "scripts",
            Commands::Tools => "tools",
        };
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cmd_label,
            log_level = %cli.log_level,
            "========== handoff session start =========="
        );
    }

    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });

    match cli.command {
        Commands::Run {
            exec,
            no_synthesize,
            discard_partial,
            headless,
        } => {
            let synthesis = Synthesis {
                enabled: !no_synthesize,
                keep_partial: !discard_partial,
            };
            cmd_run(config, exec, synthesis, headless).await
        }
        Commands::Replay { name, headless } => cmd_replay(config, name, headless).await,
        Commands::Scripts { command } => cmd_scripts(config, command).await,
        Commands::Tools => cmd_tools(config).await,
    }
}

/// Console logging, plus a daily-rotated debug file under ~/.handoff/logs with `--debug`.
fn init_tracing(
    log_level: &str,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if !debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = PathBuf::from(home).join(".handoff").join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_target(false).with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new(
            "debug,hyper_util=info,rustls=info,reqwest=info,sqlx=info,chromiumoxide=info,tungstenite=info",
        ));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

/// Builds an LLM provider for the given preset, API key, and optional base URL.
fn build_provider(
    preset: ProviderPreset,
    api_key: &str,
    base_url: Option<&str>,
) -> Arc<dyn LlmProvider> {
    match (preset, base_url) {
        (ProviderPreset::Anthropic, Some(base_url)) => {
            Arc::new(AnthropicProvider::with_base_url(api_key, base_url))
        }
        (ProviderPreset::Anthropic, None) => Arc::new(AnthropicProvider::new(api_key)),
        (_, Some(base_url)) => Arc::new(OpenAiProvider::with_base_url(api_key, base_url)),
        (_, None) => Arc::new(OpenAiProvider::new(api_key)),
    }
}

fn build_driver(config: &Config, headless: bool) -> Arc<ChromiumDriver> {
    Arc::new(
        ChromiumDriver::new(headless || config.browser.headless)
            .with_default_timeout(config.browser.action_timeout_secs),
    )
}

async fn open_store(config: &Config) -> anyhow::Result<ScriptStore> {
    ScriptStore::open(&config.scripts.database)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))
}

/// Registers the driver's primitives and every stored script.
async fn build_registry(
    config: &Config,
    driver: Arc<ChromiumDriver>,
    store: &ScriptStore,
) -> anyhow::Result<Arc<ToolRegistry>> {
    let registry = Arc::new(ToolRegistry::new());
    let secrets = Arc::new(SecretResolver::new(config.secrets.clone()));
    let driver: Arc<dyn BrowserDriver> = driver;
    for tool in discover_primitives(driver, secrets) {
        registry.register(tool, RegisterMode::Reject)?;
    }
    store.load_into(&registry).await?;
    Ok(registry)
}

/// What to do with a finished run's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Synthesis {
    enabled: bool,
    keep_partial: bool,
}

impl Synthesis {
    fn applies_to(&self, status: RunStatus) -> bool {
        self.enabled && (status == RunStatus::Completed || self.keep_partial)
    }
}

/// Runs one task while the operator console drives pause/override/resume.
async fn cmd_run(
    config: Config,
    exec: String,
    synthesis: Synthesis,
    headless: bool,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let driver = build_driver(&config, headless);
    let registry = build_registry(&config, driver.clone(), &store).await?;

    let api_key = config.resolve_api_key();
    if api_key.is_empty() && config.agent.provider != ProviderPreset::Ollama {
        warn!("No API key configured. Set HANDOFF_API_KEY or the provider's key variable.");
    }
    let llm = build_provider(
        config.agent.provider,
        &api_key,
        config.agent.effective_base_url(),
    );

    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<RunEvent>(256);
    let agent_loop = AgentLoop::new(
        llm,
        registry.clone(),
        driver.clone(),
        config.loop_config(),
    )
    .with_events(event_tx);
    let controller = PauseController::new();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(line) = format_event(&event) {
                println!("{line}");
            }
        }
    });
    let console = tokio::spawn(console::run_console(controller.handle()));

    println!("{}", format_run_header(&exec));
    println!("{}", console::HELP);

    let outcome = agent_loop.run(&exec, &controller).await;
    drop(agent_loop);
    console.abort();
    let _ = printer.await;

    let result = match outcome {
        Ok(report) => finish_run(&report, &registry, &store, synthesis).await,
        Err(failure) => {
            eprintln!("Error: {failure}");
            eprintln!("{} step(s) were recorded before the failure.", failure.trace.len());
            driver.close().await;
            std::process::exit(1);
        }
    };
    driver.close().await;
    result
}

async fn finish_run(
    report: &RunReport,
    registry: &Arc<ToolRegistry>,
    store: &ScriptStore,
    synthesis: Synthesis,
) -> anyhow::Result<()> {
    match report.status {
        RunStatus::Completed => {
            if let Some(message) = &report.final_message {
                println!("{message}");
            }
        }
        RunStatus::Cancelled => println!("Run cancelled after {} step(s).", report.trace.len()),
    }
    info!(
        prompt_tokens = report.usage.prompt_tokens,
        completion_tokens = report.usage.completion_tokens,
        "Token usage"
    );
    if report.usage.total() > 0 {
        println!("Model usage: {}", report.usage);
    }

    if !synthesis.applies_to(report.status) {
        return Ok(());
    }
    let synthesizer = ScriptSynthesizer::new(registry.clone());
    match synthesizer.synthesize_and_register(report) {
        Ok(script) => {
            store.save(&script).await?;
            let partial = if script.partial { ", partial" } else { "" };
            println!(
                "Saved script {} ({} step(s){partial})",
                script.name,
                script.steps.len()
            );
        }
        Err(proto::Error::Script(ScriptError::Empty(_))) => {
            println!("Nothing to save: the run has no successful steps.");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_replay(config: Config, name: String, headless: bool) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let script = store
        .load(&name)
        .await
        .with_context(|| format!("cannot replay '{name}'"))?;
    let driver = build_driver(&config, headless);
    let registry = build_registry(&config, driver.clone(), &store).await?;

    println!("Replaying {} ({} step(s))", script.name, script.steps.len());
    let result = registry
        .execute(&ToolCall::new(&script.name, serde_json::json!({})))
        .await;
    driver.close().await;

    let result = result?;
    if result.is_error {
        bail!("{}", result.output);
    }
    println!("Replay finished.");
    Ok(())
}

async fn cmd_scripts(config: Config, command: ScriptCommands) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    match command {
        ScriptCommands::List => {
            let scripts = store.list().await?;
            if scripts.is_empty() {
                println!("No stored scripts.");
            }
            for s in scripts {
                let partial = if s.partial { " (partial)" } else { "" };
                println!(
                    "{}  {} step(s){partial}  {}  {}",
                    s.name,
                    s.steps,
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.task
                );
            }
        }
        ScriptCommands::Show { name } => {
            let script = store.load(&name).await?;
            print!("{}", format_script(&script));
        }
        ScriptCommands::Export {
            name,
            output,
            format,
        } => {
            let script = store.load(&name).await?;
            let rendered = match format {
                ExportFormat::Json => script.to_json()?,
                ExportFormat::Playwright => {
                    let nested = load_nested_scripts(&store, &script).await?;
                    script.to_playwright(&nested)?
                }
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported {name} to {}", path.display());
                }
                None => println!("{rendered}"),
            }
        }
        ScriptCommands::Import { file, force } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let script = Script::from_json(&raw)?;
            if !force && store.load(&script.name).await.is_ok() {
                bail!(
                    "a script named {} is already stored; use --force to replace it",
                    script.name
                );
            }
            store.save(&script).await?;
            println!("Imported {}", script.name);
        }
        ScriptCommands::Delete { name } => {
            if !store.delete(&name).await? {
                bail!("no stored script named {name}");
            }
            println!("Deleted {name}");
        }
    }
    Ok(())
}

/// Loads every script `script` replays, directly or through other scripts.
async fn load_nested_scripts(
    store: &ScriptStore,
    script: &Script,
) -> anyhow::Result<HashMap<String, Script>> {
    let mut loaded = HashMap::new();
    let mut pending = script.nested_scripts();
    while let Some(name) = pending.pop() {
        if name == script.name || loaded.contains_key(&name) {
            continue;
        }
        let nested = store
            .load(&name)
            .await
            .with_context(|| format!("loading nested script {name}"))?;
        pending.extend(nested.nested_scripts());
        loaded.insert(name, nested);
    }
    Ok(loaded)
}

async fn cmd_tools(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let driver = build_driver(&config, true);
    let registry = build_registry(&config, driver, &store).await?;
    let catalog = registry.snapshot();
    for def in catalog.definitions() {
        let origin = catalog.origin(&def.name).unwrap_or(ToolOrigin::Primitive);
        println!("{:<44} [{origin}] {}", def.name, def.description);
    }
    Ok(())
}

/// Formats run mode header text.
fn format_run_header(exec: &str) -> String {
    format!("Running: {exec}")
}

fn format_step(step: &Step) -> String {
    let status = match &step.outcome {
        StepOutcome::Succeeded { .. } => "ok".to_string(),
        StepOutcome::Failed { error } => format!("failed: {error}"),
        StepOutcome::Suppressed { by_sequence } => {
            format!("suppressed by step {by_sequence}")
        }
        StepOutcome::Abandoned => "abandoned (run cancelled)".to_string(),
    };
    format!(
        "[{}] {} {} {} -> {status}",
        step.sequence, step.source, step.tool_name, step.target_key
    )
}

/// One console line per event worth showing; state noise is dropped.
fn format_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::StepRecorded(step) => Some(format_step(step)),
        RunEvent::PauseObserved { completed_steps } => Some(format!(
            "Paused after {completed_steps} step(s). Use 'override <tool> <json>' or 'resume'."
        )),
        RunEvent::PauseReminder { waited_secs } => Some(format!(
            "Still paused ({waited_secs}s). Type 'resume' or 'cancel'."
        )),
        RunEvent::OverrideAccepted {
            tool_name,
            target_key,
        } => Some(format!("Running human step: {tool_name} on {target_key}")),
        RunEvent::Resumed => Some("Resumed.".to_string()),
        RunEvent::StateChanged { .. }
        | RunEvent::Deciding { .. }
        | RunEvent::CallsQueued { .. }
        | RunEvent::Cancelled { .. }
        | RunEvent::Finished { .. } => None,
    }
}

fn format_script(script: &Script) -> String {
    let mut out = format!("{}\n  task: {}\n", script.name, script.task);
    out.push_str(&format!(
        "  run: {}  created: {}{}\n",
        script.run_id,
        script.created_at.format("%Y-%m-%d %H:%M:%S"),
        if script.partial { "  (partial)" } else { "" }
    ));
    let suppressed = script.created_from.suppressed().count();
    if suppressed > 0 {
        out.push_str(&format!(
            "  {suppressed} model call(s) were overridden by a human step\n"
        ));
    }
    for step in &script.steps {
        out.push_str(&format!(
            "  {:>3}. {} {} {}\n",
            step.sequence, step.source, step.tool_name, step.arguments
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use agent::ExecutionTrace;
    use chrono::Utc;
    use proto::{RunId, StepSource};
    use serde_json::json;

    use super::*;

    fn fill(selector: &str, text: &str) -> ToolCall {
        ToolCall::new("browser_fill", json!({"selector": selector, "text": text}))
    }

    #[test]
    fn format_run_header_embeds_exec_text() {
        assert_eq!(format_run_header("Log in"), "Running: Log in");
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "handoff",
            "run",
            "-e",
            "Fill the signup form",
            "--discard-partial",
            "--headless",
        ])
        .expect("parse");
        let Commands::Run {
            exec,
            no_synthesize,
            discard_partial,
            headless,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(exec, "Fill the signup form");
        assert!(!no_synthesize);
        assert!(discard_partial);
        assert!(headless);
    }

    #[test]
    fn cli_parses_script_subcommands() {
        let cli = Cli::try_parse_from(["handoff", "scripts", "export", "script_x", "-o", "out.json"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Scripts {
                command: ScriptCommands::Export { ref name, output: Some(_), format: ExportFormat::Json }
            } if name == "script_x"
        ));
        let cli = Cli::try_parse_from(["handoff", "scripts", "export", "script_x", "--format", "playwright"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Scripts {
                command: ScriptCommands::Export { output: None, format: ExportFormat::Playwright, .. }
            }
        ));
        assert!(Cli::try_parse_from(["handoff", "scripts", "export", "script_x", "--format", "yaml"]).is_err());
        assert!(Cli::try_parse_from(["handoff", "replay"]).is_err());
    }

    #[test]
    fn synthesis_policy_respects_flags() {
        let default = Synthesis {
            enabled: true,
            keep_partial: true,
        };
        assert!(default.applies_to(RunStatus::Completed));
        assert!(default.applies_to(RunStatus::Cancelled));

        let discard = Synthesis {
            keep_partial: false,
            ..default
        };
        assert!(discard.applies_to(RunStatus::Completed));
        assert!(!discard.applies_to(RunStatus::Cancelled));

        let off = Synthesis {
            enabled: false,
            ..default
        };
        assert!(!off.applies_to(RunStatus::Completed));
    }

    #[test]
    fn step_events_show_source_target_and_suppression() {
        let mut trace = ExecutionTrace::new();
        trace.record(
            &fill("#email", "human@x.com"),
            StepSource::Human,
            StepOutcome::Succeeded {
                output: "{}".to_string(),
            },
        );
        trace.record(
            &fill("#email", "model@x.com"),
            StepSource::Model,
            StepOutcome::Suppressed { by_sequence: 1 },
        );
        let steps = trace.steps();
        assert_eq!(
            format_event(&RunEvent::StepRecorded(steps[0].clone())).as_deref(),
            Some("[1] HUMAN browser_fill #email -> ok")
        );
        assert_eq!(
            format_event(&RunEvent::StepRecorded(steps[1].clone())).as_deref(),
            Some("[2] MODEL browser_fill #email -> suppressed by step 1")
        );
        assert!(format_event(&RunEvent::Deciding { round: 1 }).is_none());
        assert!(
            format_event(&RunEvent::PauseObserved { completed_steps: 2 })
                .is_some_and(|l| l.starts_with("Paused after 2 step(s)"))
        );
    }

    #[test]
    fn format_script_lists_steps_and_overrides() {
        let mut trace = ExecutionTrace::new();
        trace.record(
            &fill("#name", "John"),
            StepSource::Model,
            StepOutcome::Succeeded {
                output: "{}".to_string(),
            },
        );
        trace.record(
            &fill("#email", "model@x.com"),
            StepSource::Model,
            StepOutcome::Suppressed { by_sequence: 3 },
        );
        let script = Script {
            name: "script_20250614_151357_signup".to_string(),
            task: "Sign up".to_string(),
            steps: agent::winning_steps(&trace),
            run_id: RunId::from("r1"),
            partial: true,
            created_at: Utc::now(),
            created_from: trace,
        };
        let text = format_script(&script);
        assert!(text.starts_with("script_20250614_151357_signup\n  task: Sign up\n"));
        assert!(text.contains("(partial)"));
        assert!(text.contains("1 model call(s) were overridden"));
        assert!(text.contains("1. MODEL browser_fill"));
        assert!(!text.contains("model@x.com"));
    }
}
