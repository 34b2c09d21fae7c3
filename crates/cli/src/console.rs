//! Operator console: line commands on stdin that drive a run's control handle.
//!
//! ```text
//! pause                              halt before the next queued step
//! override <tool> <json arguments>   run a human step first (while paused)
//! resume                             continue the run
//! cancel                             stop at the next safe point
//! status                             show the control state
//! ```

use agent::{ControlHandle, ControlStatus, SCRIPT_PREFIX};
use proto::ToolCall;
use serde_json::Value;
use tokio::sync::mpsc;
use tools::PRIMITIVE_PREFIX;
use tracing::debug;

pub const HELP: &str = "Commands: pause | override <tool> <json-args> | resume | cancel | status | help";

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Pause,
    Override(ToolCall),
    Resume,
    Cancel,
    Status,
    Help,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command '{0}'; type 'help' for the list")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Arguments must be a JSON object: {0}")]
    InvalidArguments(String),
}

/// Parses one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "pause" | "p" => ConsoleCommand::Pause,
        "resume" | "r" => ConsoleCommand::Resume,
        "cancel" | "c" => ConsoleCommand::Cancel,
        "status" | "s" => ConsoleCommand::Status,
        "help" | "h" | "?" => ConsoleCommand::Help,
        "override" | "o" => ConsoleCommand::Override(parse_override(rest)?),
        other => return Err(ConsoleError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_override(rest: &str) -> Result<ToolCall, ConsoleError> {
    if rest.is_empty() {
        return Err(ConsoleError::MissingArgument("tool name"));
    }
    let (tool, raw_args) = match rest.split_once(char::is_whitespace) {
        Some((tool, args)) => (tool, args.trim()),
        None => (rest, "{}"),
    };
    let arguments: Value =
        serde_json::from_str(raw_args).map_err(|e| ConsoleError::InvalidArguments(e.to_string()))?;
    if !arguments.is_object() {
        return Err(ConsoleError::InvalidArguments(format!("got {raw_args}")));
    }

    // `fill` is shorthand for `browser_fill`.
    let name = if tool.starts_with(PRIMITIVE_PREFIX) || tool.starts_with(SCRIPT_PREFIX) {
        tool.to_string()
    } else {
        format!("{PRIMITIVE_PREFIX}{tool}")
    };
    Ok(ToolCall::new(name, arguments))
}

/// Applies a command to the handle and returns the line to show the operator.
pub fn apply(command: ConsoleCommand, handle: &ControlHandle) -> String {
    match command {
        ConsoleCommand::Pause => {
            handle.request_pause();
            "Pause requested; the run halts once the current step finishes.".to_string()
        }
        ConsoleCommand::Override(call) => {
            let name = call.name.clone();
            let target = call.target_key();
            match handle.submit_override(call) {
                Ok(()) => format!("Override queued: {name} on {target}. Type 'resume' to run it."),
                Err(e) => format!("Override rejected: {e}"),
            }
        }
        ConsoleCommand::Resume => match handle.resume() {
            Ok(()) => "Resuming.".to_string(),
            Err(e) => format!("Cannot resume: {e}"),
        },
        ConsoleCommand::Cancel => {
            handle.cancel();
            "Cancel requested; the run stops at the next safe point.".to_string()
        }
        ConsoleCommand::Status => format_status(&handle.status()),
        ConsoleCommand::Help => HELP.to_string(),
    }
}

pub fn format_status(status: &ControlStatus) -> String {
    let state = if status.finished {
        "finished"
    } else if status.cancelled {
        "cancelling"
    } else if status.paused {
        "paused"
    } else if status.pause_requested {
        "pausing"
    } else {
        "running"
    };
    match &status.pending_override {
        Some(tool) => format!("Run {state}; pending override: {tool}"),
        None => format!("Run {state}"),
    }
}

/// Reads commands from stdin until EOF. Meant to be spawned and aborted when
/// the run ends.
///
/// Lines are read on a detached OS thread: a blocking stdin read cannot be
/// cancelled and must not hold up runtime shutdown.
pub async fn run_console(handle: ControlHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Console input closed: {e}");
                    break;
                }
            }
        }
    });

    while let Some(line) = rx.recv().await {
        match parse_command(&line) {
            Ok(Some(command)) => println!("{}", apply(command, &handle)),
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }
}
