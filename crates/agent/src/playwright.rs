//! Playwright (Python, async API) export of a stored script.
//!
//! Rendering is deterministic: the same script always yields the same file.
//! Secret placeholders become `os.environ` lookups, so an exported file never
//! carries a resolved value. Steps that replay another script are inlined
//! from the `nested` map the caller loads up front.

use std::collections::HashMap;

use proto::{ScriptError, Step, StepSource};
use serde_json::Value;
use tools::{PRIMITIVE_PREFIX, Segment, placeholder_segments};

use crate::synth::{SCRIPT_PREFIX, Script};

const BODY_INDENT: &str = "            ";
const DEFAULT_SCROLL_PIXELS: u64 = 600;
const MAX_TIMEOUT_SECS: u64 = 60;

impl Script {
    /// Names of the scripts this script replays, in first-use order.
    pub fn nested_scripts(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for step in &self.steps {
            if step.tool_name.starts_with(SCRIPT_PREFIX) && !names.contains(&step.tool_name) {
                names.push(step.tool_name.clone());
            }
        }
        names
    }

    /// Renders the script as a runnable Playwright program.
    pub fn to_playwright(&self, nested: &HashMap<String, Script>) -> Result<String, ScriptError> {
        render_playwright(self, nested)
    }
}

/// Renders `script` as a Python file using Playwright's async API.
pub fn render_playwright(
    script: &Script,
    nested: &HashMap<String, Script>,
) -> Result<String, ScriptError> {
    let mut body = Body {
        nested,
        lines: Vec::new(),
        uses_env: false,
        stack: vec![script.name.clone()],
    };
    body.steps(&script.steps, "", None)?;

    let mut out = format!("# {}\n# Task: {}\n", script.name, one_line(&script.task));
    let partial = if script.partial { " (cancelled, partial)" } else { "" };
    out.push_str(&format!("# Recorded by run {}{partial}\n", script.run_id));
    out.push_str("import asyncio\n");
    if body.uses_env {
        out.push_str("import os\n");
    }
    out.push_str("\nfrom playwright.async_api import async_playwright\n\n\n");
    out.push_str("async def main() -> None:\n");
    out.push_str("    async with async_playwright() as p:\n");
    out.push_str("        browser = await p.chromium.launch(headless=False)\n");
    out.push_str("        page = await browser.new_page()\n");
    out.push_str("        try:\n");
    if body.lines.is_empty() {
        body.lines.push("pass".to_string());
    }
    for line in &body.lines {
        if !line.is_empty() {
            out.push_str(BODY_INDENT);
            out.push_str(line);
        }
        out.push('\n');
    }
    out.push_str("        finally:\n");
    out.push_str("            await browser.close()\n\n\n");
    out.push_str("if __name__ == \"__main__\":\n");
    out.push_str("    asyncio.run(main())\n");
    Ok(out)
}

struct Body<'a> {
    nested: &'a HashMap<String, Script>,
    lines: Vec<String>,
    uses_env: bool,
    /// Scripts being inlined, outermost first.
    stack: Vec<String>,
}

impl Body<'_> {
    /// `top` is the outermost step index, used in error reports.
    fn steps(&mut self, steps: &[Step], prefix: &str, top: Option<usize>) -> Result<(), ScriptError> {
        for (offset, step) in steps.iter().enumerate() {
            let label = format!("{prefix}{}", offset + 1);
            let index = top.unwrap_or(offset + 1);
            self.step(step, &label, index)
                .map_err(|reason| ScriptError::Export {
                    index,
                    tool: step.tool_name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    fn step(&mut self, step: &Step, label: &str, index: usize) -> Result<(), String> {
        let who = match step.source {
            StepSource::Model => "model",
            StepSource::Human => "operator",
        };
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines.push(format!("# {label}. {} ({who})", step.tool_name));

        if step.tool_name.starts_with(SCRIPT_PREFIX) {
            return self.inline(&step.tool_name, label, index);
        }
        let Some(action) = step.tool_name.strip_prefix(PRIMITIVE_PREFIX) else {
            return Err("not a browser action".to_string());
        };
        let args = &step.arguments;
        let timeout = timeout_kwarg(args);

        match action {
            "navigate" => {
                let url = self.string_arg(args, "url")?;
                self.call("page.goto", vec![url], timeout);
            }
            "click" | "press_key" => {
                let mut positional = vec![self.selector_arg(args)?];
                let method = if action == "click" {
                    "page.click"
                } else {
                    positional.push(self.string_arg(args, "key")?);
                    "page.press"
                };
                self.call(method, positional, timeout);
                if args.get("wait_for_navigation").and_then(Value::as_bool) == Some(true) {
                    self.lines.push("await page.wait_for_load_state()".to_string());
                }
            }
            "fill" => {
                let selector = self.selector_arg(args)?;
                let text = self.string_arg(args, "text")?;
                self.call("page.fill", vec![selector, text], timeout);
            }
            "extract_text" => {
                let selector = self.selector_arg(args)?;
                let mut kwargs = Vec::new();
                kwargs.extend(timeout);
                self.lines.push(format!(
                    "print(await page.inner_text({}))",
                    join_args(vec![selector], kwargs)
                ));
            }
            "screenshot" => {
                let full_page = args.get("full_page").and_then(Value::as_bool).unwrap_or(false);
                let path = py_literal(&format!("step_{}.png", label.replace('.', "_")));
                let mut kwargs = vec![
                    format!("path={path}"),
                    format!("full_page={}", if full_page { "True" } else { "False" }),
                ];
                kwargs.extend(timeout);
                self.lines
                    .push(format!("await page.screenshot({})", kwargs.join(", ")));
            }
            "hover" | "dblclick" | "check" | "uncheck" => {
                let selector = self.selector_arg(args)?;
                self.call(&format!("page.{action}"), vec![selector], timeout);
            }
            "select_option" => {
                let selector = self.selector_arg(args)?;
                let values = args
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| "missing array argument 'values'".to_string())?;
                let mut rendered = Vec::with_capacity(values.len());
                for value in values {
                    let text = value
                        .as_str()
                        .ok_or_else(|| "'values' must hold strings".to_string())?;
                    rendered.push(self.text_expr(text));
                }
                let list = format!("[{}]", rendered.join(", "));
                self.call("page.select_option", vec![selector, list], timeout);
            }
            "scroll" => {
                if args.get("selector").is_some() {
                    let selector = self.selector_arg(args)?;
                    self.call(
                        &format!("page.locator({selector}).scroll_into_view_if_needed"),
                        Vec::new(),
                        timeout,
                    );
                } else {
                    let pixels = args
                        .get("pixels")
                        .and_then(Value::as_u64)
                        .unwrap_or(DEFAULT_SCROLL_PIXELS)
                        .max(1);
                    let sign = match args.get("direction").and_then(Value::as_str).unwrap_or("down") {
                        "down" => "",
                        "up" => "-",
                        other => return Err(format!("unknown scroll direction '{other}'")),
                    };
                    self.lines
                        .push(format!("await page.mouse.wheel(0, {sign}{pixels})"));
                }
            }
            "go_back" => self.call("page.go_back", Vec::new(), timeout),
            other => return Err(format!("no Playwright equivalent for action '{other}'")),
        }
        Ok(())
    }

    fn inline(&mut self, name: &str, label: &str, index: usize) -> Result<(), String> {
        if self.stack.iter().any(|n| n == name) {
            return Err(format!("script {name} replays itself"));
        }
        let nested = self.nested;
        let script = nested
            .get(name)
            .ok_or_else(|| format!("nested script {name} was not loaded"))?;
        self.stack.push(name.to_string());
        let inlined = self.steps(&script.steps, &format!("{label}."), Some(index));
        self.stack.pop();
        inlined.map_err(|e| e.to_string())
    }

    fn call(&mut self, method: &str, positional: Vec<String>, timeout: Option<String>) {
        let kwargs: Vec<String> = timeout.into_iter().collect();
        self.lines
            .push(format!("await {method}({})", join_args(positional, kwargs)));
    }

    fn string_arg(&mut self, args: &Value, key: &str) -> Result<String, String> {
        let text = args
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("missing string argument '{key}'"))?;
        Ok(self.text_expr(text))
    }

    fn selector_arg(&mut self, args: &Value) -> Result<String, String> {
        let selector = args
            .get("selector")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing string argument 'selector'".to_string())?;
        Ok(self.text_expr(&playwright_selector(selector)))
    }

    /// Python expression for `text`, reading placeholders from the environment.
    fn text_expr(&mut self, text: &str) -> String {
        let mut parts = Vec::new();
        for segment in placeholder_segments(text) {
            match segment {
                Segment::Text(literal) => parts.push(py_literal(literal)),
                Segment::Placeholder(name) => {
                    self.uses_env = true;
                    parts.push(format!("os.environ[{}]", py_literal(name)));
                }
            }
        }
        if parts.is_empty() {
            return py_literal("");
        }
        parts.join(" + ")
    }
}

fn join_args(positional: Vec<String>, kwargs: Vec<String>) -> String {
    positional
        .into_iter()
        .chain(kwargs)
        .collect::<Vec<_>>()
        .join(", ")
}

fn timeout_kwarg(args: &Value) -> Option<String> {
    args.get("timeout_secs")
        .and_then(Value::as_u64)
        .map(|secs| format!("timeout={}", secs.clamp(1, MAX_TIMEOUT_SECS) * 1000))
}

/// Maps the driver's XPath forms onto Playwright's `xpath=` engine.
fn playwright_selector(selector: &str) -> String {
    let selector = selector.trim();
    if !selector.starts_with("xpath=") && (selector.starts_with('/') || selector.starts_with("html/")) {
        return format!("xpath={selector}");
    }
    selector.to_string()
}

fn py_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
