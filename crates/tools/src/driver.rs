//! Browser collaborator interface.
//!
//! A driver offers a fixed list of actions. Each action is described by an
//! [`ActionSpec`] whose `parameters` field is a JSON schema; the same schema is
//! exposed to the model once the action becomes a primitive tool.

use async_trait::async_trait;
use proto::BrowserError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One action a driver can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action name without the tool prefix (e.g. `fill`).
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema of the action's arguments.
    pub parameters: Value,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Interactive element visible on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    /// Selector that addresses the element.
    pub selector: String,
    /// Lower-case tag name.
    pub tag: String,
    /// Visible label, value or placeholder.
    #[serde(default)]
    pub text: String,
}

/// Snapshot of the page handed to the model before each decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub elements: Vec<InteractiveElement>,
}

impl PageState {
    /// Renders the state as plain text for the model context.
    pub fn summarize(&self) -> String {
        let mut out = format!("Current page: {} ({})\n", self.title, self.url);
        if self.elements.is_empty() {
            out.push_str("No interactive elements found.");
            return out;
        }
        out.push_str("Interactive elements:\n");
        for (idx, element) in self.elements.iter().enumerate() {
            out.push_str(&format!(
                "{}. <{}> {} -> {}\n",
                idx + 1,
                element.tag,
                element.text,
                element.selector
            ));
        }
        out
    }
}

/// Browser collaborator used by primitive tools and the agent loop.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Fixed list of actions this driver supports.
    fn capabilities(&self) -> Vec<ActionSpec>;

    /// Performs a single action and returns its JSON result.
    async fn perform_action(&self, name: &str, args: &Value) -> Result<Value, BrowserError>;

    /// Reads the current page state.
    async fn observe_state(&self) -> Result<PageState, BrowserError>;
}

const TIMEOUT_PROPERTY: &str = "Operation timeout in seconds (default: 15, max: 60)";

/// The action set every built-in driver exposes.
pub fn standard_actions() -> Vec<ActionSpec> {
    vec![
        ActionSpec::new(
            "navigate",
            "Navigate the browser page to a URL and return final URL and title",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The http(s) URL to navigate to"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["url"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "click",
            "Click an element on the current browser page",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the element"},
                    "wait_for_navigation": {"type": "boolean", "description": "Wait for navigation after click (default: false)"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "fill",
            "Replace the value of an input element with the given text. \
             Use ${NAME} placeholders for secrets.",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the input element"},
                    "text": {"type": "string", "description": "Text to enter"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector", "text"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "press_key",
            "Press a key (e.g. Enter, Tab) on an element",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the focused element"},
                    "key": {"type": "string", "description": "Key name"},
                    "wait_for_navigation": {"type": "boolean", "description": "Wait for navigation after the key press (default: false)"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector", "key"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "extract_text",
            "Return the visible text of an element",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the element"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "screenshot",
            "Capture a screenshot of the current browser page and return PNG bytes as base64",
            json!({
                "type": "object",
                "properties": {
                    "full_page": {"type": "boolean", "description": "Capture the full scrollable page (default: false)"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "hover",
            "Move the mouse over an element (reveals menus and tooltips)",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the element"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "dblclick",
            "Double-click an element on the current browser page",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the element"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "select_option",
            "Select options of a <select> element by value or visible label",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the <select> element"},
                    "values": {
                        "type": "array",
                        "items": {"type": "string"},
                        "minItems": 1,
                        "description": "Option values or labels to select"
                    },
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector", "values"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "check",
            "Ensure a checkbox or radio button is checked",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the checkbox or radio"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "uncheck",
            "Ensure a checkbox is unchecked",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "CSS selector (or XPath) of the checkbox"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "scroll",
            "Scroll an element into view, or scroll the page up or down by a number of pixels",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "description": "Element to scroll into view; omit to scroll the page"},
                    "direction": {"type": "string", "enum": ["up", "down"], "description": "Page scroll direction (default: down)"},
                    "pixels": {"type": "integer", "minimum": 1, "description": "Page scroll distance (default: 600)"},
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "additionalProperties": false
            }),
        ),
        ActionSpec::new(
            "go_back",
            "Navigate back in browser history",
            json!({
                "type": "object",
                "properties": {
                    "timeout_secs": {"type": "integer", "description": TIMEOUT_PROPERTY}
                },
                "additionalProperties": false
            }),
        ),
    ]
}
