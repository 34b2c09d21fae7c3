//! Chromium (CDP) implementation of [`BrowserDriver`].

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use proto::BrowserError;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::driver::{ActionSpec, BrowserDriver, InteractiveElement, PageState, standard_actions};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const MAX_TIMEOUT_SECS: u64 = 60;
const MAX_OBSERVED_ELEMENTS: usize = 50;

/// Collects visible interactive elements with a selector that addresses them.
const OBSERVE_SCRIPT: &str = r#"
(() => {
  const limit = __LIMIT__;
  const query = 'a, button, input, select, textarea, [role="button"], [onclick]';
  const pathOf = (el) => {
    const parts = [];
    while (el && el.nodeType === 1 && el !== document.documentElement) {
      if (el.id) { parts.unshift('#' + CSS.escape(el.id)); break; }
      let idx = 1;
      let sib = el;
      while ((sib = sib.previousElementSibling)) {
        if (sib.tagName === el.tagName) idx++;
      }
      parts.unshift(el.tagName.toLowerCase() + ':nth-of-type(' + idx + ')');
      el = el.parentElement;
    }
    return parts.join(' > ');
  };
  const selectorOf = (el) => {
    const tag = el.tagName.toLowerCase();
    if (el.id) return '#' + CSS.escape(el.id);
    const name = el.getAttribute('name');
    if (name) {
      const candidate = tag + '[name="' + name.replace(/"/g, '\\"') + '"]';
      if (document.querySelectorAll(candidate).length === 1) return candidate;
    }
    return pathOf(el);
  };
  const labelOf = (el) => {
    const raw = el.innerText || el.value || el.getAttribute('placeholder')
      || el.getAttribute('aria-label') || el.getAttribute('title') || '';
    return raw.trim().replace(/\s+/g, ' ').slice(0, 80);
  };
  const out = [];
  for (const el of document.querySelectorAll(query)) {
    if (out.length >= limit) break;
    const rect = el.getBoundingClientRect();
    if (rect.width === 0 && rect.height === 0) continue;
    if (el.type === 'hidden') continue;
    out.push({ selector: selectorOf(el), tag: el.tagName.toLowerCase(), text: labelOf(el) });
  }
  return out;
})()
"#;

/// Element functions below return a JSON string; an `error` key marks failure.
const SELECT_OPTION_FN: &str = r#"
function() {
  if (this.tagName !== 'SELECT') return JSON.stringify({ error: 'Element is not a <select>' });
  const wanted = __VALUES__;
  const matched = [];
  for (const opt of this.options) {
    const hit = wanted.includes(opt.value) || wanted.includes(opt.label.trim());
    if (hit && (this.multiple || matched.length === 0)) {
      opt.selected = true;
      matched.push(opt.value);
    } else if (this.multiple) {
      opt.selected = false;
    }
  }
  if (matched.length === 0) return JSON.stringify({ error: 'No option matches ' + wanted.join(', ') });
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
  return JSON.stringify({ selected: matched });
}
"#;

const SET_CHECKED_FN: &str = r#"
function() {
  const wanted = __CHECKED__;
  if (this.type !== 'checkbox' && this.type !== 'radio') {
    return JSON.stringify({ error: 'Element is not a checkbox or radio button' });
  }
  if (!wanted && this.type === 'radio') {
    return JSON.stringify({ error: 'A radio button cannot be unchecked' });
  }
  if (this.checked !== wanted) this.click();
  if (this.checked !== wanted) return JSON.stringify({ error: 'Element did not change state' });
  return JSON.stringify({ checked: this.checked });
}
"#;

const DBLCLICK_FN: &str = r#"
function() {
  this.dispatchEvent(new MouseEvent('dblclick', { bubbles: true, cancelable: true, view: window, detail: 2 }));
  return JSON.stringify({});
}
"#;

const DEFAULT_SCROLL_PIXELS: u64 = 600;

struct BrowserState {
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
}

impl BrowserState {
    fn new() -> Self {
        Self {
            browser: None,
            page: None,
            handler_task: None,
        }
    }

    async fn ensure_ready(&mut self, headless: bool) -> Result<&Page, String> {
        if self.browser.is_none() {
            self.launch(headless).await?;
        }

        if self.page.is_none() {
            let browser = self
                .browser
                .as_mut()
                .ok_or_else(|| "Browser is not initialized".to_string())?;
            let page = browser
                .new_page("about:blank")
                .await
                .map_err(|e| format!("Failed to create page: {e}"))?;
            self.page = Some(page);
        }

        self.page
            .as_ref()
            .ok_or_else(|| "Browser page is not initialized".to_string())
    }

    async fn launch(&mut self, headless: bool) -> Result<(), String> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| format!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| format!("Failed to launch browser: {e}"))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!(headless, "Chromium launched");
        self.browser = Some(browser);
        self.handler_task = Some(handler_task);
        Ok(())
    }
}

impl Drop for BrowserState {
    fn drop(&mut self) {
        if let Some(handle) = self.handler_task.take() {
            handle.abort();
        }
    }
}

fn operation_timeout(timeout_secs: Option<u64>, default_secs: u64) -> Duration {
    Duration::from_secs(
        timeout_secs
            .unwrap_or(default_secs)
            .clamp(1, MAX_TIMEOUT_SECS),
    )
}

fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, BrowserError> {
    serde_json::from_value(args.clone())
        .map_err(|e| BrowserError::Action(format!("Invalid arguments: {e}")))
}

fn finish<T>(
    run: Result<Result<T, String>, tokio::time::error::Elapsed>,
    duration: Duration,
) -> Result<T, BrowserError> {
    match run {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(BrowserError::Action(err)),
        Err(_) => Err(BrowserError::Timeout(duration.as_secs())),
    }
}

async fn locate(page: &Page, selector: &str) -> Result<Element, String> {
    let selector = selector.trim();
    let found = if let Some(xpath) = selector.strip_prefix("xpath=") {
        page.find_xpath(xpath).await
    } else if selector.starts_with('/') || selector.starts_with("html/") {
        page.find_xpath(selector).await
    } else {
        page.find_element(selector).await
    };
    found.map_err(|e| format!("Failed to find element '{selector}': {e}"))
}

async fn current_url(page: &Page) -> Result<String, String> {
    Ok(page
        .url()
        .await
        .map_err(|e| format!("Failed to read page URL: {e}"))?
        .unwrap_or_default())
}

async fn run_element_fn(element: &Element, function: &str, selector: &str) -> Result<Value, String> {
    let returned = element
        .call_js_fn(function, false)
        .await
        .map_err(|e| format!("Script failed on '{selector}': {e}"))?;
    if let Some(details) = returned.exception_details {
        return Err(format!("Script threw on '{selector}': {}", details.text));
    }
    let raw = returned
        .result
        .value
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Script on '{selector}' returned no result"))?;
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("Script on '{selector}' returned bad JSON: {e}"))?;
    match value.get("error").and_then(Value::as_str) {
        Some(err) => Err(format!("{err}: '{selector}'")),
        None => Ok(value),
    }
}

fn scroll_delta(direction: Option<&str>, pixels: Option<u64>) -> Result<i64, String> {
    let pixels = i64::try_from(pixels.unwrap_or(DEFAULT_SCROLL_PIXELS).max(1))
        .map_err(|_| "Scroll distance is too large".to_string())?;
    match direction.unwrap_or("down") {
        "down" => Ok(pixels),
        "up" => Ok(-pixels),
        other => Err(format!("Unknown scroll direction '{other}'")),
    }
}

#[derive(Debug, Deserialize)]
struct NavigateArgs {
    url: String,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClickArgs {
    selector: String,
    timeout_secs: Option<u64>,
    wait_for_navigation: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FillArgs {
    selector: String,
    text: String,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PressKeyArgs {
    selector: String,
    key: String,
    timeout_secs: Option<u64>,
    wait_for_navigation: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SelectorArgs {
    selector: String,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SelectOptionArgs {
    selector: String,
    values: Vec<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ScrollArgs {
    selector: Option<String>,
    direction: Option<String>,
    pixels: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ScreenshotArgs {
    full_page: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GoBackArgs {
    timeout_secs: Option<u64>,
}

/// Drives one Chromium page over CDP. The browser launches on first use.
pub struct ChromiumDriver {
    state: Arc<Mutex<BrowserState>>,
    headless: bool,
    default_timeout_secs: u64,
}

impl ChromiumDriver {
    /// Creates a driver; nothing is launched until the first action.
    pub fn new(headless: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrowserState::new())),
            headless,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Overrides the timeout applied when a call does not pass `timeout_secs`.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs.clamp(1, MAX_TIMEOUT_SECS);
        self
    }

    /// Closes the browser if it was launched.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.page = None;
        if let Some(mut browser) = state.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Browser close failed: {e}");
            }
            let _ = browser.wait().await;
        }
        if let Some(handle) = state.handler_task.take() {
            handle.abort();
        }
    }

    async fn navigate(&self, args: NavigateArgs) -> Result<Value, BrowserError> {
        let url = match Url::parse(&args.url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
            Ok(_) => {
                return Err(BrowserError::Action(
                    "Only http/https URLs are supported".to_string(),
                ));
            }
            Err(e) => return Err(BrowserError::Action(format!("Invalid URL: {e}"))),
        };

        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            page.goto(url.as_str())
                .await
                .map_err(|e| format!("Navigation failed: {e}"))?;

            let final_url = page
                .url()
                .await
                .map_err(|e| format!("Failed to read page URL: {e}"))?
                .unwrap_or_else(|| url.to_string());
            let title = page
                .get_title()
                .await
                .map_err(|e| format!("Failed to read page title: {e}"))?;

            Ok(json!({
                "action": "navigate",
                "requested_url": url.as_str(),
                "final_url": final_url,
                "title": title,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn click(&self, args: ClickArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let wait_for_navigation = args.wait_for_navigation.unwrap_or(false);
        let selector = args.selector;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            element
                .click()
                .await
                .map_err(|e| format!("Failed to click element '{selector}': {e}"))?;

            if wait_for_navigation {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| format!("Navigation wait failed: {e}"))?;
            }

            Ok(json!({
                "action": "click",
                "selector": selector,
                "final_url": current_url(page).await?,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn fill(&self, args: FillArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;
        let text = args.text;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            element
                .click()
                .await
                .map_err(|e| format!("Failed to focus element '{selector}': {e}"))?;
            element
                .call_js_fn("function() { this.value = ''; }", false)
                .await
                .map_err(|e| format!("Failed to clear element '{selector}': {e}"))?;
            element
                .type_str(&text)
                .await
                .map_err(|e| format!("Failed to type into element '{selector}': {e}"))?;

            // Character count only; the text may be a resolved secret.
            Ok(json!({
                "action": "fill",
                "selector": selector,
                "typed_chars": text.chars().count(),
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn press_key(&self, args: PressKeyArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let wait_for_navigation = args.wait_for_navigation.unwrap_or(false);
        let selector = args.selector;
        let key = args.key;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            element
                .press_key(&key)
                .await
                .map_err(|e| format!("Failed to press {key} on '{selector}': {e}"))?;

            if wait_for_navigation {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| format!("Navigation wait failed: {e}"))?;
            }

            Ok(json!({
                "action": "press_key",
                "selector": selector,
                "key": key,
                "final_url": current_url(page).await?,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn extract_text(&self, args: SelectorArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            let text = element
                .inner_text()
                .await
                .map_err(|e| format!("Failed to read text of '{selector}': {e}"))?
                .unwrap_or_default();

            Ok(json!({
                "action": "extract_text",
                "selector": selector,
                "text": text.trim(),
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn screenshot(&self, args: ScreenshotArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let full_page = args.full_page.unwrap_or(false);

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let screenshot = page
                .screenshot(ScreenshotParams::builder().full_page(full_page).build())
                .await
                .map_err(|e| format!("Failed to capture screenshot: {e}"))?;

            let (width, height) = image::load_from_memory(&screenshot)
                .map(|img| (img.width(), img.height()))
                .unwrap_or((0, 0));

            Ok(json!({
                "mime": "image/png",
                "width": width,
                "height": height,
                "size_bytes": screenshot.len(),
                "data_b64": general_purpose::STANDARD.encode(&screenshot),
                "url": current_url(page).await?,
                "full_page": full_page,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn hover(&self, args: SelectorArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            locate(page, &selector)
                .await?
                .hover()
                .await
                .map_err(|e| format!("Failed to hover element '{selector}': {e}"))?;

            Ok(json!({
                "action": "hover",
                "selector": selector,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn dblclick(&self, args: SelectorArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            for _ in 0..2 {
                element
                    .click()
                    .await
                    .map_err(|e| format!("Failed to click element '{selector}': {e}"))?;
            }
            run_element_fn(&element, DBLCLICK_FN, &selector).await?;

            Ok(json!({
                "action": "dblclick",
                "selector": selector,
                "final_url": current_url(page).await?,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn select_option(&self, args: SelectOptionArgs) -> Result<Value, BrowserError> {
        if args.values.is_empty() {
            return Err(BrowserError::Action(
                "select_option needs at least one value".to_string(),
            ));
        }
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;
        let values = serde_json::to_string(&args.values)
            .map_err(|e| BrowserError::Action(format!("Invalid arguments: {e}")))?;
        let function = SELECT_OPTION_FN.replace("__VALUES__", &values);

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            let outcome = run_element_fn(&element, &function, &selector).await?;

            Ok(json!({
                "action": "select_option",
                "selector": selector,
                "selected": outcome["selected"],
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn set_checked(&self, args: SelectorArgs, checked: bool) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let selector = args.selector;
        let function = SET_CHECKED_FN.replace("__CHECKED__", if checked { "true" } else { "false" });
        let action = if checked { "check" } else { "uncheck" };

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let element = locate(page, &selector).await?;
            element
                .scroll_into_view()
                .await
                .map_err(|e| format!("Failed to scroll to '{selector}': {e}"))?;
            run_element_fn(&element, &function, &selector).await?;

            Ok(json!({
                "action": action,
                "selector": selector,
                "checked": checked,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn scroll(&self, args: ScrollArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);
        let delta = match args.selector {
            Some(_) => 0,
            None => scroll_delta(args.direction.as_deref(), args.pixels).map_err(BrowserError::Action)?,
        };
        let selector = args.selector;

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            match &selector {
                Some(selector) => {
                    locate(page, selector)
                        .await?
                        .scroll_into_view()
                        .await
                        .map_err(|e| format!("Failed to scroll to '{selector}': {e}"))?;
                }
                None => {
                    page.evaluate(format!("window.scrollBy(0, {delta})"))
                        .await
                        .map_err(|e| format!("Failed to scroll page: {e}"))?;
                }
            }
            let scroll_y: f64 = page
                .evaluate("window.scrollY")
                .await
                .map_err(|e| format!("Failed to read scroll position: {e}"))?
                .into_value()
                .map_err(|e| format!("Failed to decode scroll position: {e}"))?;

            Ok(json!({
                "action": "scroll",
                "selector": selector,
                "scroll_y": scroll_y,
            }))
        })
        .await;
        finish(run, duration)
    }

    async fn go_back(&self, args: GoBackArgs) -> Result<Value, BrowserError> {
        let duration = operation_timeout(args.timeout_secs, self.default_timeout_secs);

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            page.evaluate("window.history.back()")
                .await
                .map_err(|e| format!("History navigation failed: {e}"))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| format!("Navigation wait failed: {e}"))?;

            Ok(json!({
                "action": "go_back",
                "final_url": current_url(page).await?,
            }))
        })
        .await;
        finish(run, duration)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    fn capabilities(&self) -> Vec<ActionSpec> {
        standard_actions()
    }

    async fn perform_action(&self, name: &str, args: &Value) -> Result<Value, BrowserError> {
        debug!(action = name, "Performing browser action");
        match name {
            "navigate" => self.navigate(parse_args(args)?).await,
            "click" => self.click(parse_args(args)?).await,
            "fill" => self.fill(parse_args(args)?).await,
            "press_key" => self.press_key(parse_args(args)?).await,
            "extract_text" => self.extract_text(parse_args(args)?).await,
            "screenshot" => self.screenshot(parse_args(args)?).await,
            "hover" => self.hover(parse_args(args)?).await,
            "dblclick" => self.dblclick(parse_args(args)?).await,
            "select_option" => self.select_option(parse_args(args)?).await,
            "check" => self.set_checked(parse_args(args)?, true).await,
            "uncheck" => self.set_checked(parse_args(args)?, false).await,
            "scroll" => self.scroll(parse_args(args)?).await,
            "go_back" => self.go_back(parse_args(args)?).await,
            other => Err(BrowserError::UnsupportedAction(other.to_string())),
        }
    }

    async fn observe_state(&self) -> Result<PageState, BrowserError> {
        let duration = operation_timeout(None, self.default_timeout_secs);
        let script = OBSERVE_SCRIPT.replace("__LIMIT__", &MAX_OBSERVED_ELEMENTS.to_string());

        let run = timeout(duration, async {
            let mut state = self.state.lock().await;
            let page = state.ensure_ready(self.headless).await?;

            let url = current_url(page).await?;
            let title = page
                .get_title()
                .await
                .map_err(|e| format!("Failed to read page title: {e}"))?
                .unwrap_or_default();
            let mut elements: Vec<InteractiveElement> = page
                .evaluate(script.as_str())
                .await
                .map_err(|e| format!("Failed to collect elements: {e}"))?
                .into_value()
                .map_err(|e| format!("Failed to decode elements: {e}"))?;
            elements.truncate(MAX_OBSERVED_ELEMENTS);

            Ok(PageState {
                url,
                title,
                elements,
            })
        })
        .await;

        match run {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(err)) => Err(BrowserError::Observe(err)),
            Err(_) => Err(BrowserError::Timeout(duration.as_secs())),
        }
    }
}
