use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::Mutex as AsyncMutex;

use crate::browser::{
    BrowserController, BrowserLauncher, ElementTarget, Observation, ScrollDirection,
};
use crate::errors::{PilotError, PilotResult};

const MAX_ELEMENTS: usize = 80;
const MAX_TEXT_CHARS: usize = 4000;

/// JavaScript that tags interactive nodes with `data-pilot-id` (keeping ids
/// already assigned in this document) and returns the page as JSON.
/// Read-only apart from the id attribute.
const SNAPSHOT_JS: &str = r#"
(() => {
  const MAX = __MAX_ELEMENTS__;
  window.__pilotSeq = window.__pilotSeq || 0;
  const visible = (el) => {
    const r = el.getBoundingClientRect();
    if (r.width === 0 && r.height === 0) return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  };
  const sel = 'a, button, input, textarea, select, [role=button], [role=link], [role=searchbox], [role=textbox], [role=menuitem], [role=tab], [contenteditable=true]';
  const elements = [];
  for (const el of document.querySelectorAll(sel)) {
    if (elements.length >= MAX) break;
    if (!visible(el)) continue;
    if (!el.hasAttribute('data-pilot-id')) {
      el.setAttribute('data-pilot-id', String(++window.__pilotSeq));
    }
    const tag = el.tagName.toLowerCase();
    let role = el.getAttribute('role') || '';
    if (!role) {
      if (tag === 'a') role = 'link';
      else if (tag === 'button') role = 'button';
      else if (tag === 'input' && (el.type === 'search')) role = 'searchbox';
      else if (tag === 'input' || tag === 'textarea') role = 'textbox';
      else if (tag === 'select') role = 'combobox';
    }
    elements.push({
      id: el.getAttribute('data-pilot-id'),
      tag: tag,
      role: role,
      name: (el.getAttribute('name') || el.getAttribute('placeholder') || el.getAttribute('title') || '').slice(0, 80),
      aria_label: (el.getAttribute('aria-label') || '').slice(0, 80),
      text: ((el.innerText || el.value || '') + '').trim().replace(/\s+/g, ' ').slice(0, 80),
    });
  }
  const text = (document.body ? document.body.innerText : '').replace(/\s+/g, ' ').trim();
  return JSON.stringify({
    url: location.href,
    title: document.title || '',
    visible_text: text.slice(0, __MAX_TEXT__),
    interactive_elements: elements,
  });
})()
"#;

/// Finds the first visible interactive element matching the strategy hints,
/// tags it and returns its id (or null).
const RESOLVE_JS: &str = r#"
(() => {
  const hint = __HINT__;
  const norm = (s) => (s || '').toLowerCase();
  const sel = 'a, button, input, textarea, select, [role], [contenteditable=true]';
  window.__pilotSeq = window.__pilotSeq || 0;
  for (const el of document.querySelectorAll(sel)) {
    const label = norm([el.innerText, el.value, el.getAttribute('aria-label'), el.getAttribute('name'), el.getAttribute('placeholder')].join(' '));
    const role = norm(el.getAttribute('role') || el.tagName);
    if (hint.text && !label.includes(norm(hint.text))) continue;
    if (hint.name && !label.includes(norm(hint.name))) continue;
    if (hint.role && role !== norm(hint.role) && norm(el.tagName) !== norm(hint.role)) continue;
    if (!el.hasAttribute('data-pilot-id')) {
      el.setAttribute('data-pilot-id', String(++window.__pilotSeq));
    }
    return el.getAttribute('data-pilot-id');
  }
  return null;
})()
"#;

struct ChromeState {
    browser: Browser,
    tab: Arc<Tab>,
}

/// Single-tab Chrome session over the DevTools protocol.
pub struct ChromeController {
    state: Mutex<Option<ChromeState>>,
    /// Held for the whole life of each blocking DevTools call.
    busy: Arc<AsyncMutex<()>>,
}

/// Runs `f` on the blocking pool while holding `busy`. The guard moves into
/// the blocking closure: dropping this future early (a forced stop) leaves
/// the gate closed until `f` actually returns, so the next caller waits.
async fn run_blocking<T, F>(busy: &Arc<AsyncMutex<()>>, op: &'static str, f: F) -> PilotResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let gate = busy.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || {
        let _gate = gate;
        f()
    })
    .await
    .map_err(|e| PilotError::Browser(format!("{op}: worker failed: {e}")))?
    .map_err(|e| PilotError::Browser(format!("{op}: {e:#}")))
}

impl ChromeController {
    fn current(&self) -> PilotResult<(Browser, Arc<Tab>)> {
        let guard = self
            .state
            .lock()
            .map_err(|_| PilotError::Browser("browser state poisoned".into()))?;
        guard
            .as_ref()
            .map(|s| (s.browser.clone(), s.tab.clone()))
            .ok_or_else(|| PilotError::Browser("browser is closed".into()))
    }

    fn replace_tab(&self, tab: Arc<Tab>) -> PilotResult<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| PilotError::Browser("browser state poisoned".into()))?;
        match guard.as_mut() {
            Some(state) => {
                state.tab = tab;
                Ok(())
            }
            None => Err(PilotError::Browser("browser is closed".into())),
        }
    }

    /// Runs a blocking DevTools call off the async runtime.
    async fn with_tab<T, F>(&self, op: &'static str, f: F) -> PilotResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
    {
        let (_, tab) = self.current()?;
        run_blocking(&self.busy, op, move || f(&tab)).await
    }

    async fn locate(&self, target: &ElementTarget) -> PilotResult<String> {
        if let Some(id) = target.element_id.as_deref().map(sanitize_id) {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let Some(strategy) = target.strategy.clone().filter(|s| !s.is_empty()) else {
            return Err(PilotError::InvalidArguments(
                "element_id or click_strategy is required".into(),
            ));
        };
        let hint = serde_json::to_string(&strategy)?;
        let script = RESOLVE_JS.replace("__HINT__", &hint);
        let found = self
            .with_tab("resolve", move |tab| {
                let result = tab.evaluate(&script, false)?;
                Ok(result.value.and_then(|v| v.as_str().map(String::from)))
            })
            .await?;
        found.ok_or_else(|| PilotError::Browser("no element matches click_strategy".into()))
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_').collect()
}

fn selector_for(id: &str) -> String {
    format!("[data-pilot-id=\"{id}\"]")
}

#[async_trait]
impl BrowserController for ChromeController {
    async fn select_page(&self, new_window: bool) -> PilotResult<()> {
        let (browser, tab) = self.current()?;
        let fresh = run_blocking(&self.busy, "select_page", move || -> anyhow::Result<Option<Arc<Tab>>> {
            if !new_window && tab.evaluate("document.readyState", false).is_ok() {
                return Ok(None);
            }
            let tab = browser.new_tab().context("open tab")?;
            Ok(Some(tab))
        })
        .await?;
        if let Some(tab) = fresh {
            tracing::debug!(new_window, "switched to a fresh tab");
            self.replace_tab(tab)?;
        }
        Ok(())
    }

    async fn snapshot(&self) -> PilotResult<Observation> {
        let script = SNAPSHOT_JS
            .replace("__MAX_ELEMENTS__", &MAX_ELEMENTS.to_string())
            .replace("__MAX_TEXT__", &MAX_TEXT_CHARS.to_string());
        let raw = self
            .with_tab("snapshot", move |tab| {
                let result = tab.evaluate(&script, false)?;
                result
                    .value
                    .and_then(|v| v.as_str().map(String::from))
                    .ok_or_else(|| anyhow!("snapshot script returned nothing"))
            })
            .await?;
        let observation: Observation = serde_json::from_str(&raw)?;
        Ok(observation)
    }

    async fn navigate(&self, url: &str) -> PilotResult<()> {
        let url = url.to_string();
        self.with_tab("navigate", move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn click(&self, target: &ElementTarget) -> PilotResult<String> {
        let id = self.locate(target).await?;
        let selector = selector_for(&id);
        self.with_tab("click", move |tab| {
            tab.find_element(&selector)?.click()?;
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn type_text(
        &self,
        target: &ElementTarget,
        text: &str,
        press_enter: bool,
    ) -> PilotResult<String> {
        let id = self.locate(target).await?;
        let selector = selector_for(&id);
        let text = text.to_string();
        self.with_tab("type", move |tab| {
            let element = tab.find_element(&selector)?;
            element.click()?;
            tab.evaluate(
                &format!("(() => {{ const el = document.querySelector('{selector}'); if (el && 'value' in el) el.value = ''; }})()"),
                false,
            )?;
            tab.type_str(&text)?;
            if press_enter {
                tab.press_key("Enter")?;
                std::thread::sleep(Duration::from_millis(800));
            }
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> PilotResult<()> {
        let dy = match direction {
            ScrollDirection::Down => amount.abs(),
            ScrollDirection::Up => -amount.abs(),
        };
        self.with_tab("scroll", move |tab| {
            tab.evaluate(&format!("window.scrollBy(0, {dy})"), false)?;
            Ok(())
        })
        .await
    }

    async fn wait(&self, ms: u64) -> PilotResult<()> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn back(&self) -> PilotResult<()> {
        self.with_tab("back", |tab| {
            tab.evaluate("history.back()", false)?;
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        })
        .await
    }

    async fn forward(&self) -> PilotResult<()> {
        self.with_tab("forward", |tab| {
            tab.evaluate("history.forward()", false)?;
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> PilotResult<()> {
        let png = self
            .with_tab("screenshot", |tab| {
                tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            })
            .await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, png).await?;
        Ok(())
    }

    async fn close(&self) -> PilotResult<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| PilotError::Browser("browser state poisoned".into()))?
            .take();
        if let Some(state) = state {
            // Dropping the last Browser handle terminates the Chrome process.
            run_blocking(&self.busy, "close", move || {
                drop(state);
                Ok(())
            })
            .await?;
            tracing::info!("browser closed");
        }
        Ok(())
    }
}

/// Launches Chrome with a persistent profile directory.
pub struct ChromeLauncher {
    headless: bool,
    chrome_path: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(headless: bool, chrome_path: Option<PathBuf>) -> Self {
        Self {
            headless,
            chrome_path: chrome_path.filter(|p| !p.as_os_str().is_empty()),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, profile_dir: &Path) -> PilotResult<Arc<dyn BrowserController>> {
        tokio::fs::create_dir_all(profile_dir).await?;
        let headless = self.headless;
        let path = self.chrome_path.clone();
        let profile = profile_dir.to_path_buf();
        tracing::info!(profile = %profile.display(), headless, "launching Chrome");

        let state = tokio::task::spawn_blocking(move || -> anyhow::Result<ChromeState> {
            let options = LaunchOptions {
                headless,
                path,
                user_data_dir: Some(profile),
                args: vec![
                    std::ffi::OsStr::new("--no-first-run"),
                    std::ffi::OsStr::new("--no-default-browser-check"),
                    std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                    std::ffi::OsStr::new("--password-store=basic"),
                ],
                idle_browser_timeout: Duration::from_secs(600),
                ..Default::default()
            };
            let browser = Browser::new(options).context("browser launch failed")?;
            let tab = browser.new_tab()?;
            tab.navigate_to("about:blank")?;
            Ok(ChromeState { browser, tab })
        })
        .await
        .map_err(|e| PilotError::Browser(format!("launch: worker failed: {e}")))?
        .map_err(|e| PilotError::Browser(format!("{e:#}")))?;

        Ok(Arc::new(ChromeController {
            state: Mutex::new(Some(state)),
            busy: Arc::new(AsyncMutex::new(())),
        }))
    }
}
