pub mod chrome;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PilotResult;

/// One clickable/typeable target on the page. `id` is stable for the
/// lifetime of the document (the controller tags the DOM node with it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aria_label: String,
    #[serde(default)]
    pub text: String,
}

impl InteractiveElement {
    /// Everything a human would read as this element's label.
    pub fn label(&self) -> String {
        [&self.name, &self.text, &self.aria_label]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Point-in-time description of the page. Compared by value for progress detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub visible_text: String,
    #[serde(default)]
    pub interactive_elements: Vec<InteractiveElement>,
}

impl Observation {
    pub fn element(&self, id: &str) -> Option<&InteractiveElement> {
        self.interactive_elements.iter().find(|e| e.id == id)
    }

    /// Resolves a target against this observation: explicit id first, then
    /// the first element whose label/role matches every strategy hint.
    pub fn resolve(&self, target: &ElementTarget) -> Option<&InteractiveElement> {
        if let Some(id) = target.element_id.as_deref() {
            if let Some(found) = self.element(id) {
                return Some(found);
            }
        }
        let strategy = target.strategy.as_ref()?;
        if strategy.is_empty() {
            return None;
        }
        self.interactive_elements.iter().find(|e| strategy.matches(e))
    }
}

/// Text/role/name hints used when no element id is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickStrategy {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ClickStrategy {
    pub fn is_empty(&self) -> bool {
        [&self.text, &self.role, &self.name]
            .iter()
            .all(|v| v.as_deref().map_or(true, |s| s.trim().is_empty()))
    }

    fn matches(&self, element: &InteractiveElement) -> bool {
        let label = element.label().to_lowercase();
        let text_ok = self
            .text
            .as_deref()
            .map_or(true, |t| label.contains(&t.to_lowercase()));
        let name_ok = self
            .name
            .as_deref()
            .map_or(true, |n| label.contains(&n.to_lowercase()));
        let role_ok = self.role.as_deref().map_or(true, |r| {
            let r = r.to_lowercase();
            element.role.to_lowercase() == r || element.tag.to_lowercase() == r
        });
        text_ok && name_ok && role_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementTarget {
    pub element_id: Option<String>,
    pub strategy: Option<ClickStrategy>,
}

impl ElementTarget {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            element_id: Some(id.into()),
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// The Action Interface: primitives against one live browser page.
#[async_trait]
pub trait BrowserController: Send + Sync {
    /// Makes a usable page current. With `new_window` a fresh tab is opened.
    async fn select_page(&self, new_window: bool) -> PilotResult<()>;
    async fn snapshot(&self) -> PilotResult<Observation>;
    async fn navigate(&self, url: &str) -> PilotResult<()>;
    /// Returns the id of the element actually clicked.
    async fn click(&self, target: &ElementTarget) -> PilotResult<String>;
    async fn type_text(
        &self,
        target: &ElementTarget,
        text: &str,
        press_enter: bool,
    ) -> PilotResult<String>;
    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> PilotResult<()>;
    async fn wait(&self, ms: u64) -> PilotResult<()>;
    async fn back(&self) -> PilotResult<()>;
    async fn forward(&self) -> PilotResult<()>;
    async fn screenshot(&self, path: &Path) -> PilotResult<()>;
    async fn close(&self) -> PilotResult<()>;
}

/// Starts a browser bound to one on-disk profile.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile_dir: &Path) -> PilotResult<Arc<dyn BrowserController>>;
}
