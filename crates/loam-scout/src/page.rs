//! Browsing capability seam: the runtime only ever talks to these traits.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::FetchError;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("selector `{selector}` not found")]
    SelectorNotFound { selector: String },
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("`{operation}` is not supported by this page")]
    Unsupported { operation: &'static str },
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser session is closed")]
    SessionClosed,
    #[error(transparent)]
    Http(#[from] FetchError),
}

/// One matched element: its whitespace-collapsed text plus attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementData {
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

impl ElementData {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub user_agent: Option<String>,
    pub default_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            default_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Resolve once `selector` matches, or fail after `timeout`.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), PageError>;

    /// Text of the first match, if any.
    async fn text(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementData>, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;

    async fn scroll_to_bottom(&self) -> Result<(), PageError>;

    async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Page>, PageError>;

    async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_context(&self, options: &ContextOptions)
        -> Result<Box<dyn BrowserContext>, PageError>;

    async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>, PageError>;
}
