//! In-process browser double for runtime tests.
//!
//! URLs containing `/slow` hang for an hour and `/delay` take one second
//! before loading; `/broken` then fails navigation and `/gone` reports a lost
//! session. Anything else serves the registered markup (or an empty document).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::page::{Browser, BrowserContext, BrowserLauncher, ContextOptions, ElementData, Page, PageError};
use crate::static_html::select_elements;

#[derive(Debug, Default)]
struct Shared {
    pages: HashMap<String, String>,
    events: Mutex<Vec<String>>,
    fail_close: bool,
}

impl Shared {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeLauncher {
    shared: Arc<Shared>,
}

pub(crate) struct FakeLauncherBuilder {
    shared: Shared,
}

impl FakeLauncher {
    pub(crate) fn builder() -> FakeLauncherBuilder {
        FakeLauncherBuilder {
            shared: Shared::default(),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.shared.events.lock().unwrap().clone()
    }
}

impl FakeLauncherBuilder {
    pub(crate) fn page(mut self, url: &str, markup: &str) -> Self {
        self.shared.pages.insert(url.to_string(), markup.to_string());
        self
    }

    /// Page and context refuse to close; the browser still closes.
    pub(crate) fn failing_close(mut self) -> Self {
        self.shared.fail_close = true;
        self
    }

    pub(crate) fn build(self) -> FakeLauncher {
        FakeLauncher {
            shared: Arc::new(self.shared),
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, PageError> {
        self.shared.record("browser.launch");
        Ok(Box::new(FakeBrowser {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeBrowser {
    shared: Arc<Shared>,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_context(
        &self,
        _options: &ContextOptions,
    ) -> Result<Box<dyn BrowserContext>, PageError> {
        Ok(Box::new(FakeContext {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> Result<(), PageError> {
        self.shared.record("browser.close");
        Ok(())
    }
}

struct FakeContext {
    shared: Arc<Shared>,
}

#[async_trait]
impl BrowserContext for FakeContext {
    async fn new_page(&self) -> Result<Box<dyn Page>, PageError> {
        Ok(Box::new(FakePage {
            shared: Arc::clone(&self.shared),
            html: Mutex::new(String::new()),
        }))
    }

    async fn close(&self) -> Result<(), PageError> {
        self.shared.record("context.close");
        if self.shared.fail_close {
            return Err(PageError::Launch("context wedged".into()));
        }
        Ok(())
    }
}

struct FakePage {
    shared: Arc<Shared>,
    html: Mutex<String>,
}

impl FakePage {
    fn select(&self, selector: &str) -> Result<Vec<ElementData>, PageError> {
        let html = self.html.lock().unwrap().clone();
        select_elements(&html, selector)
    }
}

#[async_trait]
impl Page for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.shared.record(format!("navigate {url}"));
        if url.contains("/slow") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if url.contains("/delay") {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if url.contains("/broken") {
            return Err(PageError::Navigation {
                url: url.to_string(),
                reason: "connection reset".into(),
            });
        }
        if url.contains("/gone") {
            return Err(PageError::SessionClosed);
        }
        let markup = match url.strip_prefix("data:text/html,") {
            Some(inline) => inline.to_string(),
            None => self.shared.pages.get(url).cloned().unwrap_or_default(),
        };
        *self.html.lock().unwrap() = markup;
        self.shared.record(format!("loaded {url}"));
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<(), PageError> {
        if self.select(selector)?.is_empty() {
            return Err(PageError::SelectorNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<Option<String>, PageError> {
        Ok(self.select(selector)?.into_iter().map(|el| el.text).find(|t| !t.is_empty()))
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementData>, PageError> {
        self.select(selector)
    }

    async fn click(&self, _selector: &str) -> Result<(), PageError> {
        Ok(())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<(), PageError> {
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> Result<(), PageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.shared.record("page.close");
        if self.shared.fail_close {
            return Err(PageError::Launch("page wedged".into()));
        }
        Ok(())
    }
}

pub(crate) fn chat_markup(first_question: &str) -> String {
    format!(
        r#"<h1>Session</h1>
           <div data-message-author-role="user">{first_question}</div>
           <div data-message-author-role="assistant">Here is an answer.</div>"#
    )
}
