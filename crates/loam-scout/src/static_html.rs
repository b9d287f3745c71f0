//! Static-HTML browser: pages are fetched over HTTP and queried with CSS
//! selectors. Nothing is rendered or scripted, so `click`/`fill` are refused.
//!
//! `data:text/html,<markup>` URLs load the markup as-is without a request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;

use crate::http::{FetchSettings, PageFetcher};
use crate::page::{Browser, BrowserContext, BrowserLauncher, ContextOptions, ElementData, Page, PageError};

const INLINE_PREFIX: &str = "data:text/html,";

#[derive(Debug, Clone, Default)]
pub struct HttpBrowser {
    settings: FetchSettings,
}

impl HttpBrowser {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserLauncher for HttpBrowser {
    async fn launch(&self) -> Result<Box<dyn Browser>, PageError> {
        Ok(Box::new(HttpSession {
            settings: self.settings.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct HttpSession {
    settings: FetchSettings,
    closed: AtomicBool,
}

#[async_trait]
impl Browser for HttpSession {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn BrowserContext>, PageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PageError::SessionClosed);
        }
        let mut settings = self.settings.clone();
        settings.timeout = options.default_timeout;
        if options.user_agent.is_some() {
            settings.user_agent = options.user_agent.clone();
        }
        let fetcher = PageFetcher::new(settings).map_err(|e| PageError::Launch(format!("{e:#}")))?;
        Ok(Box::new(HttpContext {
            fetcher: Arc::new(fetcher),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), PageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct HttpContext {
    fetcher: Arc<PageFetcher>,
    closed: AtomicBool,
}

#[async_trait]
impl BrowserContext for HttpContext {
    async fn new_page(&self) -> Result<Box<dyn Page>, PageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PageError::SessionClosed);
        }
        Ok(Box::new(HttpPage::new(Arc::clone(&self.fetcher))))
    }

    async fn close(&self) -> Result<(), PageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Document {
    url: Option<String>,
    html: String,
    closed: bool,
}

#[derive(Debug)]
pub struct HttpPage {
    fetcher: Arc<PageFetcher>,
    document: Mutex<Document>,
}

impl HttpPage {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self {
            fetcher,
            document: Mutex::new(Document::default()),
        }
    }

    pub fn current_url(&self) -> Option<String> {
        self.document().url.clone()
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_document(&self) -> Result<MutexGuard<'_, Document>, PageError> {
        let doc = self.document();
        if doc.closed {
            return Err(PageError::SessionClosed);
        }
        Ok(doc)
    }

    fn select(&self, selector: &str) -> Result<Vec<ElementData>, PageError> {
        let doc = self.open_document()?;
        select_elements(&doc.html, selector)
    }
}

#[async_trait]
impl Page for HttpPage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        drop(self.open_document()?);
        let html = match url.strip_prefix(INLINE_PREFIX) {
            Some(markup) => markup.to_string(),
            None => {
                let page = self.fetcher.fetch(url).await?;
                debug!(url, final_url = %page.url, status = page.status, bytes = page.html.len(), "page loaded");
                page.html
            }
        };
        let mut doc = self.open_document()?;
        doc.url = Some(url.to_string());
        doc.html = html;
        Ok(())
    }

    /// The document never changes after load, so this answers immediately.
    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<(), PageError> {
        if self.select(selector)?.is_empty() {
            return Err(PageError::SelectorNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<Option<String>, PageError> {
        Ok(self
            .select(selector)?
            .into_iter()
            .map(|el| el.text)
            .find(|text| !text.is_empty()))
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementData>, PageError> {
        self.select(selector)
    }

    async fn click(&self, _selector: &str) -> Result<(), PageError> {
        Err(PageError::Unsupported { operation: "click" })
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<(), PageError> {
        Err(PageError::Unsupported { operation: "fill" })
    }

    /// Static documents are fully loaded already.
    async fn scroll_to_bottom(&self) -> Result<(), PageError> {
        drop(self.open_document()?);
        Ok(())
    }

    async fn close(&self) -> Result<(), PageError> {
        let mut doc = self.document();
        doc.closed = true;
        doc.html.clear();
        Ok(())
    }
}

/// Parse `html` and collect every element matching `selector`.
pub fn select_elements(html: &str, selector: &str) -> Result<Vec<ElementData>, PageError> {
    let sel = Selector::parse(selector).map_err(|e| PageError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&sel)
        .map(|el| ElementData {
            text: collapse_whitespace(&el.text().collect::<String>()),
            attrs: el
                .value()
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        })
        .collect())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
