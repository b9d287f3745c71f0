//! Scout runtime: long-lived per-platform browsing sessions that pull
//! content on a schedule and feed it through the adapters into the store.

pub mod config;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod limiter;
pub mod page;
pub mod runtime;
pub mod scout;
pub mod static_html;

#[cfg(test)]
mod testing;

pub use config::{LoamConfig, ScoutConfig, ScoutRegistry};
pub use http::{FetchError, FetchSettings, PageFetcher, RetryPolicy};
pub use ingest::{ImportItemResult, IngestError, Ingestor};
pub use limiter::{RateLimit, SlidingWindowLimiter};
pub use page::{Browser, BrowserContext, BrowserLauncher, ContextOptions, ElementData, Page, PageError};
pub use runtime::{run_scouts_once_from_env, RunSummary, ScoutRuntime};
pub use scout::{Scout, ScoutError, ScoutJob, ScoutResult, ScoutSettings, ScoutState};
pub use static_html::HttpBrowser;
