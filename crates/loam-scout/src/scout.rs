//! One scout per platform: a browser session, a rate-limited single lane for
//! jobs, and the lifecycle state machine around them.
//!
//! ```text
//! Uninitialized → Initializing → Ready ⇄ Executing
//!                      ↓            ↓
//!                    Failed ←───────┘ (session lost)
//! any → CleaningUp → Closed
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loam_core::Platform;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{LoamConfig, ScoutConfig};
use crate::extract::{extract_payloads, Selectors};
use crate::ingest::{ImportItemResult, IngestError, Ingestor};
use crate::limiter::{RateLimit, SlidingWindowLimiter};
use crate::page::{Browser, BrowserContext, BrowserLauncher, ContextOptions, Page, PageError};

const HEALTH_PAGE: &str = "data:text/html,<html><body>Health Check</body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoutState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Failed,
    CleaningUp,
    Closed,
}

#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("{platform} scout is not ready (state {state:?})")]
    NotReady { platform: Platform, state: ScoutState },
    #[error("{platform} login was not observed within {timeout:?}")]
    LoginTimeout { platform: Platform, timeout: Duration },
    #[error("{platform} scout cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        platform: Platform,
        from: ScoutState,
        to: ScoutState,
    },
    #[error("job {job_id} exceeded its {timeout:?} timeout")]
    JobTimeout { job_id: String, timeout: Duration },
    #[error("{platform} extraction failed: {reason}")]
    Extract { platform: Platform, reason: String },
    #[error(transparent)]
    Page(#[from] PageError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoutJob {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoutResult {
    pub job_id: String,
    pub platform: Platform,
    pub success: bool,
    pub imports: Vec<ImportItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScoutResult {
    pub fn failed(job: &ScoutJob, platform: Platform, error: impl ToString) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id.clone(),
            platform,
            success: false,
            imports: Vec::new(),
            error: Some(error.to_string()),
            started_at: now,
            finished_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub url: String,
    pub logged_in_selector: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ScoutSettings {
    pub platform: Platform,
    pub rate_limit: RateLimit,
    pub job_timeout: Duration,
    pub login: Option<LoginSettings>,
    pub health_url: Option<String>,
    pub selectors: Selectors,
    pub context: ContextOptions,
}

impl ScoutSettings {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            rate_limit: RateLimit::default_for(platform),
            job_timeout: Duration::from_secs(60),
            login: None,
            health_url: None,
            selectors: Selectors::for_platform(platform, &Default::default()),
            context: ContextOptions::default(),
        }
    }

    pub fn from_config(scout: &ScoutConfig, config: &LoamConfig) -> Self {
        let login = match (&scout.login_url, &scout.logged_in_selector) {
            (Some(url), Some(selector)) => Some(LoginSettings {
                url: url.clone(),
                logged_in_selector: selector.clone(),
                timeout: config.login_timeout(),
                poll_interval: Duration::from_secs(2),
            }),
            _ => None,
        };
        Self {
            platform: scout.platform,
            rate_limit: scout.rate_limit(),
            job_timeout: config.job_timeout(),
            login,
            health_url: scout.health_url.clone(),
            selectors: Selectors::for_platform(scout.platform, &scout.selectors),
            context: ContextOptions {
                user_agent: Some(config.user_agent.clone()),
                default_timeout: config.http_timeout(),
            },
        }
    }
}

/// Browser handles owned by one scout, released in reverse order of creation.
#[derive(Default)]
struct Session {
    browser: Option<Box<dyn Browser>>,
    context: Option<Box<dyn BrowserContext>>,
    page: Option<Box<dyn Page>>,
    logged_in: bool,
}

/// Outcome of one job: whatever was imported plus the error that failed it.
struct JobRun {
    imports: Vec<ImportItemResult>,
    error: Option<ScoutError>,
}

impl JobRun {
    fn failed(error: ScoutError) -> Self {
        Self {
            imports: Vec::new(),
            error: Some(error),
        }
    }
}

pub struct Scout {
    settings: ScoutSettings,
    launcher: Arc<dyn BrowserLauncher>,
    ingestor: Arc<Ingestor>,
    limiter: SlidingWindowLimiter,
    state: Mutex<ScoutState>,
    /// Held for the whole of a job; tokio's mutex is fair, so jobs run FIFO.
    lane: tokio::sync::Mutex<Session>,
}

impl Scout {
    pub fn new(
        settings: ScoutSettings,
        launcher: Arc<dyn BrowserLauncher>,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(settings.rate_limit),
            settings,
            launcher,
            ingestor,
            state: Mutex::new(ScoutState::Uninitialized),
            lane: tokio::sync::Mutex::new(Session::default()),
        }
    }

    pub fn platform(&self) -> Platform {
        self.settings.platform
    }

    pub fn state(&self) -> ScoutState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn is_logged_in(&self) -> bool {
        self.lane.lock().await.logged_in
    }

    fn set_state(&self, to: ScoutState) -> ScoutState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, to)
    }

    fn transition(&self, allowed: &[ScoutState], to: ScoutState) -> Result<(), ScoutError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !allowed.contains(&*state) {
            return Err(ScoutError::InvalidTransition {
                platform: self.platform(),
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    /// Open the browser session and complete the login handshake if one is
    /// configured. A failed scout may be initialized again from scratch.
    pub async fn initialize(&self) -> Result<(), ScoutError> {
        use ScoutState::*;
        self.transition(&[Uninitialized, Failed, Closed], Initializing)?;
        let platform = self.platform();
        let mut session = self.lane.lock().await;
        info!(%platform, "initializing scout");

        match self.open_session(&mut session).await {
            Ok(()) => {
                self.set_state(Ready);
                info!(%platform, logged_in = session.logged_in, "scout ready");
                Ok(())
            }
            Err(err) => {
                error!(%platform, error = %err, "scout initialization failed");
                release_session(platform, &mut session).await;
                self.set_state(Failed);
                Err(err)
            }
        }
    }

    async fn open_session(&self, session: &mut Session) -> Result<(), ScoutError> {
        let browser = self.launcher.launch().await?;
        let context = browser.new_context(&self.settings.context).await;
        session.browser = Some(browser);
        let context = context?;
        let page = context.new_page().await;
        session.context = Some(context);
        session.page = Some(page?);

        if let Some(login) = &self.settings.login {
            let page = session.page.as_deref().ok_or(PageError::SessionClosed)?;
            self.await_login(page, login).await?;
            session.logged_in = true;
        }
        Ok(())
    }

    async fn await_login(&self, page: &dyn Page, login: &LoginSettings) -> Result<(), ScoutError> {
        let platform = self.platform();
        page.navigate(&login.url).await?;
        info!(%platform, url = %login.url, timeout = ?login.timeout, "waiting for login to complete");

        let poll = async {
            loop {
                match page
                    .wait_for_selector(&login.logged_in_selector, login.poll_interval)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(PageError::SelectorNotFound { .. } | PageError::Timeout(_)) => {
                        debug!(%platform, "login marker not present yet");
                        tokio::time::sleep(login.poll_interval).await;
                    }
                    Err(err) => return Err(ScoutError::from(err)),
                }
            }
        };
        match tokio::time::timeout(login.timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ScoutError::LoginTimeout {
                platform,
                timeout: login.timeout,
            }),
        }
    }

    /// Run one job through this scout's lane. Never fails: every error is
    /// folded into the returned [`ScoutResult`].
    ///
    /// The job timeout bounds navigation and extraction only. Once payloads
    /// are in hand the batch is ingested to the end; a job that finishes
    /// past its deadline is still reported as failed, with its imports.
    pub async fn execute(&self, job: &ScoutJob) -> ScoutResult {
        let platform = self.platform();
        let span = info_span!("scout_job", %platform, job_id = %job.id);
        async {
            let session = self.lane.lock().await;
            let (started_at, run) = match self.begin_job() {
                Err(err) => (Utc::now(), JobRun::failed(err)),
                Ok(()) => {
                    self.limiter.acquire().await;
                    let started_at = Utc::now();
                    let run = self.run_job(&session, job).await;
                    self.finish_job(&run);
                    (started_at, run)
                }
            };
            drop(session);

            let rejected = run.imports.iter().filter(|i| !i.success).count();
            match &run.error {
                None => info!(imports = run.imports.len(), rejected, "scout job finished"),
                Some(err) => error!(error = %err, imports = run.imports.len(), "scout job failed"),
            }
            ScoutResult {
                job_id: job.id.clone(),
                platform,
                success: run.error.is_none(),
                error: run.error.map(|e| e.to_string()),
                imports: run.imports,
                started_at,
                finished_at: Utc::now(),
            }
        }
        .instrument(span)
        .await
    }

    fn begin_job(&self) -> Result<(), ScoutError> {
        self.transition(&[ScoutState::Ready], ScoutState::Executing)
            .map_err(|err| match err {
                ScoutError::InvalidTransition { platform, from, .. } => ScoutError::NotReady {
                    platform,
                    state: from,
                },
                other => other,
            })
    }

    fn finish_job(&self, run: &JobRun) {
        let next = match run.error {
            Some(ScoutError::Page(PageError::SessionClosed)) => {
                warn!(platform = %self.platform(), "browser session lost; scout needs re-initialization");
                ScoutState::Failed
            }
            _ => ScoutState::Ready,
        };
        self.set_state(next);
    }

    async fn run_job(&self, session: &Session, job: &ScoutJob) -> JobRun {
        let platform = self.platform();
        let timeout = self.settings.job_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || ScoutError::JobTimeout {
            job_id: job.id.clone(),
            timeout,
        };

        let payloads = match tokio::time::timeout_at(deadline, self.load_payloads(session, job)).await {
            Ok(Ok(payloads)) => payloads,
            Ok(Err(err)) => return JobRun::failed(err),
            Err(_) => return JobRun::failed(timed_out()),
        };

        match self.ingestor.import_batch(platform, &payloads).await {
            Ok(imports) => JobRun {
                error: (Instant::now() > deadline).then(timed_out),
                imports,
            },
            Err(err) => JobRun::failed(err.into()),
        }
    }

    async fn load_payloads(
        &self,
        session: &Session,
        job: &ScoutJob,
    ) -> Result<Vec<JsonValue>, ScoutError> {
        let page = session.page.as_deref().ok_or(PageError::SessionClosed)?;
        page.navigate(&job.url).await?;
        extract_payloads(
            self.platform(),
            page,
            job,
            &self.settings.selectors,
            self.settings.context.default_timeout,
        )
        .await
    }

    /// Release page, context and browser in that order. Failures are logged
    /// and never stop the remaining steps.
    pub async fn cleanup(&self) {
        let platform = self.platform();
        let mut session = self.lane.lock().await;
        let previous = self.set_state(ScoutState::CleaningUp);
        info!(%platform, ?previous, "cleaning up scout");
        release_session(platform, &mut session).await;
        self.set_state(ScoutState::Closed);
        info!(%platform, "scout closed");
    }

    /// Trivial in-session navigation; any failure reads as unhealthy. A
    /// scout busy with a job is healthy without waiting for the lane.
    pub async fn health_check(&self) -> bool {
        if !matches!(self.state(), ScoutState::Ready | ScoutState::Executing) {
            return false;
        }
        let Ok(session) = self.lane.try_lock() else {
            debug!(platform = %self.platform(), "health check skipped while a job holds the lane");
            return true;
        };
        if self.state() != ScoutState::Ready {
            return false;
        }
        let Some(page) = session.page.as_deref() else {
            return false;
        };
        let url = self.settings.health_url.as_deref().unwrap_or(HEALTH_PAGE);
        match tokio::time::timeout(self.settings.context.default_timeout, page.navigate(url)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(platform = %self.platform(), error = %err, "health check failed");
                false
            }
            Err(_) => {
                warn!(platform = %self.platform(), "health check timed out");
                false
            }
        }
    }
}

async fn release_session(platform: Platform, session: &mut Session) {
    if let Some(page) = session.page.take() {
        if let Err(err) = page.close().await {
            warn!(%platform, error = %err, "closing page failed");
        }
    }
    if let Some(context) = session.context.take() {
        if let Err(err) = context.close().await {
            warn!(%platform, error = %err, "closing browser context failed");
        }
    }
    if let Some(browser) = session.browser.take() {
        if let Err(err) = browser.close().await {
            warn!(%platform, error = %err, "closing browser failed");
        }
    }
    session.logged_in = false;
}
