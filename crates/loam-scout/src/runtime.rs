//! Registry-driven scout runs, once or on a cron schedule.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use loam_storage::TreeStore;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{LoamConfig, ScoutConfig, ScoutRegistry};
use crate::http::FetchSettings;
use crate::ingest::Ingestor;
use crate::page::BrowserLauncher;
use crate::scout::{Scout, ScoutResult, ScoutSettings};
use crate::static_html::HttpBrowser;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ScoutResult>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

pub struct ScoutRuntime {
    config: LoamConfig,
    registry: ScoutRegistry,
    ingestor: Arc<Ingestor>,
    launcher: Arc<dyn BrowserLauncher>,
}

impl ScoutRuntime {
    pub fn new(
        config: LoamConfig,
        registry: ScoutRegistry,
        ingestor: Arc<Ingestor>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            config,
            registry,
            ingestor,
            launcher,
        }
    }

    /// Connect and migrate the store, load the registry and optional tag
    /// rules, and browse through the static HTML client.
    pub async fn from_config(config: LoamConfig) -> Result<Self> {
        let store = TreeStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("running migrations")?;

        let registry = ScoutRegistry::load(&config.registry_path).await?;
        let ingestor = Ingestor::from_config(store, &config)?;

        let launcher = HttpBrowser::new(FetchSettings {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        });
        Ok(Self::new(config, registry, Arc::new(ingestor), Arc::new(launcher)))
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Every enabled platform runs concurrently; jobs within a platform run
    /// one after another through that platform's scout.
    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "scout run started");

        let per_platform = join_all(self.registry.enabled().map(|scout| self.run_platform(scout))).await;
        let results: Vec<ScoutResult> = per_platform.into_iter().flatten().collect();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        info!(
            %run_id,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "scout run finished"
        );
        summary
    }

    async fn run_platform(&self, scout_config: &ScoutConfig) -> Vec<ScoutResult> {
        let platform = scout_config.platform;
        let scout = Scout::new(
            ScoutSettings::from_config(scout_config, &self.config),
            Arc::clone(&self.launcher),
            Arc::clone(&self.ingestor),
        );

        let results = match scout.initialize().await {
            Ok(()) => {
                let mut results = Vec::with_capacity(scout_config.jobs.len());
                for job in &scout_config.jobs {
                    results.push(scout.execute(job).await);
                }
                results
            }
            Err(err) => {
                error!(%platform, error = %err, "skipping platform jobs");
                scout_config
                    .jobs
                    .iter()
                    .map(|job| ScoutResult::failed(job, platform, &err))
                    .collect()
            }
        };
        scout.cleanup().await;
        results
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.as_str();
        let runtime = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let runtime = Arc::clone(&runtime);
            Box::pin(async move {
                let summary = runtime.run_once().await;
                if summary.failed() > 0 {
                    warn!(run_id = %summary.run_id, failed = summary.failed(), "scheduled scout run had failures");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_scouts_once_from_env() -> Result<RunSummary> {
    let runtime = ScoutRuntime::from_config(LoamConfig::from_env()).await?;
    Ok(runtime.run_once().await)
}
