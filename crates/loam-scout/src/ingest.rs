//! Adapter → store → auto-tag, for one payload or a batch of them.

use std::sync::Arc;

use loam_adapters::{normalize, AdapterError};
use loam_core::Platform;
use loam_storage::{
    PersistOutcome, RuleClassifier, StoreError, TagClassifier, TagEngine, TreeStore,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::LoamConfig;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Failures confined to the one payload being imported.
    pub fn is_item_local(&self) -> bool {
        match self {
            IngestError::Adapter(_) => true,
            IngestError::Store(err) => matches!(
                err,
                StoreError::InconsistentTree(_) | StoreError::InvalidInput(_)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportItemResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportItemResult {
    fn imported(outcome: PersistOutcome) -> Self {
        Self {
            success: true,
            source_id: Some(outcome.source_id),
            created: outcome.created,
            error: None,
        }
    }

    fn failed(error: &IngestError) -> Self {
        Self {
            success: false,
            source_id: None,
            created: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Ingestor {
    store: TreeStore,
    tags: TagEngine,
    classifier: Option<Arc<dyn TagClassifier>>,
}

impl Ingestor {
    pub fn new(store: TreeStore) -> Self {
        let tags = TagEngine::new(&store);
        Self {
            store,
            tags,
            classifier: None,
        }
    }

    /// Ingestor for `config`: auto-tags new sources with the rules file at
    /// `tag_rules_path` when one is configured.
    pub fn from_config(store: TreeStore, config: &LoamConfig) -> anyhow::Result<Self> {
        let ingestor = Self::new(store);
        let Some(path) = &config.tag_rules_path else {
            return Ok(ingestor);
        };
        let rules = RuleClassifier::from_path(path)?;
        info!(path = %path.display(), "auto-tagging with rule classifier");
        Ok(ingestor.with_classifier(Arc::new(rules)))
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TagClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn tags(&self) -> &TagEngine {
        &self.tags
    }

    pub async fn import(
        &self,
        platform: Platform,
        raw: &JsonValue,
    ) -> Result<PersistOutcome, IngestError> {
        let request = normalize(platform, raw)?;
        let outcome = self.store.persist(&request).await?;

        if let (true, Some(classifier)) = (outcome.created, &self.classifier) {
            let text = format!("{}\n\n{}", request.root.title, request.root.content);
            let attached = self
                .tags
                .auto_tag(outcome.root_node_id, &text, classifier.as_ref())
                .await?;
            if !attached.is_empty() {
                info!(source_id = outcome.source_id, tags = ?attached, "auto-tagged source root");
            }
        }
        Ok(outcome)
    }

    /// One result per payload, in input order. Only storage failures that
    /// are not specific to a single payload abort the batch.
    pub async fn import_batch(
        &self,
        platform: Platform,
        raws: &[JsonValue],
    ) -> Result<Vec<ImportItemResult>, IngestError> {
        let mut results = Vec::with_capacity(raws.len());
        for (index, raw) in raws.iter().enumerate() {
            match self.import(platform, raw).await {
                Ok(outcome) => results.push(ImportItemResult::imported(outcome)),
                Err(err) if err.is_item_local() => {
                    warn!(%platform, index, error = %err, "batch item rejected");
                    results.push(ImportItemResult::failed(&err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }
}
