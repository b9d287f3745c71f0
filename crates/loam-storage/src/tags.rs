//! Hierarchical tags attached to individual nodes, manually or by a classifier.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use loam_core::{NodeTagRecord, TagRecord};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::{StoreError, TreeStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub is_auto_generated: bool,
    /// Clamped into 0..=100.
    pub confidence: Option<u8>,
}

impl AttachOptions {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto(confidence: Option<u8>) -> Self {
        Self {
            is_auto_generated: true,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTag<'a> {
    pub parent: Option<&'a str>,
    pub description: Option<&'a str>,
    pub color: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSuggestion {
    pub name: String,
    pub confidence: Option<u8>,
}

/// External content classifier; returns suggested tag names for a text.
#[async_trait]
pub trait TagClassifier: Send + Sync {
    async fn classify(&self, content: &str) -> anyhow::Result<Vec<TagSuggestion>>;
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
    #[serde(default)]
    confidence: Option<u8>,
}

/// Keyword classifier driven by a YAML rules file.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    rules: Vec<TagRule>,
}

impl RuleClassifier {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: TagRulesFile = serde_yaml::from_str(text).context("parsing tag rules")?;
        Ok(Self { rules: file.rules })
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[async_trait]
impl TagClassifier for RuleClassifier {
    async fn classify(&self, content: &str) -> anyhow::Result<Vec<TagSuggestion>> {
        let haystack = content.to_lowercase();
        let mut out: Vec<TagSuggestion> = Vec::new();
        for rule in &self.rules {
            let hit = rule
                .contains_any
                .iter()
                .any(|needle| haystack.contains(&needle.to_lowercase()));
            if hit && !out.iter().any(|s| s.name == rule.tag) {
                out.push(TagSuggestion {
                    name: rule.tag.clone(),
                    confidence: rule.confidence,
                });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct TagEngine {
    pool: SqlitePool,
}

impl TagEngine {
    pub fn new(store: &TreeStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Find-or-create a tag; fields given here overwrite the stored ones.
    pub async fn create_tag(&self, name: &str, tag: NewTag<'_>) -> Result<TagRecord, StoreError> {
        let name = tag_name(name)?;
        let parent_id = match tag.parent {
            Some(parent) => {
                if tag_name(parent)? == name {
                    return Err(StoreError::InvalidInput(format!(
                        "tag `{name}` cannot be its own parent"
                    )));
                }
                Some(self.find_or_create(parent).await?)
            }
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO tags (name, parent_id, description, color, is_active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            ON CONFLICT(name) DO UPDATE SET
                parent_id = COALESCE(excluded.parent_id, tags.parent_id),
                description = COALESCE(excluded.description, tags.description),
                color = COALESCE(excluded.color, tags.color)
            "#,
        )
        .bind(name)
        .bind(parent_id)
        .bind(tag.description)
        .bind(tag.color)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.tag(name).await?.ok_or_else(|| StoreError::NotFound {
            entity: "tag",
            key: name.to_string(),
        })
    }

    pub async fn tag(&self, name: &str) -> Result<Option<TagRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, parent_id, description, color, is_active FROM tags WHERE name = ?",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tag_from_row).transpose()
    }

    async fn find_or_create(&self, name: &str) -> Result<i64, StoreError> {
        let name = tag_name(name)?;
        sqlx::query("INSERT INTO tags (name, is_active, created_at) VALUES (?, 1, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Link a tag to a node. Returns false if the pair already existed.
    pub async fn attach_tag(
        &self,
        node_id: i64,
        tag: &str,
        options: AttachOptions,
    ) -> Result<bool, StoreError> {
        let node_exists: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        if node_exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "node",
                key: node_id.to_string(),
            });
        }
        let tag_id = self.find_or_create(tag).await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO node_tags (node_id, tag_id, confidence, is_auto_generated, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(node_id, tag_id) DO NOTHING
            "#,
        )
        .bind(node_id)
        .bind(tag_id)
        .bind(options.confidence.map(|c| i64::from(c.min(100))))
        .bind(options.is_auto_generated)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        debug!(node_id, tag, inserted, "tag attached");
        Ok(inserted)
    }

    pub async fn detach_tag(&self, node_id: i64, tag: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query(
            "DELETE FROM node_tags WHERE node_id = ? AND tag_id = (SELECT id FROM tags WHERE name = ?)",
        )
        .bind(node_id)
        .bind(tag.trim())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed > 0)
    }

    pub async fn tags_for_node(&self, node_id: i64) -> Result<Vec<NodeTagRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT nt.node_id, nt.confidence, nt.is_auto_generated,
                   t.id, t.name, t.parent_id, t.description, t.color, t.is_active
            FROM node_tags nt
            JOIN tags t ON t.id = nt.tag_id
            WHERE nt.node_id = ?
            ORDER BY t.name
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<NodeTagRecord, StoreError> {
                let confidence: Option<i64> = row.try_get("confidence")?;
                Ok(NodeTagRecord {
                    node_id: row.try_get("node_id")?,
                    tag: tag_from_row(row)?,
                    confidence: confidence.map(|c| c.clamp(0, 100) as u8),
                    is_auto_generated: row.try_get("is_auto_generated")?,
                })
            })
            .collect()
    }

    /// Ask the classifier for tags and attach them as auto-generated.
    ///
    /// A classifier failure means "no suggestions"; only storage errors surface.
    pub async fn auto_tag(
        &self,
        node_id: i64,
        content: &str,
        classifier: &dyn TagClassifier,
    ) -> Result<Vec<String>, StoreError> {
        let suggestions = match classifier.classify(content).await {
            Ok(suggestions) => suggestions,
            Err(err) => {
                warn!(node_id, error = %err, "tag classifier failed; no tags suggested");
                return Ok(Vec::new());
            }
        };
        let mut attached = Vec::new();
        for suggestion in suggestions {
            if suggestion.name.trim().is_empty() {
                continue;
            }
            self.attach_tag(node_id, &suggestion.name, AttachOptions::auto(suggestion.confidence))
                .await?;
            attached.push(suggestion.name.trim().to_string());
        }
        Ok(attached)
    }
}

fn tag_name(name: &str) -> Result<&str, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("empty tag name".into()));
    }
    Ok(name)
}

fn tag_from_row(row: &SqliteRow) -> Result<TagRecord, StoreError> {
    Ok(TagRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        description: row.try_get("description")?,
        color: row.try_get("color")?,
        is_active: row.try_get("is_active")?,
    })
}
