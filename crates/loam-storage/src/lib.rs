//! SQLite-backed content tree store + tag engine for loam.
//!
//! [`TreeStore::persist`] writes one source row plus its whole node tree in a
//! single transaction. Re-importing a known `source_uri` refreshes the source
//! metadata in place and leaves the existing nodes untouched.

mod schema;
mod tags;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loam_core::{ImportRequest, NodeRecord, ParentRef, SourceRecord};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use schema::run_migrations;
pub use tags::{AttachOptions, NewTag, RuleClassifier, TagClassifier, TagEngine, TagSuggestion};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inconsistent import tree: {0}")]
    InconsistentTree(String),
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::Database(err) if is_unique_violation(err))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Result of [`TreeStore::persist`]; `created` is false when the source already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub source_id: i64,
    pub root_node_id: i64,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct TreeStore {
    pool: SqlitePool,
}

impl TreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database file (created if missing) with WAL and foreign keys on.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection that is never recycled.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Write transaction that takes the database write lock up front, so
    /// concurrent writers queue on `busy_timeout` instead of failing to
    /// upgrade a read snapshot.
    async fn begin_write(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        run_migrations(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn persist(&self, request: &ImportRequest) -> Result<PersistOutcome, StoreError> {
        validate_tree(request)?;
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM sources WHERE source_uri = ?")
            .bind(&request.source_uri)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(source_id) = existing {
            let outcome = refresh_source(&mut tx, source_id, request, now).await?;
            tx.commit().await?;
            info!(source_uri = %request.source_uri, source_id, "source already imported; metadata refreshed");
            return Ok(outcome);
        }

        let inserted = sqlx::query(
            "INSERT INTO sources (source_uri, metadata, timestamp, added_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.source_uri)
        .bind(request.source_metadata.to_string())
        .bind(request.timestamp)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;
        let source_id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(err) if is_unique_violation(&err) => {
                // A concurrent importer won the race for this uri.
                tx.rollback().await?;
                warn!(source_uri = %request.source_uri, "source_uri collision during insert; treating as already imported");
                return self.refresh_existing(request).await;
            }
            Err(err) => return Err(err.into()),
        };

        let root_node_id = insert_node(
            &mut tx,
            NodeInsert {
                source_id,
                parent_id: None,
                path: &request.root.path,
                depth: 0,
                sort_order: 0,
                title: &request.root.title,
                content: &request.root.content,
                metadata: &request.root.metadata,
                now,
            },
        )
        .await?;

        let mut ids: Vec<i64> = Vec::with_capacity(request.children.len());
        let mut paths: Vec<String> = Vec::with_capacity(request.children.len());
        let mut next_sibling: HashMap<ParentRef, u32> = HashMap::new();
        for child in &request.children {
            let (parent_id, parent_path) = match child.parent {
                ParentRef::Root => (root_node_id, request.root.path.as_str()),
                ParentRef::Child(i) => (ids[i], paths[i].as_str()),
            };
            let path = loam_core::extend_path(parent_path, &child.label);
            let slot = next_sibling.entry(child.parent).or_insert(0);
            let sort_order = *slot;
            *slot += 1;

            let id = insert_node(
                &mut tx,
                NodeInsert {
                    source_id,
                    parent_id: Some(parent_id),
                    path: &path,
                    depth: child.depth,
                    sort_order,
                    title: &child.title,
                    content: &child.content,
                    metadata: &child.metadata,
                    now,
                },
            )
            .await?;
            ids.push(id);
            paths.push(path);
        }

        tx.commit().await?;
        info!(
            source_uri = %request.source_uri,
            source_id,
            nodes = request.node_count(),
            "source imported"
        );
        Ok(PersistOutcome {
            source_id,
            root_node_id,
            created: true,
        })
    }

    async fn refresh_existing(&self, request: &ImportRequest) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.begin_write().await?;
        let source_id: i64 = sqlx::query_scalar("SELECT id FROM sources WHERE source_uri = ?")
            .bind(&request.source_uri)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "source",
                key: request.source_uri.clone(),
            })?;
        let outcome = refresh_source(&mut tx, source_id, request, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Newest first.
    pub async fn list_sources(&self, limit: i64) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source_uri, metadata, timestamp, added_at, updated_at FROM sources ORDER BY added_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn source(&self, id: i64) -> Result<Option<SourceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source_uri, metadata, timestamp, added_at, updated_at FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn source_by_uri(&self, source_uri: &str) -> Result<Option<SourceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source_uri, metadata, timestamp, added_at, updated_at FROM sources WHERE source_uri = ?",
        )
        .bind(source_uri)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    /// All nodes of a source ordered by `(parent_id, sort_order)`; the root sorts first.
    pub async fn node_tree(
        &self,
        source_id: i64,
        include_inactive: bool,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, parent_id, path, depth, sort_order, title, content,
                   metadata, is_active, created_at, updated_at
            FROM nodes
            WHERE source_id = ? AND (? OR is_active = 1)
            ORDER BY parent_id IS NOT NULL, parent_id, sort_order
            "#,
        )
        .bind(source_id)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn node(&self, id: i64) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, parent_id, path, depth, sort_order, title, content,
                   metadata, is_active, created_at, updated_at
            FROM nodes WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    pub async fn children(&self, node_id: i64) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, parent_id, path, depth, sort_order, title, content,
                   metadata, is_active, created_at, updated_at
            FROM nodes WHERE parent_id = ? AND is_active = 1
            ORDER BY sort_order
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Active nodes whose path is `prefix` or lies below it, across all sources.
    pub async fn nodes_under_path(&self, prefix: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let descendant_prefix = format!("{prefix}.");
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, parent_id, path, depth, sort_order, title, content,
                   metadata, is_active, created_at, updated_at
            FROM nodes
            WHERE is_active = 1 AND (path = ? OR substr(path, 1, ?) = ?)
            ORDER BY path, sort_order
            "#,
        )
        .bind(prefix)
        .bind(descendant_prefix.len() as i64)
        .bind(&descendant_prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn update_node_content(
        &self,
        node_id: i64,
        title: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE nodes SET title = ?, content = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(content)
            .bind(Utc::now())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected(), "node", node_id)
    }

    /// Soft delete (`false`) or restore (`true`) a node.
    pub async fn set_node_active(&self, node_id: i64, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE nodes SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected(), "node", node_id)
    }

    pub async fn set_embedding(&self, node_id: i64, vector: &[f32]) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE nodes SET embedding = ?, updated_at = ? WHERE id = ?")
            .bind(vec_to_blob(vector))
            .bind(Utc::now())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected(), "node", node_id)
    }

    pub async fn embedding(&self, node_id: i64) -> Result<Option<Vec<f32>>, StoreError> {
        let blob: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT embedding FROM nodes WHERE id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;
        match blob {
            None => Err(StoreError::NotFound {
                entity: "node",
                key: node_id.to_string(),
            }),
            Some(blob) => Ok(blob.map(|b| blob_to_vec(&b))),
        }
    }

    /// Remove a source with all of its nodes and their tag links. Returns false if absent.
    pub async fn delete_source(&self, source_id: i64) -> Result<bool, StoreError> {
        let mut tx = self.begin_write().await?;
        sqlx::query(
            "DELETE FROM node_tags WHERE node_id IN (SELECT id FROM nodes WHERE source_id = ?)",
        )
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        let nodes = sqlx::query("DELETE FROM nodes WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let sources = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if sources > 0 {
            info!(source_id, nodes, "source deleted");
        }
        Ok(sources > 0)
    }

    pub async fn delete_source_by_uri(&self, source_uri: &str) -> Result<bool, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM sources WHERE source_uri = ?")
            .bind(source_uri)
            .fetch_optional(&self.pool)
            .await?;
        match id {
            Some(id) => self.delete_source(id).await,
            None => Ok(false),
        }
    }
}

fn validate_tree(request: &ImportRequest) -> Result<(), StoreError> {
    if request.source_uri.trim().is_empty() {
        return Err(StoreError::InvalidInput("empty source_uri".into()));
    }
    if request.root.path.is_empty() {
        return Err(StoreError::InvalidInput("empty root path".into()));
    }
    for (i, child) in request.children.iter().enumerate() {
        let expected = match child.parent {
            ParentRef::Root => 1,
            ParentRef::Child(p) if p < i => request.children[p].depth + 1,
            ParentRef::Child(p) => {
                return Err(StoreError::InconsistentTree(format!(
                    "child {i} references child {p}, which is not inserted before it"
                )))
            }
        };
        if child.depth != expected {
            return Err(StoreError::InconsistentTree(format!(
                "child {i} declares depth {} but its parent puts it at {expected}",
                child.depth
            )));
        }
    }
    Ok(())
}

async fn refresh_source(
    tx: &mut Transaction<'_, Sqlite>,
    source_id: i64,
    request: &ImportRequest,
    now: DateTime<Utc>,
) -> Result<PersistOutcome, StoreError> {
    sqlx::query(
        "UPDATE sources SET metadata = ?, timestamp = COALESCE(?, timestamp), updated_at = ? WHERE id = ?",
    )
    .bind(request.source_metadata.to_string())
    .bind(request.timestamp)
    .bind(now)
    .bind(source_id)
    .execute(&mut **tx)
    .await?;
    let root_node_id: i64 =
        sqlx::query_scalar("SELECT id FROM nodes WHERE source_id = ? AND parent_id IS NULL")
            .bind(source_id)
            .fetch_one(&mut **tx)
            .await?;
    Ok(PersistOutcome {
        source_id,
        root_node_id,
        created: false,
    })
}

struct NodeInsert<'a> {
    source_id: i64,
    parent_id: Option<i64>,
    path: &'a str,
    depth: u32,
    sort_order: u32,
    title: &'a str,
    content: &'a str,
    metadata: &'a JsonValue,
    now: DateTime<Utc>,
}

async fn insert_node(
    tx: &mut Transaction<'_, Sqlite>,
    node: NodeInsert<'_>,
) -> Result<i64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO nodes (source_id, parent_id, path, depth, sort_order, title, content,
                           metadata, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(node.source_id)
    .bind(node.parent_id)
    .bind(node.path)
    .bind(i64::from(node.depth))
    .bind(i64::from(node.sort_order))
    .bind(node.title)
    .bind(node.content)
    .bind(node.metadata.to_string())
    .bind(node.now)
    .bind(node.now)
    .execute(&mut **tx)
    .await?;
    let id = result.last_insert_rowid();
    debug!(node_id = id, path = node.path, depth = node.depth, "node inserted");
    Ok(id)
}

fn require_affected(rows: u64, entity: &'static str, id: i64) -> Result<(), StoreError> {
    if rows == 0 {
        return Err(StoreError::NotFound {
            entity,
            key: id.to_string(),
        });
    }
    Ok(())
}

fn parse_json(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::Object(Default::default()))
}

fn source_from_row(row: &SqliteRow) -> Result<SourceRecord, StoreError> {
    let metadata: String = row.try_get("metadata")?;
    Ok(SourceRecord {
        id: row.try_get("id")?,
        source_uri: row.try_get("source_uri")?,
        metadata: parse_json(&metadata),
        timestamp: row.try_get("timestamp")?,
        added_at: row.try_get("added_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<NodeRecord, StoreError> {
    let metadata: String = row.try_get("metadata")?;
    let depth: i64 = row.try_get("depth")?;
    let sort_order: i64 = row.try_get("sort_order")?;
    Ok(NodeRecord {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        parent_id: row.try_get("parent_id")?,
        path: row.try_get("path")?,
        depth: depth as u32,
        sort_order: sort_order as u32,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        metadata: parse_json(&metadata),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
