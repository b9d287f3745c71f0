use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_uri TEXT NOT NULL UNIQUE,
        metadata TEXT NOT NULL DEFAULT '{}',
        timestamp TEXT,
        added_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
        parent_id INTEGER REFERENCES nodes(id) ON DELETE CASCADE,
        path TEXT NOT NULL,
        depth INTEGER NOT NULL CHECK (depth >= 0),
        sort_order INTEGER NOT NULL CHECK (sort_order >= 0),
        title TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL DEFAULT '',
        metadata TEXT NOT NULL DEFAULT '{}',
        embedding BLOB,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    // One root per source.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_root ON nodes(source_id) WHERE parent_id IS NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_sibling_order ON nodes(parent_id, sort_order) WHERE parent_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_nodes_source_id ON nodes(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_path ON nodes(path)",
    "CREATE INDEX IF NOT EXISTS idx_sources_added_at ON sources(added_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        parent_id INTEGER REFERENCES tags(id) ON DELETE SET NULL,
        description TEXT,
        color TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_tags (
        node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        confidence INTEGER CHECK (confidence BETWEEN 0 AND 100),
        is_auto_generated INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (node_id, tag_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_node_tags_tag_id ON node_tags(tag_id)",
];

/// Create every table and index; safe to run on an existing database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
