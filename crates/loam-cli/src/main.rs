use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loam_core::{depth_first, Platform};
use loam_scout::{Ingestor, LoamConfig, ScoutRuntime};
use loam_storage::{AttachOptions, TagEngine, TreeStore};
use serde_json::{json, Value as JsonValue};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loam")]
#[command(about = "Personal knowledge tree: import, scout and tag saved content")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,
    /// Import one payload (JSON object) or a batch (JSON array).
    Import {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        file: PathBuf,
    },
    /// Run every enabled scout in the registry once.
    Scout {
        /// Keep running and repeat on the configured cron schedule.
        #[arg(long)]
        schedule: bool,
    },
    /// List the most recently added sources.
    Sources {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Print a source's node tree.
    Tree { source_uri: String },
    /// Delete a source and everything under it.
    Delete { source_uri: String },
    /// Attach a tag to a node, creating the tag if needed.
    Tag {
        node_id: i64,
        name: String,
        #[arg(long)]
        confidence: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("loam=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = LoamConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Import { platform, file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let raw: JsonValue = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", file.display()))?;
            let ingestor = Ingestor::from_config(open_store(&config).await?, &config)?;

            let output = match &raw {
                JsonValue::Array(items) => {
                    let results = ingestor.import_batch(platform, items).await?;
                    serde_json::to_value(results)?
                }
                JsonValue::Object(_) => {
                    let outcome = ingestor.import(platform, &raw).await?;
                    json!({
                        "success": true,
                        "sourceId": outcome.source_id,
                        "created": outcome.created,
                    })
                }
                _ => bail!("{} must contain a JSON object or array", file.display()),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Scout { schedule } => {
            let runtime = Arc::new(ScoutRuntime::from_config(config).await?);
            let summary = runtime.run_once().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if schedule {
                let Some(sched) = runtime.maybe_build_scheduler().await? else {
                    bail!("--schedule needs LOAM_SCHEDULER_ENABLED=true");
                };
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            }
        }
        Commands::Sources { limit } => {
            let store = open_store(&config).await?;
            for source in store.list_sources(limit).await? {
                println!("{}\t{}\t{}", source.id, source.added_at.to_rfc3339(), source.source_uri);
            }
        }
        Commands::Tree { source_uri } => {
            let store = open_store(&config).await?;
            let Some(source) = store.source_by_uri(&source_uri).await? else {
                bail!("no source with uri {source_uri}");
            };
            let nodes = store.node_tree(source.id, true).await?;
            for node in depth_first(&nodes) {
                let marker = if node.is_active { "" } else { " (inactive)" };
                println!(
                    "{}[{}] {}  {}{}",
                    "  ".repeat(node.depth as usize),
                    node.id,
                    node.title,
                    node.path,
                    marker
                );
            }
        }
        Commands::Delete { source_uri } => {
            let store = open_store(&config).await?;
            if store.delete_source_by_uri(&source_uri).await? {
                println!("deleted {source_uri}");
            } else {
                bail!("no source with uri {source_uri}");
            }
        }
        Commands::Tag {
            node_id,
            name,
            confidence,
        } => {
            let store = open_store(&config).await?;
            let options = AttachOptions {
                confidence,
                ..AttachOptions::manual()
            };
            let attached = TagEngine::new(&store).attach_tag(node_id, &name, options).await?;
            if attached {
                println!("tagged node {node_id} with {name}");
            } else {
                println!("node {node_id} already tagged with {name}");
            }
        }
    }

    Ok(())
}

async fn open_store(config: &LoamConfig) -> Result<TreeStore> {
    let store = TreeStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}
