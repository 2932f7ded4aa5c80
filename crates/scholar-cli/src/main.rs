use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scholar_engine::{EngineConfig, RecommendationEngine};
use scholar_ingest::{ingest, IngestConfig, JsonBundleSource, Merger};
use scholar_storage::{open_store, CatalogStore, PgStore, StoreConfig};
use scholar_web::AppState;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "scholar-cli")]
#[command(about = "Scholarship finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge captured observation bundles into the catalog.
    Ingest {
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },
    /// Recompute and print a stored user's shortlist.
    Recommend { user_id: Uuid },
    /// Run the HTTP API, optionally seeding the catalog from bundles first.
    Serve {
        #[arg(long)]
        seed: Vec<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store_config = StoreConfig::from_env();

    match cli.command {
        Commands::Ingest { bundles } => {
            let store = open_store(&store_config).await?;
            let merger = IngestConfig::from_env().merger();
            ingest_bundles(store.as_ref(), &merger, &bundles).await?;
        }
        Commands::Recommend { user_id } => {
            let store = open_store(&store_config).await?;
            let engine = RecommendationEngine::new(EngineConfig::from_env());
            let shortlist = engine
                .refresh(user_id, store.as_ref())
                .await
                .with_context(|| format!("recommending for user {user_id}"))?;
            for (rank, scholarship) in shortlist.iter().enumerate() {
                println!(
                    "{:>2}. {} ({}) {}",
                    rank + 1,
                    scholarship.title,
                    scholarship.amount.as_deref().unwrap_or("amount n/a"),
                    scholarship.link
                );
            }
            if shortlist.is_empty() {
                println!("no eligible scholarships for user {user_id}");
            }
        }
        Commands::Serve { seed, port } => {
            let state = AppState::from_env().await?;
            ingest_bundles(state.store.as_ref(), &state.merger, &seed).await?;
            scholar_web::serve(state, port.unwrap_or_else(scholar_web::port_from_env)).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&store_config.database_url, store_config.max_connections)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn ingest_bundles(
    store: &dyn CatalogStore,
    merger: &Merger,
    bundles: &[PathBuf],
) -> Result<()> {
    for path in bundles {
        let source = JsonBundleSource::open(path)?;
        let summary = ingest(&source, store, merger)
            .await
            .with_context(|| format!("ingesting {}", path.display()))?;
        println!(
            "ingest complete: run_id={} source={} observed={} created={} \
             updated={} rejected={} failed={}",
            summary.run_id,
            summary.source_id,
            summary.observed,
            summary.created,
            summary.updated,
            summary.rejected,
            summary.failed
        );
    }
    Ok(())
}
