use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use visage::config::{Config, DEFAULT_DB_PATH};
use visage::products;
use visage::server;
use visage::sessions::PhaseStore;
use visage::store::{Store, StoreHandle};

#[derive(Parser)]
#[command(name = "visage")]
#[command(version, about = "AI-assisted skincare analysis server")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long)]
        port: Option<u16>,

        /// Database path. Overrides VISAGE_DB.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
    /// Delete expired phase records, provenance rows, and stale leases
    Sweep {
        /// Database path. Overrides VISAGE_DB.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve { port, db, dev } => {
            let mut config = Config::from_env()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if dev {
                config.dev_mode = true;
            }
            server::start(config).await
        }
        Commands::Sweep { db } => sweep(db).await,
    }
}

async fn sweep(db: Option<PathBuf>) -> Result<()> {
    let db_path = db.unwrap_or_else(|| {
        PathBuf::from(std::env::var("VISAGE_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()))
    });
    let store = StoreHandle::new(Store::open(&db_path)?);

    let phase_data = PhaseStore::new(store.clone()).sweep_expired().await?;
    let product_records = products::sweep_expired(&store).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "phase_data": phase_data,
            "product_records": product_records,
        }))?
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "visage=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
