//! AEGIS Rules Engine Entry Point
//!
//! Serves the policy admin API and the `/analyze` endpoint consulted by the
//! gateway proxy.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration (SQLite at ./data/rules.db)
//! aegis-rules-engine
//!
//! # Run with a config file, overriding the port
//! aegis-rules-engine --config /etc/aegis/rules.toml --port 9090
//!
//! # Throwaway in-memory store for local testing
//! aegis-rules-engine --in-memory --verbose
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use aegis_rules_engine::config::{Config, StoreBackend};
use aegis_rules_engine::rules::{
    run_rules_api, AssociationManager, AttackDetector, HttpAuthClient, InMemoryPolicyStore,
    PolicyService, PolicyStore, RequestAnalyzer, RulesApi, SqlitePolicyStore,
};

/// AEGIS Rules Engine
#[derive(Parser, Debug)]
#[command(name = "aegis-rules-engine")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "AEGIS API gateway rules engine", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// API listen port
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database file
    #[arg(long)]
    db: Option<String>,

    /// Keep policies in memory only
    #[arg(long)]
    in_memory: bool,

    /// Token verification endpoint of the auth service
    #[arg(long)]
    auth_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting AEGIS Rules Engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Command line overrides
    if let Some(bind) = args.bind {
        config.server.host = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = args.db {
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = db;
    }
    if args.in_memory {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(auth_url) = args.auth_url {
        config.auth.url = auth_url;
    }

    config.validate()?;

    match config.store.backend {
        StoreBackend::Memory => {
            info!("Policy store: in-memory");
            serve(config, Arc::new(InMemoryPolicyStore::new())).await
        }
        StoreBackend::Sqlite => {
            if let Some(dir) = Path::new(&config.store.path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            info!("Policy store: sqlite at {}", config.store.path);
            let store = SqlitePolicyStore::new(&config.store.path)?;
            serve(config, Arc::new(store)).await
        }
    }
}

/// Wire the services around `store` and serve until Ctrl-C
async fn serve<S: PolicyStore + 'static>(config: Config, store: Arc<S>) -> anyhow::Result<()> {
    let detector = Arc::new(AttackDetector::new()?);
    let analyzer = Arc::new(RequestAnalyzer::new(store.clone(), detector));
    let auth = Arc::new(HttpAuthClient::with_timeout(
        config.auth.url.clone(),
        config.auth_timeout(),
    )?);

    let api = RulesApi::new(
        PolicyService::new(store.clone()),
        AssociationManager::new(store),
        analyzer,
        auth,
    )
    .with_max_body_bytes(config.server.max_body_bytes)
    .with_analyze_timeout(config.analyze_timeout());

    let addr = config.listen_addr()?;
    info!("Rules engine configuration:");
    info!("  API: {}", addr);
    info!("  Auth service: {}", config.auth.url);
    info!("  Analyze timeout: {} ms", config.analyzer.timeout_ms);

    run_rules_api(addr, Arc::new(api), async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
    })
    .await
}
