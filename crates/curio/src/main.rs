//! Curio: catalog dashboard sync client
//!
//! Main binary with subcommands:
//! - `watch`: keep queries in sync and log every change
//! - `cancel-job` / `retry-job`: run an optimistic job action
//! - `prefs`: show persisted UI preferences

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use curio_sync::{
    CacheUpdate, ConnectionState, PrefsStore, QueryKey, SyncConfig, SyncEngine, query_key,
};
use miette::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "curio")]
#[command(about = "Catalog dashboard sync client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ApiArgs {
    /// API base URL
    #[arg(long, env = "CURIO_API_URL")]
    api_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "CURIO_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// JSON config file; flags override its values
    #[arg(long, env = "CURIO_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep queries in sync and log cache and connection changes until Ctrl-C
    Watch {
        #[command(flatten)]
        api: ApiArgs,

        /// Query key as a JSON array, e.g. '["queue", {"status": "active"}]'.
        /// Repeatable; defaults to ["queue"] and ["items"].
        #[arg(long = "query", value_parser = parse_query_key)]
        queries: Vec<QueryKey>,
    },

    /// Cancel a job
    CancelJob {
        #[command(flatten)]
        api: ApiArgs,

        /// Job id
        id: String,
    },

    /// Retry a failed or cancelled job
    RetryJob {
        #[command(flatten)]
        api: ApiArgs,

        /// Job id
        id: String,
    },

    /// Show persisted UI preferences
    Prefs {
        /// Prefs file (defaults to the user config directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn parse_query_key(s: &str) -> Result<QueryKey, String> {
    let key: QueryKey = serde_json::from_str(s).map_err(|e| format!("invalid query key: {}", e))?;
    if key.is_empty() {
        return Err("query key must have at least one segment".to_string());
    }
    Ok(key)
}

fn load_config(args: &ApiArgs) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path).map_err(|e| miette::miette!("{}", e))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = &args.api_url {
        config.api.base_url = url.clone();
    }
    if args.token.is_some() {
        config.api.token = args.token.clone();
    }
    config.validate().map_err(|e| miette::miette!("{}", e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "curio=info,curio_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { api, queries } => run_watch(&api, queries).await,
        Commands::CancelJob { api, id } => run_job_action(&api, JobAction::Cancel, id).await,
        Commands::RetryJob { api, id } => run_job_action(&api, JobAction::Retry, id).await,
        Commands::Prefs { path } => show_prefs(path),
    }
}

async fn run_watch(api: &ApiArgs, mut queries: Vec<QueryKey>) -> Result<()> {
    let config = load_config(api)?;
    if queries.is_empty() {
        queries = vec![query_key!["queue"], query_key!["items"]];
    }

    let engine = SyncEngine::builder(config)
        .start()
        .map_err(|e| miette::miette!("failed to start sync engine: {}", e))?;

    let mut updates = engine.cache().subscribe();
    let mut state_rx = engine.subscribe_state();
    let _observers: Vec<_> = queries
        .iter()
        .map(|key| {
            engine.poll(key.clone());
            engine.observe(key.clone())
        })
        .collect();
    info!(queries = queries.len(), "watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C");
                break;
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => info!("push channel connected"),
                    ConnectionState::Reconnecting => warn!("push channel lost, reconnecting"),
                    other => info!(state = ?other, "push channel state"),
                }
            }

            update = updates.recv() => match update {
                Ok(CacheUpdate::Written { entry, cause }) => {
                    info!(key = %entry.key, cause = ?cause, data = %entry.data, "cache write");
                }
                Ok(CacheUpdate::Removed { key, cause }) => {
                    info!(key = %key, cause = ?cause, "cache removal");
                }
                Ok(CacheUpdate::Invalidated { key, refetch }) => {
                    info!(key = %key, refetch, "cache invalidation");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed cache updates"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}

#[derive(Clone, Copy)]
enum JobAction {
    Cancel,
    Retry,
}

async fn run_job_action(api: &ApiArgs, action: JobAction, id: String) -> Result<()> {
    let config = load_config(api)?;
    let engine = SyncEngine::builder(config)
        .connect(false)
        .start()
        .map_err(|e| miette::miette!("failed to start sync engine: {}", e))?;

    let ticket = match action {
        JobAction::Cancel => engine.actions().cancel_job(id.as_str()),
        JobAction::Retry => engine.actions().retry_job(id.as_str()),
    };
    let result = ticket.await;
    engine.shutdown().await;

    let response = result.map_err(|e| {
        if e.is_transient() {
            miette::miette!(
                help = "the server may be briefly unavailable; try again",
                "job {} was not updated: {}",
                id,
                e
            )
        } else {
            miette::miette!("job {} was not updated: {}", id, e)
        }
    })?;
    info!(job = %id, "job updated");
    if !response.is_null() {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).map_err(|e| miette::miette!("{}", e))?
        );
    }
    Ok(())
}

fn show_prefs(path: Option<PathBuf>) -> Result<()> {
    let store = PrefsStore::new(path.unwrap_or_else(PrefsStore::default_path));
    let prefs = store.load();
    println!("file:            {}", store.path().display());
    println!("view mode:       {:?}", prefs.view_mode);
    println!(
        "active filter:   {}",
        prefs.active_filter_id.as_deref().unwrap_or("(none)")
    );
    println!("scroll offset:   {}", prefs.scroll_offset);
    Ok(())
}
