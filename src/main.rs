//! CRM sync store - Main Entry Point

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crm_sync::common::config::SyncConfig;
use crm_sync::replay::replay;
use crm_sync::CrmSyncService;

#[derive(Parser, Debug)]
#[command(name = "crm-sync")]
#[command(about = "Real-time entity sync store for the CRM workspace")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "crm-sync.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Workspace to sync, overrides `session.workspace_id`
    #[arg(short, long, env = "CRM_SYNC_WORKSPACE")]
    workspace: Option<String>,

    /// Replay a JSON-lines traffic file offline and print the final views
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so replay output stays clean JSON
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let config = load_config(&args)?;

    if let Some(path) = args.replay {
        debug!("Replaying {}", path.display());
        let input = std::fs::read_to_string(&path)?;
        let report = replay(&config, &input).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!("Starting CRM sync store v{}", env!("CARGO_PKG_VERSION"));
    info!("  - Realtime: {}", config.backend.realtime_url);
    info!("  - REST: {}", config.backend.rest_url);

    let service = CrmSyncService::new(config)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                error!("Sync store error: {}", e);
            }
        }
        () = shutdown => {}
    }

    service.shutdown().await?;
    info!("CRM sync store stopped");
    Ok(())
}

/// Read the config file (defaults when absent) and apply the overrides
fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let found = args.config.exists();
    let mut config = if found {
        let content = std::fs::read_to_string(&args.config)?;
        toml::from_str(&content)?
    } else {
        SyncConfig::default()
    };
    if let Some(workspace) = &args.workspace {
        config.session.workspace_id.clone_from(workspace);
    }

    if config.session.workspace_id.trim().is_empty() {
        let source = if found {
            format!("session.workspace_id is empty in {}", args.config.display())
        } else {
            format!("config file {} not found", args.config.display())
        };
        bail!(
            "No workspace to sync ({source}): pass --workspace, set CRM_SYNC_WORKSPACE \
             or set session.workspace_id in the config file"
        );
    }
    if !found && args.replay.is_none() {
        info!("Config file not found, using defaults");
    }
    Ok(config)
}
