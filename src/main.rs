use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use zap_bridge::BridgeTransportFactory;
use zap_core::{config, shellexpand, traits::CredentialStore};
use zap_session::{Registry, SessionPolicy};
use zap_store::Store;

/// How often `start` checks sessions for a new pairing code.
const QR_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "zap",
    version,
    about = "zap — WhatsApp session supervisor"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured sessions and supervise them until Ctrl-C.
    Start,
    /// Show stored sessions and recent logouts.
    Status,
    /// Delete the stored credentials of a session.
    Forget {
        /// The session id to forget.
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_logging(&cfg.zap)?;

    match cli.command {
        Commands::Start => start(cfg).await?,
        Commands::Status => {
            let store = Store::new(&cfg.store).await?;
            println!("zap — Status\n");
            println!("Config: {}", cli.config);
            println!("Database: {}", shellexpand(&cfg.store.db_path));
            println!();

            let records = store.list().await?;
            if records.is_empty() {
                println!("  no stored sessions");
            }
            for record in records {
                println!(
                    "  {}: paired, credentials updated {}",
                    record.session_id,
                    record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }

            let logouts = store.recent_logouts(10).await?;
            if !logouts.is_empty() {
                println!("\nRecent logouts:");
                for (session_id, at) in logouts {
                    println!("  {session_id} at {at}");
                }
            }
        }
        Commands::Forget { session_id } => {
            if session_id.trim().is_empty() {
                anyhow::bail!("no session id provided. Usage: zap forget <session_id>");
            }
            let store = Store::new(&cfg.store).await?;
            store.clear(&session_id).await?;
            println!("Forgot credentials for session '{session_id}'.");
        }
    }

    Ok(())
}

/// Log to stderr (filtered by `RUST_LOG`, else `zap.log_level`) and to a
/// daily file under `{data_dir}/logs`.
fn init_logging(cfg: &config::ZapConfig) -> anyhow::Result<WorkerGuard> {
    let log_dir = std::path::PathBuf::from(shellexpand(&cfg.data_dir)).join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "zap.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

async fn start(cfg: config::Config) -> anyhow::Result<()> {
    if cfg.session.autostart.is_empty() {
        anyhow::bail!(
            "No sessions to start. List session ids under [session] autostart in the config file."
        );
    }

    let store = Arc::new(Store::new(&cfg.store).await?);
    let factory = Arc::new(BridgeTransportFactory::from_config(&cfg.bridge));
    let registry = Registry::with_journal(
        factory,
        store.clone(),
        store,
        SessionPolicy::from(&cfg.session),
    );

    println!("zap — Starting sessions...");
    for session_id in &cfg.session.autostart {
        match registry.initialize(session_id).await {
            Ok(handle) => info!("session {session_id} started ({})", handle.state()),
            Err(e) => warn!("session {session_id} failed to start: {e}"),
        }
    }

    if registry.session_ids().await.is_empty() {
        anyhow::bail!("no session could be started");
    }

    let watcher = tokio::spawn(print_qr_codes(registry.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    watcher.abort();
    registry.shutdown().await;
    Ok(())
}

/// Print each new pairing code once, for every registered session.
async fn print_qr_codes(registry: Registry) {
    let mut shown: HashMap<String, String> = HashMap::new();
    let mut interval = tokio::time::interval(QR_POLL_INTERVAL);
    loop {
        interval.tick().await;
        for session_id in registry.session_ids().await {
            let Ok(code) = registry.get_qr(&session_id).await else {
                continue;
            };
            if code.is_empty() || shown.get(&session_id) == Some(&code) {
                continue;
            }
            println!("\nScan to pair session '{session_id}':\n{code}\n");
            shown.insert(session_id, code);
        }
    }
}
