mod clock;
mod config;
mod ingest;
mod nmea;
mod packet;
mod response;
mod server;
mod shutdown;
mod stats;
mod status;
mod time_protocol;
mod web_server;

use anyhow::{Context, Result};
use clock::{ClockSource, DisciplinedClock};
use config::Config;
use ingest::NmeaIngest;
use server::NtpServer;
use stats::Stats;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time_protocol::TimeServer;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use web_server::WebServer;

/// Délai laissé aux tâches pour s'arrêter avant une sortie forcée
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // Initialiser les logs
    init_logging()?;

    info!("GPS NTP bridge v{}", env!("CARGO_PKG_VERSION"));

    // Charger la configuration
    let config_path = get_config_path();
    let config = load_or_create_config(&config_path)?;

    info!("Configuration:");
    info!("  NMEA feed: {}", config.ingest.address());
    info!("  Require checksum: {}", config.ingest.require_checksum);
    info!("  NTP bind address: {}", config.ntp.bind_address);
    info!("  TIME protocol: {}", config.time_protocol.enabled);
    match config.clock.holdover_secs {
        Some(secs) => info!("  Holdover: {}s", secs),
        None => info!("  Holdover: until next invalid fix"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    match runtime.block_on(run(config)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Server error: {:#}", e);
            Err(e)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let stats = Arc::new(Stats::new());

    // Unique état mutable partagé : créé ici et injecté dans chaque tâche
    let clock = Arc::new(DisciplinedClock::new(config.clock.holdover()));
    let clock_source: Arc<dyn ClockSource> = clock.clone();

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let shutdown_tx = Arc::new(shutdown_tx);
    install_ctrlc_handler(Arc::clone(&shutdown_tx))?;

    let mut tasks = JoinSet::new();

    // Bind avant de démarrer l'ingestion : une erreur d'adresse arrête tout de suite
    let ntp_server = NtpServer::bind(
        &config.ntp.bind_address,
        Arc::clone(&clock_source),
        Arc::clone(&stats),
        config.logging.log_requests,
    )
    .await?;
    tasks.spawn(ntp_server.run(shutdown_rx.clone()));

    if config.time_protocol.enabled {
        let time_server = TimeServer::bind(
            &config.time_protocol.bind_address,
            Arc::clone(&clock_source),
            Arc::clone(&stats),
        )
        .await?;
        tasks.spawn(time_server.run(shutdown_rx.clone()));
    }

    if config.webserver.enabled {
        let web_server = WebServer::new(
            config.webserver.address(),
            Arc::clone(&clock_source),
            Arc::clone(&stats),
        );
        tasks.spawn(web_server.run(shutdown_rx.clone()));
    }

    if config.status.interval_secs > 0 {
        tasks.spawn(status::run(
            Arc::clone(&clock_source),
            Arc::clone(&stats),
            Duration::from_secs(config.status.interval_secs),
            shutdown_rx.clone(),
        ));
    }

    let ingest = NmeaIngest::new(config.ingest.clone(), Arc::clone(&clock), Arc::clone(&stats));
    tasks.spawn(ingest.run(shutdown_rx));

    info!("Press Ctrl+C to stop");

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("Task panicked")
            .and_then(|result| result);

        if let Err(e) = outcome {
            error!("Task failed: {:#}", e);
            // Une tâche en échec arrête les autres
            shutdown_tx.send_replace(true);
            if failure.is_none() {
                failure = Some(e);
            }
        }
    }

    info!("All tasks stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Ctrl+C : premier appui = arrêt propre, second appui = sortie immédiate
fn install_ctrlc_handler(shutdown_tx: Arc<watch::Sender<bool>>) -> Result<()> {
    let presses = AtomicU8::new(0);

    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("Ctrl+C received, shutting down (press again to force)...");
            shutdown_tx.send_replace(true);

            // Forcer la sortie si les tâches ne s'arrêtent pas
            std::thread::spawn(|| {
                std::thread::sleep(SHUTDOWN_GRACE);
                error!("Forced exit (shutdown timeout)");
                std::process::exit(1);
            });
        } else {
            warn!("Forced exit");
            std::process::exit(1);
        }
    })
    .context("Failed to set Ctrl+C handler")
}

/// Initialise le système de logging
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Obtient le chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    // Vérifier les arguments de ligne de commande
    if let Some(path) = std::env::args().nth(1) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/gps-ntp-bridge/config.toml");

    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

/// Charge la configuration ou crée un fichier exemple
fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        info!("Loading configuration from {}", path.display());
        return Config::from_file(path);
    }

    warn!("Configuration file not found: {}", path.display());
    warn!("Creating example configuration...");

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }
    }

    Config::create_example_config(path)
        .context("Failed to create example config")?;

    info!("Example configuration created at {}", path.display());
    info!("Please edit the configuration file and restart the server.");

    Config::from_file(path)
}
