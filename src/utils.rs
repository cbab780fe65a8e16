use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};

/// Install the fmt subscriber. `RUST_LOG` overrides the configured level.
pub fn initialize_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    // A subscriber may already be installed (tests, embedding applications)
    let _ = match config.output.as_str() {
        "stderr" => builder.with_writer(std::io::stderr).try_init(),
        _ => builder.try_init(),
    };
}

/// Log what the connector is about to run
pub fn display_startup_info(config: &Config) {
    info!("🚀 Starting {} v{}", config.service.name, config.service.version);
    info!(
        "🗄️ Broker: {} partition(s) per new topic, offsets reset to {:?}",
        config.broker.default_partitions, config.broker.auto_offset_reset
    );
    info!(
        "🎧 {} listener(s) on {:?}, ack mode {:?}",
        config.listeners.len(),
        config.get_all_listener_topics(),
        config.consumers.ack_mode
    );
    if !config.jobs.is_empty() {
        let mut jobs: Vec<&String> = config.jobs.keys().collect();
        jobs.sort();
        info!("📅 Jobs: {:?}", jobs);
    }
    if config.http.enabled {
        info!("🌐 HTTP entrypoint on {}", config.http.bind);
    }
}

/// Setup signal handlers for graceful shutdown
pub async fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM - initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT (Ctrl+C) - initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("📡 Received Ctrl+C - initiating graceful shutdown");
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    }
}
