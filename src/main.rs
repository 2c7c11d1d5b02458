//! mqtt-http-bridge entry point
//!
//! Loads the environment, starts the HTTP listener and keeps running until
//! SIGINT/SIGTERM or until the broker connection is given up for good.

use clap::{Parser, Subcommand};
use mqtt_http_bridge::config::{load_env_file, BridgeConfig, DEFAULT_ENV_FILE};
use mqtt_http_bridge::connector::Connector;
use mqtt_http_bridge::error::{BridgeError, BridgeResult};
use mqtt_http_bridge::http;
use mqtt_http_bridge::observability::{init_logging, LogSettings};
use mqtt_http_bridge::transport::mqtt::HealthMonitor;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Relay HTTP publish requests onto an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-http-bridge")]
#[command(version)]
struct Cli {
    /// Environment file loaded before reading configuration
    #[arg(long, value_name = "FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve HTTP and relay publishes (default)
    Run,
    /// Validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

enum ShutdownReason {
    Signal(&'static str),
    BrokerGaveUp,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Env file first so LOG_* variables in it take effect
    let env_file = load_env_file(&cli.env_file);
    init_logging(&LogSettings::from_env().with_verbosity(cli.verbose));

    match env_file {
        Ok(true) => info!(path = %cli.env_file.display(), "Loaded environment file"),
        Ok(false) => debug!(path = %cli.env_file.display(), "No environment file found"),
        Err(e) => warn!(path = %cli.env_file.display(), error = %e, "Ignoring unreadable environment file"),
    }

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e.public_message(), "Command failed");
        process::exit(1);
    }
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.mqtt.broker_url(),
        requested_protocol_level = config.mqtt.protocol_version.level(),
        wire_protocol_level = config.mqtt.protocol_version.wire_level(),
        http_port = config.http.port,
        "Starting mqtt-http-bridge"
    );

    // Broker connection stays lazy until the first publish
    let connector = Connector::from_config(&config.mqtt)?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = http::serve(Arc::clone(&connector), &config.http, async {
        let _ = stop_rx.await;
    });
    tokio::pin!(server);

    let (result, reason) = tokio::select! {
        result = &mut server => (result, None),
        reason = wait_for_shutdown(&connector) => {
            let reason = reason?;
            if let ShutdownReason::Signal(name) = &reason {
                info!(signal = name, "Received signal, shutting down gracefully");
            }
            let _ = stop_tx.send(());
            (server.await, Some(reason))
        }
    };

    connector.shutdown().await;
    result?;

    match reason {
        Some(ShutdownReason::BrokerGaveUp) => Err(BridgeError::internal(
            "MQTT broker permanently unreachable",
        )),
        _ => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Resolve on SIGINT, SIGTERM, or when reconnecting has been abandoned
async fn wait_for_shutdown(connector: &Connector) -> BridgeResult<ShutdownReason> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut state_rx = connector.subscribe_state();

    let gave_up = async move {
        loop {
            if HealthMonitor::is_terminal(&state_rx.borrow_and_update()) {
                return;
            }
            if state_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    Ok(tokio::select! {
        _ = sigint.recv() => ShutdownReason::Signal("SIGINT"),
        _ = sigterm.recv() => ShutdownReason::Signal("SIGTERM"),
        _ = gave_up => {
            error!("MQTT connection permanently lost, shutting down");
            ShutdownReason::BrokerGaveUp
        }
    })
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> BridgeResult<()> {
    if show {
        let rendered =
            toml::to_string_pretty(config).map_err(|e| BridgeError::internal(e.to_string()))?;
        println!("{rendered}");
    }

    info!(broker = %config.mqtt.broker_url(), "Configuration is valid");
    Ok(())
}
