//! mqttlink - command line entry point
//!
//! Runs a managed MQTT session that logs inbound messages, publishes single
//! messages, or shows the effective configuration.

use clap::{Parser, Subcommand};
use mqttlink::config::ClientConfig;
use mqttlink::error::{sanitize_error_message, ClientResult};
use mqttlink::observability::init_default_logging;
use mqttlink::transport::mqtt::{qos_from_u8, ConnectOutcome, HandlerError, MqttClient, MqttError};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

/// Broker used when neither a file nor `MQTT_BROKER_URL` names one
const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";

/// Default locations searched when no configuration file is given
const DEFAULT_CONFIG_PATHS: &[&str] = &["mqttlink.toml", "config/mqttlink.toml"];

/// Managed MQTT client
#[derive(Parser)]
#[command(name = "mqttlink")]
#[command(about = "Managed MQTT client with wildcard dispatch and automatic reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and log every message matching a pattern
    Run {
        /// Pattern to subscribe to; defaults to topics.inbound
        #[arg(short, long)]
        pattern: Option<String>,
    },
    /// Publish one message and exit
    Publish {
        /// Payload to send
        message: String,
        /// Topic to publish to; defaults to topics.outbound
        #[arg(short, long)]
        topic: Option<String>,
        /// QoS level (0, 1 or 2); defaults to mqtt.qos
        #[arg(short, long)]
        qos: Option<u8>,
        /// Ask the broker to retain the message
        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.sanitized_message());
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { pattern } => run(config, pattern).await,
        Commands::Publish {
            message,
            topic,
            qos,
            retain,
        } => publish(config, message, topic, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&PathBuf>) -> ClientResult<ClientConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    let mut config = ClientConfig::new(DEFAULT_BROKER_URL);
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run(
    config: ClientConfig,
    pattern: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = MqttClient::new(config)?;

    let log_message = |topic: &str, payload: &[u8]| -> Result<(), HandlerError> {
        info!(
            topic,
            bytes = payload.len(),
            "Received: {}",
            String::from_utf8_lossy(payload)
        );
        Ok(())
    };
    match pattern {
        Some(pattern) => client.subscribe(&pattern, log_message, None).await,
        None => client.subscribe_inbound(log_message).await?,
    }

    if client.connect().await == ConnectOutcome::Pending {
        warn!("Broker not reachable yet, retrying in the background");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    client.disconnect().await?;
    info!("Disconnected");
    Ok(())
}

async fn publish(
    config: ClientConfig,
    message: String,
    topic: Option<String>,
    qos: Option<u8>,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = qos.map(qos_from_u8).transpose()?;
    let topic = topic
        .or_else(|| config.topics.outbound.clone())
        .ok_or(MqttError::NoDefaultTopic("outbound"))?;

    let client = MqttClient::new(config)?;
    client.connect().await;

    let result = if retain {
        client.publish_retained(&topic, message, qos).await
    } else {
        client.publish(&topic, message, qos).await
    };

    client.disconnect().await?;
    result?;
    info!("Message published");
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    } else {
        info!("Configuration is valid");
    }

    Ok(())
}
