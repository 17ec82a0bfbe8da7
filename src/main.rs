//! AMQP Math Connector - command line harness
//!
//! Listens on the configured topics or pushes test messages through the
//! connector against a real broker.

use amqp_math_connector::config::BridgeConfig;
use amqp_math_connector::observability::init_env_logging;
use amqp_math_connector::{Connector, MessageReceivedEvent};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: &[&str] = &["connector.toml", "config/connector.toml"];

/// Resilient AMQP publish/subscribe bridge
#[derive(Parser)]
#[command(name = "amqp-math-connector")]
#[command(about = "Publish to and listen on an AMQP topic exchange")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every message received on the configured topics until Ctrl-C
    Listen {
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
    /// Queue messages on a topic and wait until they are published
    Send {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long)]
        message: String,

        /// Number of copies to send, numbered when greater than one
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Give up waiting for the queue to drain after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Validate the configuration file
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Pretty,
    Compact,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_env_logging(verbosity_level(cli.verbose));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { format } => run_listen(config, format).await,
        Commands::Send {
            topic,
            message,
            count,
            timeout_secs,
        } => run_send(config, topic, message, count, Duration::from_secs(timeout_secs)).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// `-v` raises the level; everything else comes from the environment
fn verbosity_level(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create one of {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )
    .into())
}

async fn run_listen(
    config: BridgeConfig,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.connector.topics.is_empty() {
        return Err("connector.topics is empty, nothing to listen on".into());
    }

    let connector = Connector::from_config(&config)?;
    for topic in connector.topics() {
        connector
            .notifier(topic)?
            .add_listener(move |event| {
                println!("{}", render_event(event, format));
                Ok(())
            });
    }

    info!(
        topics = ?connector.topics().collect::<Vec<_>>(),
        "Listening, press Ctrl-C to stop"
    );

    signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    connector.close();
    connector.wait_closed().await;

    let status = connector.status();
    info!(
        delivery_failures = status.delivery_failures,
        connections_lost = status.connections_lost,
        "Listener stopped"
    );
    Ok(())
}

async fn run_send(
    config: BridgeConfig,
    topic: String,
    message: String,
    count: u32,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let connector = Connector::from_config(&config)?;

    for index in 1..=count {
        let payload = if count > 1 {
            format!("{message} #{index}")
        } else {
            message.clone()
        };
        connector.send_message(&topic, payload)?;
    }

    let poll = config.driver_settings().tick_interval;
    let deadline = Instant::now() + timeout;
    let drained = loop {
        if connector.status().queued_messages == 0 {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        tokio::select! {
            _ = sleep(poll) => {}
            _ = signal::ctrl_c() => break false,
        }
    };

    connector.close();
    connector.wait_closed().await;

    let status = connector.status();
    if drained {
        info!(published = status.messages_published, topic = %topic, "All messages sent");
        Ok(())
    } else {
        warn!(
            published = status.messages_published,
            unsent = status.queued_messages,
            "Stopped before the queue drained"
        );
        Err(format!("{} message(s) were not sent", status.queued_messages).into())
    }
}

fn handle_config_command(
    config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Resolving the endpoint also checks password_env and the URL
    config.connection_config()?.url()?;
    println!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    Ok(())
}

fn render_event(event: &MessageReceivedEvent, format: OutputFormat) -> String {
    let payload = String::from_utf8_lossy(&event.payload);
    let timestamp = Utc::now();

    match format {
        OutputFormat::Pretty => format!(
            "[{}] {} (routing key {})\n  {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.topic,
            event.routing_key,
            payload
        ),
        OutputFormat::Compact => format!("{} {}", event.routing_key, payload),
        OutputFormat::Json => serde_json::json!({
            "timestamp": timestamp.to_rfc3339(),
            "topic": event.topic,
            "routing_key": event.routing_key,
            "payload": payload,
        })
        .to_string(),
    }
}
