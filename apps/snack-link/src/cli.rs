use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snack_link::capability::CapabilityTable;
use snack_link::channel::resolve_channel;
use snack_link::collaborators::HttpModuleResolver;
use snack_link::config::Config;
use snack_link::session::{Collaborators, Session, SessionConfig, SessionEvent, SessionEventKind};
use snack_link::telemetry::logging::{LogLevel, LogRotation};
use snack_link::transport::{ConnectionStatus, TransportResources};
use snack_proto::{META_NAME, META_PLATFORM};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "snack-link")]
#[command(about = "Inspect and follow live code-editing sessions")]
pub struct Cli {
    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Start a new log file every hour or day (with --log-file)
    #[arg(long, value_enum, default_value_t = LogRotation::Never, global = true)]
    pub log_rotation: LogRotation,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the channel descriptor derived from an experience address
    Resolve { address: String },

    /// Print the protocol features a runtime version supports
    Features {
        version: String,

        /// Capability table JSON replacing the built-in one
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Join a session on the relay and log device changes until Ctrl-C
    Watch {
        address: String,

        /// Relay endpoint group (`staging`, `canary`, `production`)
        #[arg(long)]
        test_transport: Option<String>,

        /// Use the canary relay
        #[arg(long)]
        experimental: bool,
    },
}

pub fn resolve(address: &str) -> Result<()> {
    let descriptor = resolve_channel(address)?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

pub fn features(version: &str, table: Option<&PathBuf>) -> Result<()> {
    let table = match table {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading capability table {}", path.display()))?;
            CapabilityTable::from_json(&raw)?
        }
        None => CapabilityTable::builtin(),
    };
    let features: Vec<String> = table.get_feature_set(version).into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&features)?);
    Ok(())
}

pub async fn watch(
    config: &Config,
    address: &str,
    test_transport: Option<String>,
    experimental: bool,
) -> Result<()> {
    let device_id = format!("snack-link-{}", uuid::Uuid::new_v4());
    let mut transport = config.transport_config(address, &device_id);
    transport.test_transport = test_transport;
    transport.experimental_endpoint_override = experimental;
    transport.metadata.insert(META_NAME.into(), "snack-link".into());
    transport.metadata.insert(META_PLATFORM.into(), "cli".into());

    let resolver = HttpModuleResolver::new(&config.bundler_url)
        .with_context(|| format!("invalid bundler url {}", config.bundler_url))?;
    let session = Session::open(
        SessionConfig::new(transport).with_presence_grace(config.presence_grace),
        TransportResources::default(),
        Collaborators::new(Arc::new(resolver)),
    )?;

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    for kind in [
        SessionEventKind::DevicesChanged,
        SessionEventKind::Message,
        SessionEventKind::Status,
    ] {
        let status_tx = status_tx.clone();
        session.add_listener(
            kind,
            Arc::new(move |event: &SessionEvent| match event {
                SessionEvent::DevicesChanged(devices) => {
                    let summary: Vec<String> = devices
                        .values()
                        .map(|device| {
                            format!(
                                "{} ({:?}, {})",
                                device.id,
                                device.status,
                                device.version.as_deref().unwrap_or("unknown")
                            )
                        })
                        .collect();
                    println!("devices: [{}]", summary.join(", "));
                }
                SessionEvent::Message { device_id, message } => {
                    println!("{device_id}: {} {}", message.kind.as_str(), message.payload);
                }
                SessionEvent::Status(status) => {
                    println!("status: {status:?}");
                    let _ = status_tx.send(*status);
                }
                SessionEvent::Diagnostic(_) => {}
            }),
        );
    }

    println!("watching channel {}", session.channel_id());
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    session.stop();
    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(status) = status_rx.recv().await {
            if status == ConnectionStatus::Stopped {
                break;
            }
        }
    })
    .await;
    if stopped.is_err() {
        tracing::warn!(target = "snack::cli", "transport did not confirm stop");
    }
    Ok(())
}
