// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Pit Boss Agent - standalone daemon around one grill controller
//!
//! The agent wires a `pitboss-core` controller to the simplest possible
//! host: configuration comes from environment variables, state updates go
//! to stdout as JSON lines, and device fields live in memory for the
//! lifetime of the process.
//!
//! ```text
//! ┌──────────────┐    poll      ┌──────────────┐   JSON lines   ┌──────────────┐
//! │  Pit Boss    │ <────────────│  Controller  │ ──────────────>│  stdout /    │
//! │  grill (LAN) │   (HTTP)     │  (core)      │                │  supervisor  │
//! └──────────────┘              └──────────────┘                └──────────────┘
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pitboss_core::{
    auth::AuthCache,
    config::Preferences,
    discovery::RediscoveryService,
    fields::MemoryFieldStore,
    http::HttpClient,
    rpc::GrillClient,
    GrillController,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pitboss-agent")]
#[command(about = "LAN controller daemon for a Pit Boss WiFi pellet grill", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Agent configuration, loaded from `PITBOSS_`-prefixed env variables.
#[derive(Debug, Clone, Deserialize)]
struct AgentConfig {
    /// Identifier used in emitted state updates.
    #[serde(default = "default_device_id")]
    device_id: String,

    /// Grill IP, or "auto" to rely on discovery.
    #[serde(default = "default_auto")]
    ip_address: String,

    /// Hub/host IP whose /24 is swept during rediscovery.
    #[serde(default)]
    hub_ip: String,

    /// Health-check cadence in seconds.
    #[serde(default = "default_refresh_interval")]
    refresh_interval: u64,

    /// Whether a lost grill may be searched for on the subnet.
    #[serde(default = "default_true")]
    auto_rediscovery: bool,

    /// Keep scanning past non-matching Pit Boss devices.
    #[serde(default = "default_true")]
    scan_continue: bool,
}

fn default_device_id() -> String {
    "pitboss-grill".to_string()
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("PITBOSS_")
            .from_env()
            .context("failed to parse PITBOSS_* environment variables")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let prefs = self.preferences();
        if prefs.ip_is_auto() && self.hub_ip.trim().is_empty() {
            anyhow::bail!("PITBOSS_IP_ADDRESS is auto, so PITBOSS_HUB_IP is required for discovery");
        }
        prefs
            .validate()
            .context("invalid PITBOSS_* preference values")?;
        Ok(())
    }

    fn preferences(&self) -> Preferences {
        Preferences {
            ip_address: self.ip_address.clone(),
            hub_ip: self.hub_ip.clone(),
            refresh_interval: self.refresh_interval,
            auto_rediscovery: self.auto_rediscovery,
            scan_continue: self.scan_continue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Pit Boss Agent v{}", env!("CARGO_PKG_VERSION"));

    info!("Loading configuration from environment variables");
    let config = AgentConfig::from_env()?;
    info!("Device id: {}", config.device_id);
    info!("Grill IP: {}", config.ip_address);
    info!("Refresh interval: {}s", config.refresh_interval);

    let http = HttpClient::new().context("failed to build HTTP client")?;
    let auth = Arc::new(AuthCache::new(http.clone()));
    let client = GrillClient::new(http, Arc::clone(&auth));
    let rediscovery = Arc::new(RediscoveryService::new(auth).context("failed to build rediscovery")?);
    let fields = Arc::new(MemoryFieldStore::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = GrillController::new(
        config.device_id.clone(),
        fields,
        client,
        rediscovery,
        config.preferences(),
        tx,
    );

    // Relay state updates to stdout as JSON lines.
    let relay = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match serde_json::to_string(&update) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("failed to serialize state update: {}", e),
            }
        }
    });

    controller.init().await.context("controller init failed")?;
    info!("Controller running; Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    controller.remove().await;
    relay.abort();
    info!("Agent shut down gracefully");
    Ok(())
}
