use crate::meter_session::SessionSettings;
use clap::{Parser, ValueEnum};
use std::time::Duration;

pub const DEFAULT_SERVICEBASE: &str = "com.victronenergy.grid";

/// What happens when a registered device's advertisement disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemovalPolicy {
    /// Stop the whole bridge with a non-zero exit code.
    Exit,
    /// Stop only that device's session.
    Teardown,
}

#[derive(Parser, Debug)]
#[command(name = "homewizard_bridge")]
#[command(about = "Publishes HomeWizard P1 meter readings as a grid meter service")]
#[command(version)]
pub struct Args {
    /// Meter host (`ip` or `ip:port`). Without it, meters are discovered via mDNS.
    pub host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Base service name on the bus
    #[arg(long, env = "HOMEWIZARD_SERVICEBASE", default_value = DEFAULT_SERVICEBASE)]
    pub servicebase: String,

    /// Poll period in milliseconds
    #[arg(long, env = "HOMEWIZARD_POLL_INTERVAL_MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_ms: u64,

    /// Timeout for every HTTP request to the meter, in milliseconds
    #[arg(long, env = "HOMEWIZARD_HTTP_TIMEOUT_MS", default_value_t = 2000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub http_timeout_ms: u64,

    /// Upper bound for the delay between polls of a failing meter, in seconds
    #[arg(long, env = "HOMEWIZARD_MAX_BACKOFF_SECS", default_value_t = 30)]
    pub max_backoff_secs: u64,

    /// Reaction to a discovered meter going away
    #[arg(long, env = "HOMEWIZARD_ON_REMOVED", value_enum, default_value_t = RemovalPolicy::Exit)]
    pub on_removed: RemovalPolicy,

    /// Publish to this MQTT broker instead of logging publications
    #[arg(long, env = "HOMEWIZARD_MQTT_HOST")]
    pub mqtt_host: Option<String>,

    #[arg(long, env = "HOMEWIZARD_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Static host; `None` selects discovery mode.
    pub host: Option<String>,
    pub servicebase: String,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub max_backoff: Duration,
    pub removal_policy: RemovalPolicy,
    pub mqtt: Option<MqttConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: None,
            servicebase: DEFAULT_SERVICEBASE.to_string(),
            poll_interval: Duration::from_secs(1),
            http_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            removal_policy: RemovalPolicy::Exit,
            mqtt: None,
        }
    }
}

impl From<Args> for BridgeConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            servicebase: args.servicebase,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            http_timeout: Duration::from_millis(args.http_timeout_ms),
            max_backoff: Duration::from_secs(args.max_backoff_secs),
            removal_policy: args.on_removed,
            mqtt: args.mqtt_host.map(|host| MqttConfig {
                host,
                port: args.mqtt_port,
            }),
        }
    }
}

impl BridgeConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            servicebase: self.servicebase.clone(),
            poll_interval: self.poll_interval,
            max_backoff: self.max_backoff,
        }
    }
}
