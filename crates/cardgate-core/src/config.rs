//! Gateway configuration.
//!
//! All settings are read from one TOML file. Every field carries a serde
//! default so that a minimal file (or none at all) still yields a usable
//! configuration.
//!
//! ```toml
//! state_dir = "data/devices"
//!
//! [subscriptions]
//! event_to_host = "192.168.178.20"
//! maintenance_interval_secs = 180
//!
//! [[devices]]
//! host = "192.168.178.42"
//! port = 8585
//! relay_endpoint = "wss://relay.example.org/websocket/80276883662000004801"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Topic the gateway subscribes to on every device.
    pub const TOPIC: &str = "CARD/INSERTED";
    /// Default protocol listener port.
    pub const PORT: u16 = 8585;
    pub const BIND_HOST: &str = "0.0.0.0";
    pub const CONNECTOR_HOST: &str = "127.0.0.1";
    pub const RELAY_ENDPOINT: &str = "wss://relay.cardgate.local:8444/websocket";
    pub const CONFIG_PATH: &str = "config/cardgate.toml";
    pub const STATE_DIR: &str = "data/devices";

    pub const MAINTENANCE_INTERVAL_SECS: u64 = 180;
    pub const INITIAL_DELAY_SECS: u64 = 5;
    pub const RETRY_BUDGET_MS: u64 = 10_000;
    pub const RETRY_DELAY_MS: u64 = 200;
    /// Twelve hours.
    pub const FORCE_RESUBSCRIBE_PERIOD_SECS: u64 = 43_200;
    /// Ten minutes.
    pub const RENEWAL_SAFE_PERIOD_MS: u64 = 600_000;

    pub const DISPATCH_QUEUE_CAPACITY: usize = 64;
    pub const DISPATCH_WORKERS: usize = 1;
    pub const SHUTDOWN_GRACE_SECS: u64 = 5;
    pub const HTTP_TIMEOUT_SECS: u64 = 30;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "CARDGATE_CONFIG";
    pub const LOG_JSON: &str = "CARDGATE_LOG_JSON";
    pub const EVENT_TO_HOST: &str = "CARDGATE_EVENT_TO_HOST";

    /// Config path from the environment, if set.
    pub fn config_path() -> Option<String> {
        std::env::var(CONFIG).ok().filter(|s| !s.is_empty())
    }

    /// Whether JSON logging was requested.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false)
    }

    /// Callback host override.
    pub fn event_to_host() -> Option<String> {
        std::env::var(EVENT_TO_HOST).ok().filter(|s| !s.is_empty())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root directory for per-device subscription state
    pub state_dir: Option<PathBuf>,
    pub subscriptions: SubscriptionSettings,
    pub listener: ListenerSettings,
    pub tls: TlsSettings,
    pub relay: RelaySettings,
    pub prescriptions: PrescriptionSettings,
    pub backend: BackendSettings,
    pub connector: ConnectorSettings,
    pub devices: Vec<DeviceSection>,
}

/// Subscription maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Fallback callback host when no local address shares the device subnet
    #[serde(default)]
    pub event_to_host: Option<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    /// Total time a failing renewal may be retried within one tick
    #[serde(default = "default_retry_budget")]
    pub retry_budget_ms: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Subscriptions older than this are replaced even when still valid
    #[serde(default = "default_force_resubscribe_period")]
    pub force_resubscribe_period_secs: u64,
    /// Renew when the newest subscription expires within this window
    #[serde(default = "default_renewal_safe_period")]
    pub renewal_safe_period_ms: u64,
}

fn default_topic() -> String {
    defaults::TOPIC.to_string()
}
fn default_maintenance_interval() -> u64 {
    defaults::MAINTENANCE_INTERVAL_SECS
}
fn default_initial_delay() -> u64 {
    defaults::INITIAL_DELAY_SECS
}
fn default_retry_budget() -> u64 {
    defaults::RETRY_BUDGET_MS
}
fn default_retry_delay() -> u64 {
    defaults::RETRY_DELAY_MS
}
fn default_force_resubscribe_period() -> u64 {
    defaults::FORCE_RESUBSCRIBE_PERIOD_SECS
}
fn default_renewal_safe_period() -> u64 {
    defaults::RENEWAL_SAFE_PERIOD_MS
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            event_to_host: None,
            topic: default_topic(),
            maintenance_interval_secs: default_maintenance_interval(),
            initial_delay_secs: default_initial_delay(),
            retry_budget_ms: default_retry_budget(),
            retry_delay_ms: default_retry_delay(),
            force_resubscribe_period_secs: default_force_resubscribe_period(),
            renewal_safe_period_ms: default_renewal_safe_period(),
        }
    }
}

impl SubscriptionSettings {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn force_resubscribe_period(&self) -> Duration {
        Duration::from_secs(self.force_resubscribe_period_secs)
    }

    pub fn renewal_safe_period(&self) -> Duration {
        Duration::from_millis(self.renewal_safe_period_ms)
    }
}

/// Protocol listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Decoded events waiting for a dispatch worker, per device
    #[serde(default = "default_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_bind_host() -> String {
    defaults::BIND_HOST.to_string()
}
fn default_port() -> u16 {
    defaults::PORT
}
fn default_queue_capacity() -> usize {
    defaults::DISPATCH_QUEUE_CAPACITY
}
fn default_dispatch_workers() -> usize {
    defaults::DISPATCH_WORKERS
}
fn default_shutdown_grace() -> u64 {
    defaults::SHUTDOWN_GRACE_SECS
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            default_port: default_port(),
            dispatch_queue_capacity: default_queue_capacity(),
            dispatch_workers: default_dispatch_workers(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ListenerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Shared default server identity (PEM files).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Cloud relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_relay_endpoint")]
    pub default_endpoint: String,
}

fn default_relay_endpoint() -> String {
    defaults::RELAY_ENDPOINT.to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_endpoint: default_relay_endpoint(),
        }
    }
}

/// Prescription gateway bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionSettings {
    #[serde(default)]
    pub bridge_url: Option<String>,
    /// Pharmacy card handle; the bridge picks one when absent
    #[serde(default)]
    pub pharmacy_handle: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    defaults::HTTP_TIMEOUT_SECS
}

impl Default for PrescriptionSettings {
    fn default() -> Self {
        Self {
            bridge_url: None,
            pharmacy_handle: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Subscription backend client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Device used when no `[[devices]]` entry is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSettings {
    #[serde(default = "default_connector_host")]
    pub host: String,
}

fn default_connector_host() -> String {
    defaults::CONNECTOR_HOST.to_string()
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            host: default_connector_host(),
        }
    }
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of the device's service endpoint, `https://<host>` when absent
    #[serde(default)]
    pub connector_url: Option<String>,
    #[serde(default)]
    pub relay_endpoint: Option<String>,
    /// Per-device server certificate, overrides `[tls]`
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl DeviceSection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connector_url: None,
            relay_endpoint: None,
            tls_cert_path: None,
            tls_key_path: None,
            state_dir: None,
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded gateway configuration");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: GatewayConfig = toml::from_str(raw)?;
        if let Some(host) = env_vars::event_to_host() {
            debug!(host = %host, "Callback host overridden from environment");
            config.subscriptions.event_to_host = Some(host);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would produce colliding listeners.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.host.trim().is_empty() {
                return Err(Error::Validation("device host must not be empty".into()));
            }
            if device.port == 0 {
                return Err(Error::Validation(format!(
                    "device {} has port 0",
                    device.host
                )));
            }
            if !seen.insert((device.host.clone(), device.port)) {
                return Err(Error::Validation(format!(
                    "duplicate device {}:{}",
                    device.host, device.port
                )));
            }
        }
        if self.listener.dispatch_workers == 0 {
            return Err(Error::Validation("dispatch_workers must be at least 1".into()));
        }
        if self.listener.dispatch_queue_capacity == 0 {
            return Err(Error::Validation(
                "dispatch_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Configured devices, or one default device when none are listed.
    pub fn device_sections(&self) -> Vec<DeviceSection> {
        if self.devices.is_empty() {
            vec![DeviceSection::new(
                self.connector.host.clone(),
                self.listener.default_port,
            )]
        } else {
            self.devices.clone()
        }
    }

    /// Root directory for persisted subscription state.
    pub fn state_root(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::STATE_DIR))
    }

    /// State directory of one device.
    pub fn device_state_dir(&self, device: &DeviceSection) -> PathBuf {
        device
            .state_dir
            .clone()
            .unwrap_or_else(|| self.state_root().join(format!("{}-{}", device.host, device.port)))
    }

    /// Relay endpoint of one device.
    pub fn device_relay_endpoint(&self, device: &DeviceSection) -> String {
        device
            .relay_endpoint
            .clone()
            .unwrap_or_else(|| self.relay.default_endpoint.clone())
    }

    /// Service base URL of one device.
    pub fn device_connector_url(&self, device: &DeviceSection) -> String {
        device
            .connector_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", device.host))
            .trim_end_matches('/')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config.subscriptions.topic, "CARD/INSERTED");
        assert_eq!(config.listener.default_port, 8585);
        assert_eq!(config.subscriptions.retry_delay(), Duration::from_millis(200));

        let devices = config.device_sections();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].host, "127.0.0.1");
        assert_eq!(devices[0].port, 8585);
    }

    #[test]
    fn test_device_derived_values() {
        let config = GatewayConfig::from_toml(
            r#"
            state_dir = "/var/lib/cardgate"

            [relay]
            default_endpoint = "wss://relay.example.org/ws"

            [[devices]]
            host = "192.168.178.42"
            port = 8586
            connector_url = "https://192.168.178.42:443/"
            "#,
        )
        .unwrap();

        let device = &config.device_sections()[0];
        assert_eq!(
            config.device_state_dir(device),
            PathBuf::from("/var/lib/cardgate/192.168.178.42-8586")
        );
        assert_eq!(
            config.device_relay_endpoint(device),
            "wss://relay.example.org/ws"
        );
        assert_eq!(
            config.device_connector_url(device),
            "https://192.168.178.42:443"
        );
    }

    #[test]
    fn test_same_host_different_ports_allowed() {
        let config = GatewayConfig::from_toml(
            r#"
            [[devices]]
            host = "192.168.178.42"
            port = 8585

            [[devices]]
            host = "192.168.178.42"
            port = 8586
            "#,
        )
        .unwrap();
        assert_eq!(config.device_sections().len(), 2);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let result = GatewayConfig::from_toml(
            r#"
            [[devices]]
            host = "192.168.178.42"

            [[devices]]
            host = "192.168.178.42"
            "#,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = GatewayConfig::from_toml("[[devices]\nhost=");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
