//! Device Registry - every configured device, keyed by (host, port)
//!
//! The registry is built once before any other component starts and is
//! immutable afterwards. The only per-device state that changes at runtime
//! is the subscription state and the busy guard, both owned by
//! [`DeviceConfig`].
//!
//! Two devices may share a host; they are told apart by port. Lookups that
//! intentionally address all devices behind a host go through
//! [`DeviceRegistry::find_by_host`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use cardgate_core::{DeviceSection, Error, GatewayConfig, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::state::{SubscriptionRecord, SubscriptionStore};

/// Unique identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey {
    pub host: String,
    /// Port of the protocol listener the device pushes to
    pub port: u16,
}

impl DeviceKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-device server certificate override (PEM files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOverride {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Non-reentrant per-device guard. At most one subscription operation runs
/// per device; callers never wait for it.
#[derive(Debug)]
pub struct BusyGuard {
    semaphore: Semaphore,
}

/// Held while a subscription operation runs, released on drop.
#[derive(Debug)]
pub struct BusyPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl BusyGuard {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    /// Acquire without waiting, `None` if another operation holds the guard.
    pub fn try_acquire(&self) -> Option<BusyPermit<'_>> {
        self.semaphore
            .try_acquire()
            .ok()
            .map(|permit| BusyPermit { _permit: permit })
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for BusyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription state tracked in memory.
#[derive(Debug, Clone)]
struct SubscriptionState {
    subscription_id: Option<String>,
    subscription_time: DateTime<Utc>,
    last_error: Option<String>,
}

/// One configured device.
#[derive(Debug)]
pub struct DeviceConfig {
    key: DeviceKey,
    connector_url: String,
    relay_endpoint: String,
    tls: Option<TlsOverride>,
    store: SubscriptionStore,
    state: RwLock<SubscriptionState>,
    guard: BusyGuard,
}

impl DeviceConfig {
    /// Create a device with no known subscription.
    pub fn new(
        key: DeviceKey,
        connector_url: impl Into<String>,
        relay_endpoint: impl Into<String>,
        store: SubscriptionStore,
    ) -> Self {
        Self {
            key,
            connector_url: connector_url.into(),
            relay_endpoint: relay_endpoint.into(),
            tls: None,
            store,
            state: RwLock::new(SubscriptionState {
                subscription_id: None,
                subscription_time: Utc::now(),
                last_error: None,
            }),
            guard: BusyGuard::new(),
        }
    }

    pub fn with_tls_override(mut self, tls: TlsOverride) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Seed the in-memory state, e.g. from a persisted record.
    pub fn with_record(self, record: SubscriptionRecord) -> Self {
        {
            let mut state = self.state.write();
            state.subscription_id = record.subscription_id;
            state.subscription_time = record.subscription_time;
            state.last_error = record.error;
        }
        self
    }

    /// Build a device from its configuration section and load its persisted
    /// state. An unreadable record is logged and ignored.
    pub fn from_section(config: &GatewayConfig, section: &DeviceSection) -> Result<Self> {
        let key = DeviceKey::new(section.host.clone(), section.port);
        let store = SubscriptionStore::new(config.device_state_dir(section));
        let mut device = Self::new(
            key,
            config.device_connector_url(section),
            config.device_relay_endpoint(section),
            store,
        );

        match (&section.tls_cert_path, &section.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                device = device.with_tls_override(TlsOverride {
                    cert_path: cert_path.clone(),
                    key_path: key_path.clone(),
                });
            }
            (None, None) => {}
            _ => {
                return Err(Error::Validation(format!(
                    "device {}: tls_cert_path and tls_key_path must be set together",
                    device.key
                )));
            }
        }

        match device.store.load() {
            Ok(Some(record)) => {
                debug!(device = %device.key, subscription_id = ?record.subscription_id, "Loaded subscription state");
                device = device.with_record(record);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(device = %device.key, "Ignoring unreadable subscription state: {}", e);
            }
        }
        Ok(device)
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn connector_url(&self) -> &str {
        &self.connector_url
    }

    pub fn relay_endpoint(&self) -> &str {
        &self.relay_endpoint
    }

    pub fn tls_override(&self) -> Option<&TlsOverride> {
        self.tls.as_ref()
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn guard(&self) -> &BusyGuard {
        &self.guard
    }

    pub fn subscription_id(&self) -> Option<String> {
        self.state.read().subscription_id.clone()
    }

    pub fn subscription_time(&self) -> DateTime<Utc> {
        self.state.read().subscription_time
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    /// Record a new subscription id (or failure marker) and persist it.
    ///
    /// Memory is updated first. A failed write is logged and not rolled
    /// back; the next renewal reconciles against the device.
    pub fn record_subscription(
        &self,
        subscription_id: impl Into<String>,
        error: Option<String>,
        subscribed_now: bool,
    ) {
        let record = {
            let mut state = self.state.write();
            state.subscription_id = Some(subscription_id.into());
            state.last_error = error;
            if subscribed_now {
                state.subscription_time = Utc::now();
            }
            SubscriptionRecord {
                subscription_id: state.subscription_id.clone(),
                subscription_time: state.subscription_time,
                error: state.last_error.clone(),
            }
        };
        if let Err(e) = self.store.save(&record) {
            warn!(device = %self.key, "Failed to persist subscription state: {}", e);
        }
    }

    /// Forget the current subscription and remove the persisted record.
    pub fn clear_subscription(&self) {
        {
            let mut state = self.state.write();
            state.subscription_id = None;
            state.last_error = None;
        }
        if let Err(e) = self.store.clear() {
            warn!(device = %self.key, "Failed to remove subscription state: {}", e);
        }
    }
}

/// All configured devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceKey, Arc<DeviceConfig>>,
}

impl DeviceRegistry {
    /// Build a registry from already constructed devices.
    pub fn from_devices(devices: Vec<DeviceConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for device in devices {
            let key = device.key.clone();
            if map.insert(key.clone(), Arc::new(device)).is_some() {
                return Err(Error::Validation(format!("duplicate device {}", key)));
            }
        }
        Ok(Self { devices: map })
    }

    /// Build the registry for every device in the configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let devices = config
            .device_sections()
            .iter()
            .map(|section| DeviceConfig::from_section(config, section))
            .collect::<Result<Vec<_>>>()?;
        let registry = Self::from_devices(devices)?;
        info!(devices = registry.len(), "Device registry initialized");
        Ok(registry)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<Arc<DeviceConfig>> {
        self.devices.get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<DeviceConfig>> {
        self.devices.values().cloned().collect()
    }

    /// Devices whose host contains `host`, or every device for `None`.
    pub fn find_by_host(&self, host: Option<&str>) -> Vec<Arc<DeviceConfig>> {
        match host {
            None => self.all(),
            Some(host) => self
                .devices
                .iter()
                .filter(|(key, _)| key.host.contains(host))
                .map(|(_, device)| device.clone())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
