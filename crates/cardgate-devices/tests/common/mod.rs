//! Common test utilities for device tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cardgate_core::SubscriptionSettings;
use cardgate_devices::{
    BackendError, BackendResult, CardInfo, DeviceConfig, DeviceKey, DeviceRegistry, ErrorTrace,
    RemoteError, RenewResponse, Status, SubscribeResponse, Subscription, SubscriptionBackendClient,
    SubscriptionManager, SubscriptionStore,
};
use chrono::{Duration, Utc};
use parking_lot::Mutex;

pub const EVENT_TO_HOST: &str = "10.0.0.5";

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    Subscribe { event_to: String, topic: String },
    Renew(String),
    Unsubscribe {
        subscription_id: Option<String>,
        event_to: Option<String>,
        force: bool,
    },
    Cards(String),
}

/// Backend fake that records every call.
///
/// With `fail` set, every call except listing answers with an error status.
/// With `unreachable` set, they fail in transport instead; `list_unreachable`
/// does the same for listing.
#[derive(Default)]
pub struct RecordingBackend {
    subscriptions: Mutex<Vec<Subscription>>,
    calls: Mutex<Vec<Call>>,
    fail: bool,
    unreachable: bool,
    list_unreachable: bool,
    renew_changes_id: bool,
    next_id: AtomicUsize,
}

impl RecordingBackend {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions: Mutex::new(subscriptions),
            ..Default::default()
        }
    }

    pub fn failing(subscriptions: Vec<Subscription>) -> Self {
        Self {
            fail: true,
            ..Self::new(subscriptions)
        }
    }

    pub fn unreachable(subscriptions: Vec<Subscription>) -> Self {
        Self {
            unreachable: true,
            ..Self::new(subscriptions)
        }
    }

    pub fn list_unreachable() -> Self {
        Self {
            list_unreachable: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn renewing_with_new_id(subscriptions: Vec<Subscription>) -> Self {
        Self {
            renew_changes_id: true,
            ..Self::new(subscriptions)
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Subscribe { .. }))
    }

    pub fn renew_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Renew(_)))
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Unsubscribe { .. }))
    }

    pub fn unsubscribed_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Unsubscribe {
                    subscription_id, ..
                } => subscription_id.clone(),
                _ => None,
            })
            .collect()
    }

    fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn reachable(&self) -> BackendResult<()> {
        if self.unreachable {
            Err(BackendError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn status(&self) -> Status {
        if self.fail {
            Status::failed("ERROR", remote_error(4203))
        } else {
            Status::ok("OK")
        }
    }
}

pub fn remote_error(code: i64) -> RemoteError {
    RemoteError {
        message_id: "a1b2c3".to_string(),
        code: Some(code),
        timestamp: Some("2024-06-30T14:30:00Z".to_string()),
        trace: vec![ErrorTrace {
            code,
            error_text: "Operation failed".to_string(),
            detail: None,
        }],
    }
}

#[async_trait]
impl SubscriptionBackendClient for RecordingBackend {
    async fn list_subscriptions(&self, _device: &DeviceConfig) -> BackendResult<Vec<Subscription>> {
        self.record(Call::List);
        if self.list_unreachable {
            return Err(BackendError::Transport("connection refused".to_string()));
        }
        Ok(self.subscriptions.lock().clone())
    }

    async fn subscribe(
        &self,
        _device: &DeviceConfig,
        event_to: &str,
        topic: &str,
    ) -> BackendResult<SubscribeResponse> {
        self.record(Call::Subscribe {
            event_to: event_to.to_string(),
            topic: topic.to_string(),
        });
        self.reachable()?;
        let status = self.status();
        let (subscription_id, termination_time) = if status.is_ok() {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            (
                Some(format!("new-sub-{}", n)),
                Some(Utc::now() + Duration::hours(1)),
            )
        } else {
            (None, None)
        };
        Ok(SubscribeResponse {
            status,
            subscription_id,
            termination_time,
        })
    }

    async fn renew(
        &self,
        _device: &DeviceConfig,
        subscription_id: &str,
    ) -> BackendResult<RenewResponse> {
        self.record(Call::Renew(subscription_id.to_string()));
        self.reachable()?;
        let renewed = if self.renew_changes_id {
            format!("{}-renewed", subscription_id)
        } else {
            subscription_id.to_string()
        };
        Ok(RenewResponse {
            status: self.status(),
            subscription_id: Some(renewed),
        })
    }

    async fn unsubscribe(
        &self,
        _device: &DeviceConfig,
        subscription_id: Option<&str>,
        event_to: Option<&str>,
        force: bool,
    ) -> BackendResult<Status> {
        self.record(Call::Unsubscribe {
            subscription_id: subscription_id.map(str::to_string),
            event_to: event_to.map(str::to_string),
            force,
        });
        self.reachable()?;
        Ok(self.status())
    }

    async fn get_cards(
        &self,
        _device: &DeviceConfig,
        card_type: &str,
    ) -> BackendResult<Vec<CardInfo>> {
        self.record(Call::Cards(card_type.to_string()));
        self.reachable()?;
        Ok(vec![CardInfo {
            card_handle: "SMC-B-17".to_string(),
            card_type: card_type.to_string(),
            card_holder_name: Some("Apotheke am Markt".to_string()),
            slot_id: Some("3".to_string()),
            ct_id: Some("CT1".to_string()),
        }])
    }
}

/// A subscription pointing at [`EVENT_TO_HOST`] that terminates `minutes`
/// from now (negative for already expired).
pub fn subscription(id: &str, minutes: i64) -> Subscription {
    Subscription {
        subscription_id: id.to_string(),
        event_to: format!("cetp://{}:8585", EVENT_TO_HOST),
        topic: "CARD/INSERTED".to_string(),
        termination_time: Utc::now() + Duration::minutes(minutes),
    }
}

pub fn device(dir: &Path, host: &str, port: u16) -> DeviceConfig {
    DeviceConfig::new(
        DeviceKey::new(host, port),
        format!("https://{}", host),
        "wss://relay.example.org/websocket",
        SubscriptionStore::new(dir.join(format!("{}-{}", host, port))),
    )
}

pub fn manager(
    backend: Arc<RecordingBackend>,
    devices: Vec<DeviceConfig>,
) -> (SubscriptionManager, Arc<DeviceRegistry>) {
    let registry = Arc::new(DeviceRegistry::from_devices(devices).unwrap());
    let manager = SubscriptionManager::new(
        registry.clone(),
        backend,
        SubscriptionSettings::default(),
    );
    (manager, registry)
}
