//! Remote subscription calls against a device.
//!
//! The device's event service is reached through [`SubscriptionBackendClient`].
//! A call either fails outright ([`BackendError`], transport or protocol
//! fault) or returns a [`Status`] that may carry a [`RemoteError`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::DeviceConfig;

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Faults raised by the backend client.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request did not reach the device or no response arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with a failure status code.
    #[error("Remote error (HTTP {status}): {body}")]
    Remote { status: u16, body: String },

    /// The response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// A subscription registered on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    /// Callback address the device pushes to
    pub event_to: String,
    pub topic: String,
    pub termination_time: DateTime<Utc>,
}

/// One entry of a remote error trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrace {
    pub code: i64,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Error part of a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub trace: Vec<ErrorTrace>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let traces = self
            .trace
            .iter()
            .map(|t| {
                format!(
                    "Code={} ErrorText={} Detail={}",
                    t.code,
                    t.error_text,
                    t.detail.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "[{}] device ERROR at {}: {}",
            self.message_id,
            self.timestamp.as_deref().unwrap_or("-"),
            traces
        )
    }
}

/// Outcome status of a remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl Status {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            error: None,
        }
    }

    pub fn failed(result: impl Into<String>, error: RemoteError) -> Self {
        Self {
            result: result.into(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Response of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub status: Status,
    #[serde(rename = "subscriptionID", default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub termination_time: Option<DateTime<Utc>>,
}

/// Response of a renew call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewResponse {
    pub status: Status,
    #[serde(rename = "subscriptionID", default)]
    pub subscription_id: Option<String>,
}

/// A card present in one of the device's terminals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfo {
    pub card_handle: String,
    pub card_type: String,
    #[serde(default)]
    pub card_holder_name: Option<String>,
    #[serde(rename = "slotID", default)]
    pub slot_id: Option<String>,
    #[serde(rename = "ctID", default)]
    pub ct_id: Option<String>,
}

/// Event service of a device.
#[async_trait]
pub trait SubscriptionBackendClient: Send + Sync {
    /// All subscriptions currently registered on the device.
    async fn list_subscriptions(&self, device: &DeviceConfig) -> BackendResult<Vec<Subscription>>;

    /// Register a new subscription for `topic`, pushing to `event_to`.
    async fn subscribe(
        &self,
        device: &DeviceConfig,
        event_to: &str,
        topic: &str,
    ) -> BackendResult<SubscribeResponse>;

    /// Extend a subscription. The device may hand out a new id.
    async fn renew(&self, device: &DeviceConfig, subscription_id: &str)
        -> BackendResult<RenewResponse>;

    /// Remove a subscription by id, or all subscriptions for `event_to`.
    async fn unsubscribe(
        &self,
        device: &DeviceConfig,
        subscription_id: Option<&str>,
        event_to: Option<&str>,
        force: bool,
    ) -> BackendResult<Status>;

    /// Cards of one type currently inserted in the device's terminals.
    async fn get_cards(&self, device: &DeviceConfig, card_type: &str)
        -> BackendResult<Vec<CardInfo>>;
}
