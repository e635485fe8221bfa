//! Core types shared by the cardgate crates.
//!
//! This crate holds the error type and the configuration model. Device
//! handling lives in `cardgate-devices`, the push-event pipeline in
//! `cardgate-events`.

pub mod config;
pub mod error;

pub use config::{
    BackendSettings, ConnectorSettings, DeviceSection, GatewayConfig, ListenerSettings,
    PrescriptionSettings, RelaySettings, SubscriptionSettings, TlsSettings,
};
pub use error::{Error, Result};
