//! Device registry and event subscription lifecycle.
//!
//! ## Architecture
//!
//! - **DeviceRegistry**: every configured device keyed by (host, port), built
//!   once at startup
//! - **SubscriptionBackendClient**: remote subscription calls against a device
//! - **SubscriptionManager**: subscribe / renew / force-resubscribe / drop
//!   decisions and on-demand management
//! - **MaintenanceScheduler**: periodic renewal across all devices
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `http` | ✅ | JSON bridge implementation of the backend client |

pub mod backend;
pub mod callback;
pub mod maintenance;
pub mod registry;
pub mod retry;
pub mod state;
pub mod subscription;

#[cfg(feature = "http")]
pub mod http;

pub use backend::{
    BackendError, BackendResult, CardInfo, ErrorTrace, RemoteError, RenewResponse, Status,
    SubscribeResponse, Subscription, SubscriptionBackendClient,
};
pub use callback::{CallbackAddress, CallbackResolver, SubnetResolver};
pub use maintenance::{MaintenanceScheduler, TickReport};
pub use registry::{BusyGuard, BusyPermit, DeviceConfig, DeviceKey, DeviceRegistry, TlsOverride};
pub use retry::Retrier;
pub use state::{SubscriptionRecord, SubscriptionStore, FAILED};
pub use subscription::SubscriptionManager;

#[cfg(feature = "http")]
pub use http::HttpSubscriptionBackend;
