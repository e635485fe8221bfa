//! Push-event pipeline: listener, decoder, dispatcher and relay.
//!
//! ## Architecture
//!
//! ```text
//! device --TLS--> ListenerGroup --EventCodec--> queue --> EventDispatcher
//!                                                          |         |
//!                                          PrescriptionGateway   RelayClient
//! ```
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `http` | ✅ | JSON bridge implementation of the prescription gateway |

pub mod codec;
pub mod dispatcher;
pub mod event;
pub mod gateway;
pub mod listener;
pub mod relay;
pub mod tls;

#[cfg(feature = "http")]
pub mod http;

pub use codec::{encode_frame, EventCodec, EventParser, JsonEventParser, ProtocolError};
pub use dispatcher::EventDispatcher;
pub use event::{Event, CARD_INSERTED};
pub use gateway::{
    FaultTrace, FetchedPrescriptions, GatewayFault, PrescriptionGateway, VerificationProof,
};
pub use listener::ListenerGroup;
pub use relay::{
    decode_envelope, encode_envelope, message_types, RelayClient, RelayError, RelayHealth,
    WebSocketRelay,
};
pub use tls::{KeystoreProvider, PemKeystore, TlsError};

#[cfg(feature = "http")]
pub use http::HttpPrescriptionGateway;
