//! Relay session to the cloud backend.
//!
//! Messages travel as a one-element JSON array
//! `[{"type": "<type>", "payload": "<base64 of the JSON payload>"}]`, one
//! text frame per message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Relay message types.
pub mod message_types {
    pub const REGISTER_SMCB: &str = "registerSMCB";
    pub const TOKENS: &str = "eRezeptTokensFromAVS";
    pub const BUNDLES: &str = "eRezeptBundlesFromAVS";
    pub const SENSOR_DATA: &str = "vsdmSensorData";
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Relay session is not open")]
    NotConnected,

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Wrap a payload into the relay envelope.
pub fn encode_envelope(kind: &str, payload: &Value) -> Result<String, RelayError> {
    let payload = serde_json::to_vec(payload).map_err(|e| RelayError::Encode(e.to_string()))?;
    let envelope = json!([{ "type": kind, "payload": STANDARD.encode(payload) }]);
    Ok(envelope.to_string())
}

/// Reverse of [`encode_envelope`].
pub fn decode_envelope(message: &str) -> Result<(String, Value), RelayError> {
    let envelope: Value =
        serde_json::from_str(message).map_err(|e| RelayError::Encode(e.to_string()))?;
    let entry = envelope
        .get(0)
        .ok_or_else(|| RelayError::Encode("empty envelope".to_string()))?;
    let kind = entry["type"]
        .as_str()
        .ok_or_else(|| RelayError::Encode("missing type".to_string()))?
        .to_string();
    let payload = entry["payload"]
        .as_str()
        .ok_or_else(|| RelayError::Encode("missing payload".to_string()))?;
    let raw = STANDARD
        .decode(payload)
        .map_err(|e| RelayError::Encode(e.to_string()))?;
    let payload = serde_json::from_slice(&raw).map_err(|e| RelayError::Encode(e.to_string()))?;
    Ok((kind, payload))
}

/// Shared "relay connected" flag read by health checks.
#[derive(Debug, Clone, Default)]
pub struct RelayHealth {
    connected: Arc<AtomicBool>,
}

impl RelayHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Outbound session to the relay.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Establish the session if it is not open yet.
    async fn open(&self) -> Result<(), RelayError> {
        Ok(())
    }

    fn is_connected(&self) -> bool;

    /// Send one raw text frame.
    async fn send_message(&self, message: String) -> Result<(), RelayError>;

    /// Encode and send one typed message. Failures are logged only.
    async fn send_envelope(&self, kind: &str, payload: &Value) {
        let message = match encode_envelope(kind, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(kind = %kind, "Could not encode relay message: {}", e);
                return;
            }
        };
        if let Err(e) = self.send_message(message).await {
            warn!(kind = %kind, "Could not send relay message: {}", e);
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which relay session is current. Only the current session may clear the
/// health flag.
#[derive(Debug, Clone, Default)]
struct Sessions {
    current: Arc<AtomicU64>,
    health: RelayHealth,
}

impl Sessions {
    fn begin(&self) -> u64 {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.health.set_connected(true);
        generation
    }

    /// Session `generation` is gone; ignored when a newer one started.
    fn end(&self, generation: u64) {
        if self.current.load(Ordering::SeqCst) == generation {
            self.health.set_connected(false);
        }
    }

    /// Retire the current session, whatever its generation.
    fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
        self.health.set_connected(false);
    }
}

/// [`RelayClient`] over a secure WebSocket.
pub struct WebSocketRelay {
    endpoint: String,
    sessions: Sessions,
    sink: Mutex<Option<WsSink>>,
    opening: Mutex<()>,
}

impl WebSocketRelay {
    pub fn new(endpoint: impl Into<String>, health: RelayHealth) -> Self {
        Self {
            endpoint: endpoint.into(),
            sessions: Sessions {
                current: Arc::new(AtomicU64::new(0)),
                health,
            },
            sink: Mutex::new(None),
            opening: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn health(&self) -> &RelayHealth {
        &self.sessions.health
    }
}

#[async_trait]
impl RelayClient for WebSocketRelay {
    /// Connects without holding the send lock, so senders fail fast with
    /// [`RelayError::NotConnected`] while a session is being opened.
    async fn open(&self) -> Result<(), RelayError> {
        let _opening = self.opening.lock().await;
        if self.is_connected() && self.sink.lock().await.is_some() {
            return Ok(());
        }

        info!(endpoint = %self.endpoint, "Opening relay websocket");
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| RelayError::Connection("connect timed out".to_string()))?
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        let (write, mut read) = stream.split();
        *self.sink.lock().await = Some(write);
        let generation = self.sessions.begin();

        let sessions = self.sessions.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => debug!(endpoint = %endpoint, "Relay message: {}", text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(endpoint = %endpoint, "Relay websocket error: {}", e);
                        break;
                    }
                }
            }
            info!(endpoint = %endpoint, generation, "Closing relay websocket");
            sessions.end(generation);
        });

        let register = encode_envelope(message_types::REGISTER_SMCB, &json!({}))?;
        self.send_message(register).await
    }

    fn is_connected(&self) -> bool {
        self.sessions.health.is_connected()
    }

    async fn send_message(&self, message: String) -> Result<(), RelayError> {
        let mut sink = self.sink.lock().await;
        let Some(write) = sink.as_mut() else {
            return Err(RelayError::NotConnected);
        };
        debug!(endpoint = %self.endpoint, "Sending relay message: {}", message);
        if let Err(e) = write.send(Message::Text(message)).await {
            self.sessions.invalidate();
            *sink = None;
            return Err(RelayError::Send(e.to_string()));
        }
        Ok(())
    }
}
