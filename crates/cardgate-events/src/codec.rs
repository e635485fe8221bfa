//! Protocol decoder: byte stream to [`Event`]s.
//!
//! Frame layout:
//!
//! ```text
//! +------+----------------+------------------+
//! | CETP | length (u32 BE)| body (length B)  |
//! +------+----------------+------------------+
//! ```
//!
//! The body is handed to an [`EventParser`]. A frame with a bad magic or an
//! oversized length triggers a scan for the next magic. A body the parser
//! rejects is dropped and decoding continues with the next frame.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::event::Event;

pub const MAGIC: &[u8; 4] = b"CETP";
pub const HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Decode errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Turns a frame body into an [`Event`].
pub trait EventParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<Event, ProtocolError>;

    fn serialize(&self, event: &Event) -> Result<Vec<u8>, ProtocolError>;
}

#[derive(Serialize, Deserialize)]
struct JsonParameter {
    key: String,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct JsonEvent {
    topic: String,
    #[serde(default)]
    parameters: Vec<JsonParameter>,
}

/// JSON bodies: `{"topic": "...", "parameters": [{"key": "...", "value": "..."}]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventParser;

impl EventParser for JsonEventParser {
    fn parse(&self, body: &[u8]) -> Result<Event, ProtocolError> {
        let json: JsonEvent =
            serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if json.topic.is_empty() {
            return Err(ProtocolError::Malformed("empty topic".to_string()));
        }
        Ok(Event {
            topic: json.topic,
            parameters: json
                .parameters
                .into_iter()
                .map(|p| (p.key, p.value))
                .collect(),
        })
    }

    fn serialize(&self, event: &Event) -> Result<Vec<u8>, ProtocolError> {
        let json = JsonEvent {
            topic: event.topic.clone(),
            parameters: event
                .parameters
                .iter()
                .map(|(key, value)| JsonParameter {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        };
        serde_json::to_vec(&json).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Streaming frame codec for device events.
#[derive(Debug, Clone)]
pub struct EventCodec<P = JsonEventParser> {
    parser: P,
    max_frame_len: usize,
}

impl EventCodec<JsonEventParser> {
    pub fn new() -> Self {
        Self::with_parser(JsonEventParser)
    }
}

impl Default for EventCodec<JsonEventParser> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: EventParser> EventCodec<P> {
    pub fn with_parser(parser: P) -> Self {
        Self {
            parser,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Drop bytes up to the next magic. Keeps a trailing partial magic.
    fn resync(src: &mut BytesMut) {
        let skip = src[1..]
            .windows(MAGIC.len())
            .position(|w| w == MAGIC)
            .map(|pos| pos + 1)
            .unwrap_or_else(|| {
                let tail = (1..MAGIC.len())
                    .rev()
                    .find(|&n| n < src.len() && src.ends_with(&MAGIC[..n]))
                    .unwrap_or(0);
                src.len() - tail
            });
        warn!(skipped = skip, "Resynchronizing event stream");
        src.advance(skip);
    }
}

/// Length field for a body of `len` bytes.
fn frame_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

/// Write one frame around `body`.
pub fn encode_frame(body: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = frame_len(body.len())?;
    dst.reserve(HEADER_LEN + body.len());
    dst.put_slice(MAGIC);
    dst.put_u32(len);
    dst.put_slice(body);
    Ok(())
}

impl<P: EventParser> Decoder for EventCodec<P> {
    type Item = Event;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            let prefix = src.len().min(MAGIC.len());
            if src[..prefix] != MAGIC[..prefix] {
                Self::resync(src);
                continue;
            }
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if len > self.max_frame_len {
                warn!(
                    "{}",
                    ProtocolError::FrameTooLarge {
                        len,
                        max: self.max_frame_len
                    }
                );
                Self::resync(src);
                continue;
            }
            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let body = src.split_to(len);
            match self.parser.parse(&body) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    warn!("Discarding malformed event frame: {}", e);
                    continue;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None => {
                if !src.is_empty() {
                    debug!(remaining = src.len(), "Dropping incomplete frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<P: EventParser> Encoder<Event> for EventCodec<P> {
    type Error = ProtocolError;

    fn encode(&mut self, event: Event, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = self.parser.serialize(&event)?;
        if body.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }
        encode_frame(&body, dst)
    }
}
