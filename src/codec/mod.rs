//! Wire codec
//!
//! Every payload starts with a fixed 8-byte header followed by a serde body:
//!
//! ```text
//! ┌──────────────┬─────────────────┬──────────┬──────────┬──────────────────┐
//! │ Magic "MVRS" │ Version (u16 BE)│ Format   │ Kind     │ Body (variable)  │
//! │ 4 bytes      │ 2 bytes         │ 1 byte   │ 1 byte   │ CBOR or JSON     │
//! └──────────────┴─────────────────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! The decoder trusts the header, not its own configured format, so a peer can
//! answer each client in whatever format that client spoke. A different
//! version fails fast with `UnsupportedVersion`; everything else that does not
//! parse (including unknown attribute type tags and duplicate attribute
//! names) is a `MalformedMessage`.

pub mod message;

use bytes::BufMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::state::ObjectState;

pub use message::{ApiCall, Exchange, Handshake, HandshakeAck, Message, SessionMeta, Update};

pub const MAGIC: [u8; 4] = *b"MVRS";
pub const PROTOCOL_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 8;

/// Supported body formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Compact binary, default for production traffic
    #[default]
    Cbor,
    /// Human-readable, for debugging against hand-written servers
    Json,
}

impl WireFormat {
    fn to_byte(self) -> u8 {
        match self {
            WireFormat::Cbor => 1,
            WireFormat::Json => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(WireFormat::Cbor),
            2 => Some(WireFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    States = 1,
    Message = 2,
}

/// Header fields of an encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub format: WireFormat,
}

/// Symmetric encoder/decoder for object states and protocol messages
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    format: WireFormat,
}

impl WireCodec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a list of object states
    pub fn encode(&self, states: &[ObjectState]) -> Result<Vec<u8>, CodecError> {
        self.encode_body(PayloadKind::States, &states, states)
    }

    /// Decode a list of object states. Exact inverse of [`WireCodec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<ObjectState>, CodecError> {
        decode_body(bytes, PayloadKind::States)
    }

    pub fn encode_message(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        self.encode_body(PayloadKind::Message, message, message.objects())
    }

    pub fn decode_message(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        decode_body(bytes, PayloadKind::Message)
    }

    fn encode_body<T: Serialize>(
        &self,
        kind: PayloadKind,
        body: &T,
        states: &[ObjectState],
    ) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64 * states.len().max(1));
        buf.put_slice(&MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u8(self.format.to_byte());
        buf.put_u8(kind as u8);

        match self.format {
            WireFormat::Cbor => serde_cbor::to_writer(&mut buf, body)
                .map_err(|e| CodecError::Encode(e.to_string()))?,
            WireFormat::Json => {
                // serde_json writes non-finite floats as null, which would not decode
                ensure_finite(states)?;
                serde_json::to_writer(&mut buf, body)
                    .map_err(|e| CodecError::Encode(e.to_string()))?
            }
        }

        Ok(buf)
    }
}

/// Parse and validate the header of an encoded payload
pub fn read_header(bytes: &[u8]) -> Result<Header, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::MalformedMessage(format!(
            "payload of {} bytes is shorter than the {} byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(CodecError::MalformedMessage("bad magic".to_string()));
    }

    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }

    let format = WireFormat::from_byte(bytes[6]).ok_or_else(|| {
        CodecError::MalformedMessage(format!("unknown wire format {}", bytes[6]))
    })?;

    Ok(Header { version, format })
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8], kind: PayloadKind) -> Result<T, CodecError> {
    let header = read_header(bytes)?;
    if bytes[7] != kind as u8 {
        return Err(CodecError::MalformedMessage(format!(
            "expected payload kind {}, found {}",
            kind as u8, bytes[7]
        )));
    }

    let body = &bytes[HEADER_LEN..];
    match header.format {
        WireFormat::Cbor => {
            serde_cbor::from_slice(body).map_err(|e| CodecError::MalformedMessage(e.to_string()))
        }
        WireFormat::Json => {
            serde_json::from_slice(body).map_err(|e| CodecError::MalformedMessage(e.to_string()))
        }
    }
}

fn ensure_finite(states: &[ObjectState]) -> Result<(), CodecError> {
    for state in states {
        for (name, value) in &state.attributes {
            if value.as_slice().iter().any(|v| !v.is_finite()) {
                return Err(CodecError::Encode(format!(
                    "non-finite value in '{}.{}' cannot be encoded as JSON",
                    state.id, name
                )));
            }
        }
    }
    Ok(())
}
