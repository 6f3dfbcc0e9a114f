//! Message model and payload codec.
//!
//! The codec is a pure, stateless collaborator of the delivery engine: it
//! turns a raw broker payload into a [`Message`] on the non-rejecting
//! delivery path and nothing else. The standard codec understands text and
//! byte bodies; anything richer is an application concern layered on top.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Marker byte for a text body.
const KIND_TEXT: u8 = 0;
/// Marker byte for a byte-array body.
const KIND_BYTES: u8 = 1;

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// UTF-8 text payload. `None` models a message sent without a body.
    Text(Option<String>),
    /// Opaque byte payload.
    Bytes(Vec<u8>),
}

/// A decoded application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Decoded body.
    pub body: MessageBody,
    /// Application-level string properties.
    pub properties: HashMap<String, String>,
    /// Whether the broker flagged this delivery as a redelivery.
    pub redelivered: bool,
}

impl Message {
    /// Creates a text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(Some(body.into())),
            properties: HashMap::new(),
            redelivered: false,
        }
    }

    /// Creates a byte-array message.
    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: MessageBody::Bytes(body.into()),
            properties: HashMap::new(),
            redelivered: false,
        }
    }

    /// Attaches a string property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Text body, when present.
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => text.as_deref(),
            MessageBody::Bytes(_) => None,
        }
    }
}

/// Payload decoding failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before the declared body length.
    #[error("payload truncated: expected {expected} more bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    /// The payload is empty or its body-kind marker is unknown.
    #[error("unknown body kind marker: {0:#04x}")]
    UnknownKind(u8),

    /// A text body was not valid UTF-8.
    #[error("text body is not valid utf-8")]
    InvalidText,
}

/// Stateless payload codec.
pub trait MessageCodec: Send + Sync {
    /// Decodes a raw broker payload into a message.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the payload is malformed; the delivery
    /// engine treats this as a non-recoverable delivery failure.
    fn decode(&self, raw: &[u8]) -> Result<Message, CodecError>;

    /// Encodes a message body into the raw payload form.
    fn encode(&self, message: &Message) -> Vec<u8>;
}

/// The default body wire format.
///
/// Layout: one kind marker byte, then for text a null flag byte followed (if
/// non-null) by a big-endian `u32` length and UTF-8 bytes; for byte bodies a
/// big-endian `u32` length and the raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl StandardCodec {
    fn read_len(raw: &[u8], at: usize) -> Result<(usize, usize), CodecError> {
        let bytes = raw
            .get(at..at + 4)
            .ok_or(CodecError::Truncated {
                expected: 4,
                found: raw.len().saturating_sub(at),
            })?;
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        Ok((len, at + 4))
    }

    fn read_body(raw: &[u8], at: usize) -> Result<Vec<u8>, CodecError> {
        let (len, at) = Self::read_len(raw, at)?;
        let body = raw.get(at..at + len).ok_or(CodecError::Truncated {
            expected: len,
            found: raw.len().saturating_sub(at),
        })?;
        Ok(body.to_vec())
    }
}

impl MessageCodec for StandardCodec {
    fn decode(&self, raw: &[u8]) -> Result<Message, CodecError> {
        match raw.first().copied() {
            Some(KIND_TEXT) => {
                let is_null = raw.get(1).copied().ok_or(CodecError::Truncated {
                    expected: 1,
                    found: 0,
                })?;
                if is_null != 0 {
                    return Ok(Message {
                        body: MessageBody::Text(None),
                        properties: HashMap::new(),
                        redelivered: false,
                    });
                }
                let body = Self::read_body(raw, 2)?;
                let text = String::from_utf8(body).map_err(|_| CodecError::InvalidText)?;
                Ok(Message::text(text))
            }
            Some(KIND_BYTES) => Ok(Message::bytes(Self::read_body(raw, 1)?)),
            Some(other) => Err(CodecError::UnknownKind(other)),
            None => Err(CodecError::UnknownKind(0)),
        }
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        match &message.body {
            MessageBody::Text(None) => vec![KIND_TEXT, 1],
            MessageBody::Text(Some(text)) => {
                let mut raw = Vec::with_capacity(6 + text.len());
                raw.push(KIND_TEXT);
                raw.push(0);
                raw.extend_from_slice(&(text.len() as u32).to_be_bytes());
                raw.extend_from_slice(text.as_bytes());
                raw
            }
            MessageBody::Bytes(bytes) => {
                let mut raw = Vec::with_capacity(5 + bytes.len());
                raw.push(KIND_BYTES);
                raw.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                raw.extend_from_slice(bytes);
                raw
            }
        }
    }
}
