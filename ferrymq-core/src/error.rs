//! Error taxonomy for the ferrymq client core.
//!
//! Errors fall into two buckets: failures of explicit, single-target
//! operations (consumer start, setting the client identifier), which are
//! returned to the caller, and transport-level events (shutdowns), which are
//! either swallowed or escalated depending on whether the application itself
//! initiated them.

use crate::transport::TransportError;
use std::time::Duration;

/// Errors surfaced by connections, sessions, and consumers.
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    /// Registration of a consumer with the broker failed.
    ///
    /// Non-fatal to the connection; only the consumer whose `start` failed is
    /// affected.
    #[error("failed to start consumer: {source}")]
    Start {
        #[source]
        source: TransportError,
    },

    /// The transport closed outside of application control.
    #[error("unexpected transport shutdown: {reason}")]
    UnexpectedShutdown { reason: String },

    /// Another live connection in this process already holds the identifier.
    #[error("a connection with client identifier '{0}' already exists")]
    IdentifierInUse(String),

    /// The connection has already been used; the identifier can no longer be
    /// assigned.
    #[error("client identifier can only be set before the connection is first used")]
    IdentifierFrozen,

    /// A client identifier has already been assigned to this connection.
    #[error("client identifier already set")]
    IdentifierAlreadySet,

    /// Operation attempted on a closed connection or session.
    #[error("connection is closed")]
    Closed,

    /// An inbound payload could not be decoded into a message.
    #[error("failed to decode message payload: {0}")]
    Codec(#[from] crate::message::CodecError),

    /// The listener did not return within the configured delivery timeout.
    #[error("listener did not return within {timeout:?}")]
    DeliveryTimeout { timeout: Duration },

    /// Transport failure outside the dedicated cases above.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FerryError>;
