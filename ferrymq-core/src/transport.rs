//! Transport abstractions consumed by the delivery engine.
//!
//! The engine never talks to a broker socket directly. It drives a
//! [`Channel`] for registration and settlement, receives push-deliveries
//! through a [`DeliveryHandler`] it registers, and learns about connection
//! loss through the shutdown observer on [`BrokerConnection`]. Concrete
//! implementations own framing, I/O, and reconnection; none of that leaks in
//! here.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// One broker-pushed message instance.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Registration tag of the consumer this delivery is addressed to.
    pub consumer_tag: String,
    /// Transport-assigned settlement tag, unique per channel.
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Raw, undecoded payload.
    pub payload: Vec<u8>,
}

/// Notice that the transport connection has shut down.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    /// Broker- or library-stated reason for the shutdown.
    pub reason: String,
    /// Whether the application's own `close` triggered the shutdown.
    pub initiated_by_application: bool,
}

impl ShutdownSignal {
    /// Shutdown caused by the application closing the connection.
    pub fn application(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            initiated_by_application: true,
        }
    }

    /// Shutdown outside of application control (broker failure, socket loss).
    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            initiated_by_application: false,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Transport-level failures reported by [`Channel`] and [`BrokerConnection`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The broker does not know the consumer tag (already cancelled).
    #[error("unknown consumer tag: {0}")]
    UnknownConsumerTag(String),

    /// The channel exists but cannot currently serve the request.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The operation failed because the transport has shut down.
    #[error("transport shut down: {0}")]
    Shutdown(ShutdownSignal),

    /// Broker or socket I/O failure.
    #[error("broker i/o failure: {0}")]
    Io(String),
}

/// Push-delivery sink a consumer registers with a channel.
///
/// The transport invokes these callbacks on its per-channel delivery task
/// and awaits each call before presenting the next event, which is the
/// mechanism that serializes listener invocations per consumer and preserves
/// broker delivery order.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Presents one delivery. Invoked at most once per physical delivery.
    ///
    /// # Errors
    ///
    /// Returns an error only for non-recoverable delivery failures (payload
    /// conversion, listener timeout); policy failures are settled internally.
    async fn on_delivery(&self, delivery: Delivery) -> Result<()>;

    /// The broker confirmed a cancellation requested for `consumer_tag`.
    async fn on_cancel_confirmed(&self, consumer_tag: &str);

    /// The broker cancelled `consumer_tag` on its own initiative (queue
    /// deleted, node failover).
    async fn on_cancelled_by_broker(&self, consumer_tag: &str);
}

/// Broker channel surface the delivery engine drives.
///
/// A channel is exclusively owned by one session. Settlement calls refer to
/// delivery tags previously pushed through a [`DeliveryHandler`] on this
/// channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Asks the broker to begin pushing deliveries for `consumer_tag` to
    /// `handler`.
    async fn register_consumer(
        &self,
        consumer_tag: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> std::result::Result<(), TransportError>;

    /// Asks the broker to stop pushing deliveries for `consumer_tag`.
    ///
    /// Cancellation is asynchronous: the broker's confirmation arrives later
    /// via [`DeliveryHandler::on_cancel_confirmed`].
    async fn cancel_consumer(&self, consumer_tag: &str)
        -> std::result::Result<(), TransportError>;

    /// Positively settles one delivery.
    async fn acknowledge(&self, delivery_tag: u64) -> std::result::Result<(), TransportError>;

    /// Negatively settles one delivery. `requeue` asks the broker to make
    /// the message eligible for redelivery instead of discarding it.
    async fn negative_acknowledge(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> std::result::Result<(), TransportError>;

    /// Applies a per-channel unacknowledged-delivery limit.
    async fn set_qos(&self, prefetch: u16) -> std::result::Result<(), TransportError>;

    /// Releases channel resources.
    async fn close(&self) -> std::result::Result<(), TransportError>;
}

/// Observer for transport shutdown events.
pub type ShutdownObserver = Box<dyn Fn(ShutdownSignal) + Send + Sync>;

/// Broker connection surface the connection controller drives.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new, exclusively owned channel.
    async fn create_channel(&self) -> std::result::Result<Arc<dyn Channel>, TransportError>;

    /// Registers the observer invoked when the transport shuts down.
    ///
    /// The observer fires for both application-initiated and unexpected
    /// shutdowns; the signal says which.
    fn on_shutdown(&self, observer: ShutdownObserver);

    /// Closes the transport connection.
    async fn close(&self) -> std::result::Result<(), TransportError>;
}
