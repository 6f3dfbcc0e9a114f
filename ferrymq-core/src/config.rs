//! Connection configuration.
//!
//! Settings that shape delivery and acknowledgment behavior for every
//! session and consumer created by a connection. Values mirror what the
//! broker-facing factory layer would populate; defaults are serviceable for
//! direct construction in tests and examples.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Connection`](crate::connection::Connection).
///
/// # Examples
///
/// ```rust
/// use ferrymq_core::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig {
///     termination_timeout: Duration::from_secs(5),
///     requeue_on_listener_error: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum time to wait for a consumer's cancellation to be confirmed
    /// during stop and close.
    pub termination_timeout: Duration,

    /// Maximum time a listener invocation may run before the delivery is
    /// treated as non-recoverable.
    pub on_message_timeout: Duration,

    /// Per-channel unacknowledged-delivery limit applied to every channel
    /// this connection opens. `None` leaves the broker default in place.
    pub channel_qos: Option<u16>,

    /// Whether producer-level message properties take precedence over
    /// per-message properties when publishing.
    pub prefer_producer_properties: bool,

    /// Whether an ordinary listener failure negatively acknowledges the
    /// delivery and permanently cancels the consumer.
    pub requeue_on_listener_error: bool,

    /// Whether a delivery negatively acknowledged through the listener's
    /// nack-request signal is requeued rather than discarded.
    pub requeue_on_nack_request: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            termination_timeout: Duration::from_secs(15),
            on_message_timeout: Duration::from_secs(2),
            channel_qos: None,
            prefer_producer_properties: true,
            requeue_on_listener_error: false,
            requeue_on_nack_request: false,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would make the connection inoperable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.termination_timeout.is_zero() {
            anyhow::bail!("termination_timeout must be greater than 0");
        }

        if self.on_message_timeout.is_zero() {
            anyhow::bail!("on_message_timeout must be greater than 0");
        }

        if self.channel_qos == Some(0) {
            anyhow::bail!("channel_qos of 0 is not a limit; use None to leave QoS unset");
        }

        if self.termination_timeout < self.on_message_timeout {
            tracing::warn!(
                termination_timeout = ?self.termination_timeout,
                on_message_timeout = ?self.on_message_timeout,
                "termination_timeout is shorter than on_message_timeout; stop may time out while a listener is still running"
            );
        }

        Ok(())
    }

    /// Sets the cancellation-confirmation timeout.
    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    /// Sets the listener invocation timeout.
    pub fn with_on_message_timeout(mut self, timeout: Duration) -> Self {
        self.on_message_timeout = timeout;
        self
    }

    /// Sets the per-channel QoS limit.
    pub fn with_channel_qos(mut self, prefetch: u16) -> Self {
        self.channel_qos = Some(prefetch);
        self
    }

    /// Enables or disables requeue-and-cancel on ordinary listener failure.
    pub fn with_requeue_on_listener_error(mut self, enabled: bool) -> Self {
        self.requeue_on_listener_error = enabled;
        self
    }

    /// Enables or disables requeueing for nack-requested deliveries.
    pub fn with_requeue_on_nack_request(mut self, enabled: bool) -> Self {
        self.requeue_on_nack_request = enabled;
        self
    }
}
