//! Application listener callback and its invocation outcome.
//!
//! The delivery engine never inspects a listener failure by digging through
//! nested causes; the session's invocation boundary classifies every call
//! into one [`DeliveryOutcome`] variant up front and the engine applies its
//! acknowledgment policy on the variant alone.

use crate::error::FerryError;
use crate::message::Message;
use async_trait::async_trait;

/// Application callback receiving decoded messages.
///
/// At most one invocation is in flight per consumer at any time: the
/// transport's delivery task awaits each call before presenting the next
/// delivery.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Return [`ListenerError::NackRequested`] to ask for the delivery to be
    /// negatively acknowledged without cancelling the consumer. Any other
    /// failure is an ordinary listener failure, handled according to the
    /// connection's requeue policy.
    async fn on_message(&self, message: Message) -> Result<(), ListenerError>;
}

/// Failure raised by a [`MessageListener`].
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Distinguished signal: negatively acknowledge this delivery, keep the
    /// consumer alive.
    #[error("listener requested negative acknowledgment")]
    NackRequested,

    /// Ordinary listener failure.
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

/// How a listener invocation ended, as classified by the session boundary.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The listener returned normally.
    Success,

    /// The listener failed; the delivery engine decides what to settle.
    ListenerFailed(ListenerFailure),

    /// Failure outside the listener's control (invocation timeout); fatal
    /// for this delivery.
    NonRecoverable(FerryError),
}

/// The two listener failure shapes the acknowledgment policy distinguishes.
#[derive(Debug)]
pub enum ListenerFailure {
    /// The listener raised the negative-acknowledgment request signal.
    NackRequested,

    /// The listener failed (returned an error or panicked).
    Ordinary(anyhow::Error),
}

/// Observer for asynchronous connection-level errors.
///
/// Registered on a connection and invoked when the transport shuts down
/// outside of application control.
pub trait ExceptionObserver: Send + Sync {
    /// Reports one asynchronous error.
    fn on_exception(&self, error: FerryError);
}

/// Interception hook invoked with every decoded message before listener
/// dispatch (tracing contexts, metrics tagging).
pub type ReceiveHook = std::sync::Arc<dyn Fn(&Message) + Send + Sync>;
