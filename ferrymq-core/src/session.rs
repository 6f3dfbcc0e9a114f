//! Session controller and the listener invocation boundary.
//!
//! A session owns one broker channel and a set of consumers. It adds no
//! concurrency machinery of its own: resume and pause fan out to the
//! consumers, close cancels them, and per-element failures never abort the
//! fan-out. The [`SessionContext`] is the slice of session state consumers
//! call back into for decoding, listener dispatch, and settlement.

use crate::config::ConnectionConfig;
use crate::consumer::ListenerConsumer;
use crate::error::{FerryError, Result};
use crate::listener::{
    DeliveryOutcome, ListenerError, ListenerFailure, MessageListener, ReceiveHook,
};
use crate::message::{Message, MessageCodec};
use crate::transport::{Channel, Delivery, TransportError};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Acknowledgment mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// Deliveries are acknowledged as soon as the listener returns.
    Auto,
    /// The application acknowledges explicitly.
    Client,
    /// Like `Auto`, but duplicates are tolerated after failures.
    DupsOk,
    /// Settlement is tied to the session's transaction.
    Transacted,
}

impl AckMode {
    /// Whether the engine settles deliveries itself after a normal listener
    /// return.
    pub fn is_auto_ack(self) -> bool {
        matches!(self, AckMode::Auto | AckMode::DupsOk)
    }
}

/// Durable-subscription bookkeeping shared by all sessions of a connection.
pub(crate) type SubscriptionMap = Arc<Mutex<HashMap<String, Arc<ListenerConsumer>>>>;

/// Session state consumers call back into from the delivery path.
pub(crate) struct SessionContext {
    channel: Arc<dyn Channel>,
    codec: Arc<dyn MessageCodec>,
    receive_hook: Option<ReceiveHook>,
    on_message_timeout: Duration,
    requeue_on_nack_request: bool,
}

impl SessionContext {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        codec: Arc<dyn MessageCodec>,
        receive_hook: Option<ReceiveHook>,
        on_message_timeout: Duration,
        requeue_on_nack_request: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            codec,
            receive_hook,
            on_message_timeout,
            requeue_on_nack_request,
        })
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Decodes a raw delivery into a message, carrying over the redelivery
    /// flag and running the connection's receive hook.
    pub(crate) fn decode(&self, delivery: &Delivery) -> Result<Message> {
        let mut message = self.codec.decode(&delivery.payload)?;
        message.redelivered = delivery.redelivered;
        if let Some(hook) = &self.receive_hook {
            hook(&message);
        }
        Ok(message)
    }

    /// Invokes the listener and classifies how the invocation ended.
    ///
    /// The classification is the single place that distinguishes the
    /// nack-request signal from ordinary failures; callers switch on the
    /// returned variant and never inspect causes themselves. A panic inside
    /// the listener counts as an ordinary failure; exceeding the invocation
    /// timeout is non-recoverable.
    pub(crate) async fn deliver(
        &self,
        message: Message,
        listener: &dyn MessageListener,
    ) -> DeliveryOutcome {
        let invocation = AssertUnwindSafe(listener.on_message(message)).catch_unwind();
        match tokio::time::timeout(self.on_message_timeout, invocation).await {
            Err(_) => DeliveryOutcome::NonRecoverable(FerryError::DeliveryTimeout {
                timeout: self.on_message_timeout,
            }),
            Ok(Err(panic)) => DeliveryOutcome::ListenerFailed(ListenerFailure::Ordinary(
                anyhow::anyhow!("listener panicked: {}", panic_message(panic.as_ref())),
            )),
            Ok(Ok(Ok(()))) => DeliveryOutcome::Success,
            Ok(Ok(Err(ListenerError::NackRequested))) => {
                DeliveryOutcome::ListenerFailed(ListenerFailure::NackRequested)
            }
            Ok(Ok(Err(ListenerError::Failure(cause)))) => {
                DeliveryOutcome::ListenerFailed(ListenerFailure::Ordinary(cause))
            }
        }
    }

    /// Positively settles a delivery; transport failures are logged, not
    /// raised.
    pub(crate) async fn acknowledge(&self, delivery_tag: u64) {
        debug!(delivery_tag, "acknowledging delivery");
        if let Err(cause) = self.channel.acknowledge(delivery_tag).await {
            warn!(delivery_tag, error = %cause, "acknowledge failed");
        }
    }

    /// Negatively settles a delivery with requeue.
    pub(crate) async fn explicit_nack(&self, delivery_tag: u64) {
        debug!(delivery_tag, "negatively acknowledging delivery");
        if let Err(cause) = self.channel.negative_acknowledge(delivery_tag, true).await {
            warn!(delivery_tag, error = %cause, "negative acknowledge failed");
        }
    }

    /// Negatively settles a delivery the listener asked to reject; whether
    /// it is requeued follows the connection's nack-request policy.
    pub(crate) async fn explicit_nack_on_nack_request(&self, delivery_tag: u64) {
        debug!(
            delivery_tag,
            requeue = self.requeue_on_nack_request,
            "negatively acknowledging delivery on listener request"
        );
        if let Err(cause) = self
            .channel
            .negative_acknowledge(delivery_tag, self.requeue_on_nack_request)
            .await
        {
            warn!(delivery_tag, error = %cause, "negative acknowledge failed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A session: one broker channel plus the consumers delivering from it.
pub struct Session {
    ctx: Arc<SessionContext>,
    config: ConnectionConfig,
    transacted: bool,
    ack_mode: AckMode,
    consumers: Mutex<Vec<Arc<ListenerConsumer>>>,
    subscriptions: SubscriptionMap,
    connection_stopped: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        codec: Arc<dyn MessageCodec>,
        receive_hook: Option<ReceiveHook>,
        config: ConnectionConfig,
        transacted: bool,
        ack_mode: AckMode,
        subscriptions: SubscriptionMap,
        connection_stopped: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let ctx = SessionContext::new(
            channel,
            codec,
            receive_hook,
            config.on_message_timeout,
            config.requeue_on_nack_request,
        );
        Arc::new(Self {
            ctx,
            config,
            transacted,
            ack_mode,
            consumers: Mutex::new(Vec::new()),
            subscriptions,
            connection_stopped,
            closed: AtomicBool::new(false),
        })
    }

    /// Acknowledgment mode of this session.
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Whether this session was created transacted.
    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    /// Number of consumers currently owned by this session.
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FerryError::Closed);
        }
        Ok(())
    }

    /// Creates a consumer on this session's channel.
    ///
    /// The consumer starts out rejecting when the owning connection is
    /// stopped; it does not receive deliveries until it is started (directly
    /// or by the connection's `start` fan-out).
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] when the session is closed.
    pub fn create_consumer(
        &self,
        listener: Option<Arc<dyn MessageListener>>,
        broker_auto_ack: bool,
    ) -> Result<Arc<ListenerConsumer>> {
        self.ensure_open()?;

        let consumer = ListenerConsumer::new(
            Arc::clone(&self.ctx),
            listener,
            self.ack_mode,
            broker_auto_ack,
            self.config.termination_timeout,
            self.config.requeue_on_listener_error,
            self.connection_stopped.load(Ordering::SeqCst),
        );
        self.consumers.lock().unwrap().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Creates a consumer registered under a durable subscription name.
    ///
    /// The subscription map is shared across all sessions of the owning
    /// connection; an existing entry under the same name is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] when the session is closed.
    pub fn create_durable_consumer(
        &self,
        subscription_name: &str,
        listener: Option<Arc<dyn MessageListener>>,
        broker_auto_ack: bool,
    ) -> Result<Arc<ListenerConsumer>> {
        let consumer = self.create_consumer(listener, broker_auto_ack)?;
        let previous = self
            .subscriptions
            .lock()
            .unwrap()
            .insert(subscription_name.to_string(), Arc::clone(&consumer));
        if previous.is_some() {
            debug!(subscription = %subscription_name, "replaced active durable subscription consumer");
        }
        Ok(consumer)
    }

    fn consumer_snapshot(&self) -> Vec<Arc<ListenerConsumer>> {
        self.consumers.lock().unwrap().clone()
    }

    /// Starts every consumer. Called by the connection's `start` fan-out.
    ///
    /// Best effort: every consumer is attempted even when an earlier one
    /// fails; the first failure is returned once the fan-out finishes.
    ///
    /// # Errors
    ///
    /// Returns the first per-consumer start failure.
    pub async fn resume(&self) -> Result<()> {
        let mut first_error = None;
        for consumer in self.consumer_snapshot() {
            if let Err(cause) = consumer.start().await {
                warn!(error = %cause, "consumer failed to resume");
                first_error.get_or_insert(cause);
            }
        }
        match first_error {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    /// Stops every consumer with the configured termination timeout. Called
    /// by the connection's `stop` fan-out.
    ///
    /// # Errors
    ///
    /// Returns the first per-consumer failure (an unexpected transport
    /// shutdown); the remaining consumers are still attempted.
    pub async fn pause(&self) -> Result<()> {
        let mut first_error = None;
        for consumer in self.consumer_snapshot() {
            if let Err(cause) = consumer.stop().await {
                warn!(error = %cause, "consumer failed to pause");
                first_error.get_or_insert(cause);
            }
        }
        match first_error {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    /// Cancels every consumer and releases the channel.
    ///
    /// Idempotent. Consumer cancellation uses abort semantics (best effort,
    /// nothing raised); a failure on one consumer does not prevent
    /// cancelling the rest.
    ///
    /// # Errors
    ///
    /// Returns a transport error when closing the channel fails for a
    /// reason other than a transport shutdown.
    pub async fn internal_close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!("closing session");

        let consumers: Vec<_> = self.consumers.lock().unwrap().drain(..).collect();
        for consumer in consumers {
            consumer.abort().await;
        }

        match self.ctx.channel().close().await {
            Ok(()) => Ok(()),
            Err(TransportError::Shutdown(signal)) => {
                debug!(reason = %signal, "channel already gone at session close");
                Ok(())
            }
            Err(cause) => Err(FerryError::Transport(cause)),
        }
    }
}
