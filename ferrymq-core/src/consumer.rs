//! Per-consumer asynchronous delivery state machine.
//!
//! A [`ListenerConsumer`] registers itself with the broker under a
//! registration tag, receives push-deliveries through the
//! [`DeliveryHandler`] callbacks, dispatches them to the application
//! listener, and settles each delivery according to the connection's
//! acknowledgment policy. Control threads drive `start` / `stop` / `abort`
//! concurrently with the transport's delivery task; the registration tag is
//! the only state both sides mutate and it lives behind its own lock.

use crate::completion::Completion;
use crate::error::{FerryError, Result};
use crate::listener::{DeliveryOutcome, ListenerFailure, MessageListener};
use crate::session::{AckMode, SessionContext};
use crate::transport::{Delivery, DeliveryHandler, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Internally synchronized holder for the consumer registration tag.
///
/// Exactly one tag is live per registration cycle; a cleared tag is never
/// reused. Creation and clearing race between delivery and control threads,
/// so the slot is never exposed as a raw field.
#[derive(Debug, Default)]
struct ConsumerTag {
    slot: Mutex<Option<String>>,
}

impl ConsumerTag {
    /// Returns the live tag, minting a fresh one when none is live.
    fn get_or_create(&self) -> String {
        let mut slot = self.slot.lock().unwrap();
        slot.get_or_insert_with(new_consumer_tag).clone()
    }

    /// Drops the live tag after a completed cancellation.
    fn clear(&self) {
        self.slot.lock().unwrap().take();
    }

    /// Snapshot of the live tag, if any.
    fn current(&self) -> Option<String> {
        self.slot.lock().unwrap().clone()
    }
}

fn new_consumer_tag() -> String {
    format!("ferrymq.{}", Uuid::new_v4())
}

/// Per-consumer delivery engine.
///
/// Created by [`Session::create_consumer`](crate::session::Session::create_consumer);
/// the transport holds it as a [`DeliveryHandler`] while registered.
pub struct ListenerConsumer {
    ctx: Arc<SessionContext>,
    listener: Option<Arc<dyn MessageListener>>,
    ack_mode: AckMode,
    /// The broker settles this consumer's deliveries itself; no explicit
    /// ack or nack is ever issued.
    broker_auto_ack: bool,
    termination_timeout: Duration,
    requeue_on_listener_error: bool,
    tag: ConsumerTag,
    rejecting: AtomicBool,
    /// Completed when the current registration's cancellation is confirmed.
    /// Replaced on every (re)start.
    completion: RwLock<Arc<Completion>>,
}

impl ListenerConsumer {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        listener: Option<Arc<dyn MessageListener>>,
        ack_mode: AckMode,
        broker_auto_ack: bool,
        termination_timeout: Duration,
        requeue_on_listener_error: bool,
        initially_rejecting: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            listener,
            ack_mode,
            broker_auto_ack,
            termination_timeout,
            requeue_on_listener_error,
            tag: ConsumerTag::default(),
            rejecting: AtomicBool::new(initially_rejecting),
            completion: RwLock::new(Arc::new(Completion::new())),
        })
    }

    /// Registration tag of the current cycle, if one is live.
    pub fn consumer_tag(&self) -> Option<String> {
        self.tag.current()
    }

    /// Whether deliveries are currently rejected without listener dispatch.
    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::SeqCst)
    }

    fn current_completion(&self) -> Arc<Completion> {
        Arc::clone(&self.completion.read().unwrap())
    }

    /// Registers with the broker and begins accepting deliveries.
    ///
    /// Allocates a fresh completion for the new registration cycle before
    /// asking the broker to push deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Start`] when broker registration fails. The
    /// fresh completion is completed first so no concurrent `stop` blocks
    /// on a registration that never happened.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let tag = self.tag.get_or_create();
        trace!(consumer_tag = %tag, "starting consumer");

        self.rejecting.store(false, Ordering::SeqCst);
        *self.completion.write().unwrap() = Arc::new(Completion::new());

        let handler: Arc<dyn DeliveryHandler> = Arc::clone(self) as Arc<dyn DeliveryHandler>;
        if let Err(cause) = self.ctx.channel().register_consumer(&tag, handler).await {
            self.current_completion().set_complete();
            error!(consumer_tag = %tag, error = %cause, "consumer registration failed");
            return Err(FerryError::Start { source: cause });
        }
        Ok(())
    }

    /// Requests cancellation and waits for the broker's confirmation, up to
    /// the configured termination timeout.
    ///
    /// Best effort: a confirmation that does not arrive in time is logged
    /// and forgotten, and a tag the broker no longer knows is treated as
    /// already cancelled. Idempotent once the current cycle has completed.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::UnexpectedShutdown`] when the transport shut
    /// down during cancellation and the shutdown was not
    /// application-initiated.
    pub async fn stop(&self) -> Result<()> {
        let tag = self.tag.get_or_create();
        trace!(consumer_tag = %tag, "stopping consumer");

        let completion = self.current_completion();
        if completion.is_complete() {
            return Ok(());
        }

        debug!(consumer_tag = %tag, "requesting cancellation");
        match self.ctx.channel().cancel_consumer(&tag).await {
            Ok(()) => {
                match completion.wait_until_complete(self.termination_timeout).await {
                    Ok(()) => {
                        // Confirmed; the consumer can restart under a new tag.
                        self.tag.clear();
                    }
                    Err(timeout) => {
                        warn!(
                            consumer_tag = %tag,
                            error = %timeout,
                            "cancellation not confirmed in time, giving up the wait"
                        );
                    }
                }
                Ok(())
            }
            Err(TransportError::UnknownConsumerTag(_)) => {
                debug!(consumer_tag = %tag, "broker reports tag already cancelled");
                Ok(())
            }
            Err(TransportError::Shutdown(signal)) if signal.initiated_by_application => {
                debug!(consumer_tag = %tag, reason = %signal, "transport closed by application during cancellation");
                Ok(())
            }
            Err(TransportError::Shutdown(signal)) => {
                error!(consumer_tag = %tag, reason = %signal, "transport shut down during cancellation");
                Err(FerryError::UnexpectedShutdown {
                    reason: signal.reason,
                })
            }
            Err(cause) => {
                error!(consumer_tag = %tag, error = %cause, "cancellation request failed");
                Ok(())
            }
        }
    }

    /// Fire-and-forget cancellation.
    ///
    /// Issues at most one cancellation request per registration cycle
    /// (nothing is sent when the cycle has already completed), then
    /// unconditionally switches to rejecting mode and completes the
    /// completion. Any transport failure is logged and swallowed.
    pub async fn abort(&self) {
        let completion = self.current_completion();
        if !completion.is_complete() {
            let tag = self.tag.get_or_create();
            debug!(consumer_tag = %tag, "cancelling consumer (abort)");
            if let Err(cause) = self.ctx.channel().cancel_consumer(&tag).await {
                debug!(consumer_tag = %tag, error = %cause, "cancellation during abort failed");
            }
        }
        self.rejecting.store(true, Ordering::SeqCst);
        completion.set_complete();
    }

    /// Negative acknowledgment for deliveries that never reach the listener
    /// and for the requeue-on-listener-error path.
    async fn nack(&self, delivery_tag: u64) {
        if self.broker_auto_ack {
            trace!(delivery_tag, "broker auto-ack, skipping negative acknowledgment");
            return;
        }
        self.ctx.explicit_nack(delivery_tag).await;
    }

    /// Negative acknowledgment for the listener's nack-request signal.
    async fn nack_on_nack_request(&self, delivery_tag: u64) {
        if self.broker_auto_ack {
            trace!(delivery_tag, "broker auto-ack, skipping negative acknowledgment");
            return;
        }
        self.ctx.explicit_nack_on_nack_request(delivery_tag).await;
    }

    /// Ordinary settlement after a listener returned normally.
    async fn settle_normal_return(&self, delivery_tag: u64) {
        if self.broker_auto_ack {
            trace!(delivery_tag, "broker auto-ack, no settlement needed");
            return;
        }
        if self.ack_mode.is_auto_ack() {
            self.ctx.acknowledge(delivery_tag).await;
        } else {
            trace!(delivery_tag, "settlement deferred to client acknowledgment");
        }
    }
}

#[async_trait]
impl DeliveryHandler for ListenerConsumer {
    async fn on_delivery(&self, delivery: Delivery) -> Result<()> {
        trace!(
            consumer_tag = %delivery.consumer_tag,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "delivery received"
        );
        let delivery_tag = delivery.delivery_tag;

        if self.rejecting.load(Ordering::SeqCst) {
            debug!(delivery_tag, "consumer is rejecting, negatively acknowledging");
            self.nack(delivery_tag).await;
            return Ok(());
        }

        let Some(listener) = self.listener.as_ref() else {
            debug!(delivery_tag, "no listener registered, negatively acknowledging");
            self.nack(delivery_tag).await;
            return Ok(());
        };

        let message = self.ctx.decode(&delivery)?;

        match self.ctx.deliver(message, listener.as_ref()).await {
            DeliveryOutcome::Success => {
                self.settle_normal_return(delivery_tag).await;
                Ok(())
            }
            DeliveryOutcome::ListenerFailed(ListenerFailure::NackRequested) => {
                debug!(delivery_tag, "listener requested negative acknowledgment");
                self.nack_on_nack_request(delivery_tag).await;
                Ok(())
            }
            DeliveryOutcome::ListenerFailed(ListenerFailure::Ordinary(cause)) => {
                if self.requeue_on_listener_error {
                    warn!(
                        delivery_tag,
                        error = %cause,
                        "listener failed, requeueing delivery and cancelling consumer"
                    );
                    self.nack(delivery_tag).await;
                    self.abort().await;
                } else {
                    // Deliberately left unsettled: with no requeue policy the
                    // delivery stays pending until the channel is lost.
                    warn!(
                        delivery_tag,
                        error = %cause,
                        "listener failed, leaving delivery unsettled"
                    );
                }
                Ok(())
            }
            DeliveryOutcome::NonRecoverable(cause) => {
                error!(delivery_tag, error = %cause, "message delivery failed");
                Err(cause)
            }
        }
    }

    async fn on_cancel_confirmed(&self, consumer_tag: &str) {
        trace!(consumer_tag = %consumer_tag, "cancellation confirmed");
        self.current_completion().set_complete();
    }

    async fn on_cancelled_by_broker(&self, consumer_tag: &str) {
        trace!(consumer_tag = %consumer_tag, "cancelled by broker");
        self.current_completion().set_complete();
    }
}
