//! Shared fixtures for integration tests: a scripted fake transport that
//! records every registration, cancellation, and settlement call, plus a
//! scripted listener.

#![allow(dead_code)]

use async_trait::async_trait;
use ferrymq_core::{
    Channel, Delivery, DeliveryHandler, ListenerError, Message, MessageListener, ShutdownObserver,
    ShutdownSignal, TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared event journal for asserting cross-component ordering.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Fake channel recording every call the engine makes.
#[derive(Default)]
pub struct RecordingChannel {
    pub registered: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub qos: Mutex<Option<u16>>,
    pub closed: AtomicBool,
    handlers: Mutex<HashMap<String, Arc<dyn DeliveryHandler>>>,
    /// When set, cancellations are confirmed synchronously via
    /// `on_cancel_confirmed` (the broker answering promptly).
    confirm_cancels: AtomicBool,
    fail_next_register: Mutex<Option<TransportError>>,
    fail_cancel: Mutex<Option<TransportError>>,
    journal: Mutex<Option<Journal>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        let channel = Self::default();
        channel.confirm_cancels.store(true, Ordering::SeqCst);
        Arc::new(channel)
    }

    /// Stops confirming cancellations, so `stop` waits out its timeout.
    pub fn withhold_cancel_confirmations(&self) {
        self.confirm_cancels.store(false, Ordering::SeqCst);
    }

    /// Makes the next `register_consumer` call fail with `error`.
    pub fn fail_next_register(&self, error: TransportError) {
        *self.fail_next_register.lock().unwrap() = Some(error);
    }

    /// Makes every `cancel_consumer` call fail with `error` until cleared.
    pub fn fail_cancels(&self, error: TransportError) {
        *self.fail_cancel.lock().unwrap() = Some(error);
    }

    /// Mirrors settlement calls into `journal` for ordering assertions.
    pub fn set_journal(&self, journal: Journal) {
        *self.journal.lock().unwrap() = Some(journal);
    }

    fn record(&self, entry: String) {
        if let Some(journal) = self.journal.lock().unwrap().as_ref() {
            journal.lock().unwrap().push(entry);
        }
    }

    /// Pushes one delivery to the handler registered under `consumer_tag`,
    /// the way the transport's delivery task would.
    pub async fn push(
        &self,
        consumer_tag: &str,
        delivery_tag: u64,
        payload: Vec<u8>,
    ) -> ferrymq_core::Result<()> {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(consumer_tag)
            .cloned()
            .expect("no handler registered under this consumer tag");
        handler
            .on_delivery(Delivery {
                consumer_tag: consumer_tag.to_string(),
                delivery_tag,
                redelivered: false,
                payload,
            })
            .await
    }

    /// The most recently registered consumer tag.
    pub fn last_registered_tag(&self) -> String {
        self.registered
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no consumer registered")
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().unwrap().len()
    }

    pub fn nack_count(&self) -> usize {
        self.nacks.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn register_consumer(
        &self,
        consumer_tag: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        if let Some(error) = self.fail_next_register.lock().unwrap().take() {
            return Err(error);
        }
        self.registered.lock().unwrap().push(consumer_tag.to_string());
        self.handlers
            .lock()
            .unwrap()
            .insert(consumer_tag.to_string(), handler);
        Ok(())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.cancelled.lock().unwrap().push(consumer_tag.to_string());
        if let Some(error) = self.fail_cancel.lock().unwrap().clone() {
            return Err(error);
        }

        let handler = self.handlers.lock().unwrap().remove(consumer_tag);
        if self.confirm_cancels.load(Ordering::SeqCst) {
            if let Some(handler) = handler {
                handler.on_cancel_confirmed(consumer_tag).await;
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.acks.lock().unwrap().push(delivery_tag);
        self.record(format!("ack:{delivery_tag}"));
        Ok(())
    }

    async fn negative_acknowledge(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.nacks.lock().unwrap().push((delivery_tag, requeue));
        self.record(format!("nack:{delivery_tag}"));
        Ok(())
    }

    async fn set_qos(&self, prefetch: u16) -> Result<(), TransportError> {
        *self.qos.lock().unwrap() = Some(prefetch);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fake broker connection handing out [`RecordingChannel`]s.
#[derive(Default)]
pub struct FakeBroker {
    pub channels: Mutex<Vec<Arc<RecordingChannel>>>,
    pub closed: AtomicBool,
    observer: Mutex<Option<ShutdownObserver>>,
    fail_close: Mutex<Option<TransportError>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The channel opened by the most recent `create_session`.
    pub fn last_channel(&self) -> Arc<RecordingChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel created")
    }

    /// Simulates the transport announcing a shutdown.
    pub fn fire_shutdown(&self, signal: ShutdownSignal) {
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer(signal);
        }
    }

    /// Makes the transport-level `close` call fail with `error`.
    pub fn fail_close(&self, error: TransportError) {
        *self.fail_close.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl ferrymq_core::BrokerConnection for FakeBroker {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = RecordingChannel::new();
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn on_shutdown(&self, observer: ShutdownObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(error) = self.fail_close.lock().unwrap().take() {
            return Err(error);
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted listener reaction.
#[derive(Debug, Clone)]
pub enum ListenerScript {
    Succeed,
    RequestNack,
    Fail(&'static str),
    Panic(&'static str),
}

/// Listener that records every invocation and follows a reaction script
/// (defaulting to success once the script is exhausted).
pub struct ScriptedListener {
    pub received: Mutex<Vec<Message>>,
    script: Mutex<VecDeque<ListenerScript>>,
    journal: Mutex<Option<Journal>>,
}

impl ScriptedListener {
    pub fn succeeding() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    pub fn with_script(steps: Vec<ListenerScript>) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            script: Mutex::new(steps.into()),
            journal: Mutex::new(None),
        })
    }

    /// Mirrors invocations into `journal` for ordering assertions.
    pub fn set_journal(&self, journal: Journal) {
        *self.journal.lock().unwrap() = Some(journal);
    }

    pub fn invocations(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageListener for ScriptedListener {
    async fn on_message(&self, message: Message) -> Result<(), ListenerError> {
        if let Some(journal) = self.journal.lock().unwrap().as_ref() {
            journal.lock().unwrap().push("on_message".to_string());
        }
        self.received.lock().unwrap().push(message);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ListenerScript::Succeed);
        match step {
            ListenerScript::Succeed => Ok(()),
            ListenerScript::RequestNack => Err(ListenerError::NackRequested),
            ListenerScript::Fail(reason) => Err(ListenerError::Failure(anyhow::anyhow!(reason))),
            ListenerScript::Panic(reason) => panic!("{reason}"),
        }
    }
}

/// Encodes a text payload the way producers on the wire would.
pub fn text_payload(body: &str) -> Vec<u8> {
    use ferrymq_core::{MessageCodec, StandardCodec};
    StandardCodec.encode(&Message::text(body))
}
