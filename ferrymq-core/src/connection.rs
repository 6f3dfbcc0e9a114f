//! Connection-level lifecycle controller.
//!
//! The connection owns the transport connection, the sessions created from
//! it, and the client identifier. Start and stop fan out to every consumer
//! of every session; close tears everything down exactly once. Transport
//! shutdown events arrive on the transport's own thread and are relayed to
//! the application's exception observer only when the application did not
//! cause them.

use crate::config::ConnectionConfig;
use crate::error::{FerryError, Result};
use crate::listener::{ExceptionObserver, ReceiveHook};
use crate::message::{MessageCodec, StandardCodec};
use crate::registry::ClientIdRegistry;
use crate::session::{AckMode, Session, SubscriptionMap};
use crate::transport::{BrokerConnection, ShutdownSignal, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

/// Static description of this client, returned by
/// [`Connection::metadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Client library name.
    pub product: String,
    /// Client library version.
    pub version: String,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self {
            product: "ferrymq".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Relay between transport shutdown events and the application's exception
/// observer.
///
/// Shared with the shutdown callback registered on the transport, so the
/// connection can detach the observer before its own close tears the
/// transport down.
#[derive(Default)]
struct ShutdownRelay {
    observer: RwLock<Option<Arc<dyn ExceptionObserver>>>,
}

impl ShutdownRelay {
    fn set(&self, observer: Option<Arc<dyn ExceptionObserver>>) {
        *self.observer.write().unwrap() = observer;
    }

    fn get(&self) -> Option<Arc<dyn ExceptionObserver>> {
        self.observer.read().unwrap().clone()
    }

    fn handle(&self, signal: ShutdownSignal) {
        if signal.initiated_by_application {
            return;
        }
        let Some(observer) = self.get() else {
            return;
        };
        warn!(reason = %signal, "transport shut down unexpectedly");
        observer.on_exception(FerryError::UnexpectedShutdown {
            reason: signal.reason,
        });
    }
}

/// Constructor arguments for [`Connection`].
///
/// Bundles the transport handle with the pieces the factory layer injects:
/// configuration, the process-wide identifier registry, the payload codec,
/// and the optional receive interception hook.
pub struct ConnectionParams {
    transport: Arc<dyn BrokerConnection>,
    config: ConnectionConfig,
    registry: Arc<ClientIdRegistry>,
    codec: Arc<dyn MessageCodec>,
    receive_hook: Option<ReceiveHook>,
}

impl ConnectionParams {
    /// Starts a parameter set over an established transport connection.
    pub fn new(transport: Arc<dyn BrokerConnection>) -> Self {
        Self {
            transport,
            config: ConnectionConfig::default(),
            registry: Arc::new(ClientIdRegistry::new()),
            codec: Arc::new(StandardCodec),
            receive_hook: None,
        }
    }

    /// Sets the connection configuration.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the process-wide client identifier registry.
    pub fn with_registry(mut self, registry: Arc<ClientIdRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the payload codec.
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the hook invoked with every decoded message before listener
    /// dispatch.
    pub fn with_receive_hook(mut self, hook: ReceiveHook) -> Self {
        self.receive_hook = Some(hook);
        self
    }
}

/// Client connection to a broker.
///
/// # Lifecycle
///
/// A connection is created stopped: consumers exist but reject deliveries
/// until [`start`](Self::start) is called. `start` and `stop` toggle the
/// whole connection; [`close`](Self::close) is terminal and idempotent.
///
/// The client identifier can be assigned at most once, and only before the
/// first operation that reads or changes connection state.
pub struct Connection {
    transport: Arc<dyn BrokerConnection>,
    config: ConnectionConfig,
    codec: Arc<dyn MessageCodec>,
    receive_hook: Option<ReceiveHook>,
    registry: Arc<ClientIdRegistry>,
    client_id: RwLock<Option<String>>,
    can_set_client_id: AtomicBool,
    stopped: Arc<AtomicBool>,
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<Session>>>,
    subscriptions: SubscriptionMap,
    relay: Arc<ShutdownRelay>,
}

impl Connection {
    /// Creates a connection over an established transport connection, using
    /// the standard payload codec.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation.
    pub fn new(
        transport: Arc<dyn BrokerConnection>,
        config: ConnectionConfig,
        registry: Arc<ClientIdRegistry>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::from_params(
            ConnectionParams::new(transport)
                .with_config(config)
                .with_registry(registry),
        )
    }

    /// Creates a connection from a full parameter set.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation.
    pub fn from_params(params: ConnectionParams) -> anyhow::Result<Arc<Self>> {
        params.config.validate()?;

        let relay = Arc::new(ShutdownRelay::default());
        {
            let relay = Arc::clone(&relay);
            params
                .transport
                .on_shutdown(Box::new(move |signal| relay.handle(signal)));
        }

        Ok(Arc::new(Self {
            transport: params.transport,
            config: params.config,
            codec: params.codec,
            receive_hook: params.receive_hook,
            registry: params.registry,
            client_id: RwLock::new(None),
            can_set_client_id: AtomicBool::new(true),
            stopped: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            relay,
        }))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FerryError::Closed);
        }
        Ok(())
    }

    /// Any state-reading or state-mutating operation freezes the ability to
    /// assign a client identifier.
    fn freeze_client_id(&self) {
        self.can_set_client_id.store(false, Ordering::SeqCst);
    }

    /// Whether deliveries are currently paused connection-wide.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether this connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The client identifier, when one has been assigned.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection.
    pub fn client_id(&self) -> Result<Option<String>> {
        self.ensure_open()?;
        self.freeze_client_id();
        Ok(self.client_id.read().unwrap().clone())
    }

    /// Assigns the client identifier.
    ///
    /// Must happen before any other use of the connection, at most once,
    /// and with an identifier no other live connection of this process
    /// holds.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Closed`] on a closed connection
    /// - [`FerryError::IdentifierFrozen`] after first use
    /// - [`FerryError::IdentifierAlreadySet`] on a second assignment
    /// - [`FerryError::IdentifierInUse`] when another connection holds it
    pub fn set_client_id(&self, id: &str) -> Result<()> {
        trace!(client_id = %id, "setting client identifier");
        self.ensure_open()?;
        if !self.can_set_client_id.load(Ordering::SeqCst) {
            return Err(FerryError::IdentifierFrozen);
        }

        let mut slot = self.client_id.write().unwrap();
        if slot.is_some() {
            return Err(FerryError::IdentifierAlreadySet);
        }
        if !self.registry.claim(id) {
            return Err(FerryError::IdentifierInUse(id.to_string()));
        }
        *slot = Some(id.to_string());
        Ok(())
    }

    /// Static client metadata.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection.
    pub fn metadata(&self) -> Result<ConnectionMetadata> {
        self.ensure_open()?;
        self.freeze_client_id();
        Ok(ConnectionMetadata::default())
    }

    /// The registered exception observer, if any.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection.
    pub fn exception_observer(&self) -> Result<Option<Arc<dyn ExceptionObserver>>> {
        self.ensure_open()?;
        self.freeze_client_id();
        Ok(self.relay.get())
    }

    /// Registers (or clears) the observer for unexpected transport
    /// shutdowns.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection.
    pub fn set_exception_observer(
        &self,
        observer: Option<Arc<dyn ExceptionObserver>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.freeze_client_id();
        self.relay.set(observer);
        Ok(())
    }

    /// Creates a session with its own broker channel.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection, or a
    /// transport error when the channel cannot be opened or configured.
    pub async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<Session>> {
        trace!(transacted, ack_mode = ?ack_mode, "creating session");
        self.ensure_open()?;
        self.freeze_client_id();

        let channel = self.transport.create_channel().await?;
        if let Some(prefetch) = self.config.channel_qos {
            channel.set_qos(prefetch).await?;
        }

        let session = Session::new(
            channel,
            Arc::clone(&self.codec),
            self.receive_hook.clone(),
            self.config.clone(),
            transacted,
            ack_mode,
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.stopped),
        );
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    fn session_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().clone()
    }

    /// Starts (or restarts) delivery for every consumer of every session.
    ///
    /// A no-op when the connection is already started. The fan-out is best
    /// effort: a failing consumer does not prevent the others from being
    /// attempted.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection, or the first
    /// per-consumer start failure after the whole fan-out ran.
    pub async fn start(&self) -> Result<()> {
        trace!("starting connection");
        self.ensure_open()?;
        self.freeze_client_id();

        if self
            .stopped
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!("resuming message delivery");
        let mut first_error = None;
        for session in self.session_snapshot() {
            if let Err(cause) = session.resume().await {
                first_error.get_or_insert(cause);
            }
        }
        match first_error {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    /// Pauses delivery for every consumer of every session.
    ///
    /// A no-op when the connection is already stopped. Blocks up to the
    /// configured termination timeout per consumer while cancellations are
    /// confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Closed`] on a closed connection, or the first
    /// per-consumer failure after the whole fan-out ran.
    pub async fn stop(&self) -> Result<()> {
        trace!("stopping connection");
        self.ensure_open()?;
        self.freeze_client_id();

        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!("pausing message delivery");
        let mut first_error = None;
        for session in self.session_snapshot() {
            if let Err(cause) = session.pause().await {
                first_error.get_or_insert(cause);
            }
        }
        match first_error {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    /// Closes the connection, all its sessions, and the transport.
    ///
    /// Idempotent: a second call returns immediately. The exception
    /// observer is detached first so the controlled shutdown that follows
    /// never reaches it, then the client identifier is released, sessions
    /// are closed best effort, and finally the transport connection is
    /// closed. A shutdown signal raised by that close is expected and
    /// swallowed.
    ///
    /// # Errors
    ///
    /// Returns a transport error only when closing the transport fails for
    /// a reason other than a shutdown signal.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing connection");

        self.relay.set(None);

        if let Some(id) = self.client_id.read().unwrap().clone() {
            self.registry.release(&id);
        }

        let sessions: Vec<_> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain(..).collect()
        };
        for session in sessions {
            if let Err(cause) = session.internal_close().await {
                error!(error = %cause, "failed to close session");
            }
        }

        match self.transport.close().await {
            Ok(()) => Ok(()),
            Err(TransportError::Shutdown(signal)) => {
                debug!(reason = %signal, "transport reported shutdown during close");
                Ok(())
            }
            Err(cause) => Err(FerryError::Transport(cause)),
        }
    }

    /// Closes one session on behalf of the application and removes it from
    /// this connection.
    ///
    /// Sessions not owned by this connection are ignored.
    ///
    /// # Errors
    ///
    /// Returns the session's close error, if any.
    pub async fn close_session(&self, session: &Arc<Session>) -> Result<()> {
        trace!("closing session on application request");
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            let before = sessions.len();
            sessions.retain(|owned| !Arc::ptr_eq(owned, session));
            sessions.len() != before
        };
        if removed {
            session.internal_close().await?;
        }
        Ok(())
    }

    /// Number of sessions currently owned by this connection.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
