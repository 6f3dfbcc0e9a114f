//! # ferrymq-core
//!
//! Client-side delivery and acknowledgment engine for broker-backed
//! messaging. Applications consume messages through a connection / session /
//! consumer model with configurable acknowledgment semantics, while the
//! underlying transport pushes deliveries asynchronously over a shared
//! connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Connection                            │
//! │   start / stop / close · client identifier · observer       │
//! │  ┌───────────────┐  ┌───────────────┐                       │
//! │  │    Session    │  │    Session    │   (one channel each)  │
//! │  │ ┌───────────┐ │  │ ┌───────────┐ │                       │
//! │  │ │ Consumer  │ │  │ │ Consumer  │ │   deliveries flow up, │
//! │  │ │ Consumer  │ │  │ └───────────┘ │   control flows down  │
//! │  │ └───────────┘ │  └───────────────┘                       │
//! │  └───────────────┘                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Broker push-deliveries enter through each consumer's
//! [`DeliveryHandler`]; the consumer dispatches to the application's
//! [`MessageListener`] and settles the delivery (acknowledge, negative
//! acknowledge, or deliberately nothing) based on how the listener call
//! ended and the connection's requeue policy.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ferrymq_core::{
//!     AckMode, BrokerConnection, ClientIdRegistry, Connection, ConnectionConfig,
//!     ListenerError, Message, MessageListener,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct PrintListener;
//!
//! #[async_trait]
//! impl MessageListener for PrintListener {
//!     async fn on_message(&self, message: Message) -> Result<(), ListenerError> {
//!         println!("received: {:?}", message.text_body());
//!         Ok(())
//!     }
//! }
//!
//! fn connect_transport() -> Arc<dyn BrokerConnection> {
//!     unimplemented!("provided by a concrete transport crate")
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(ClientIdRegistry::new());
//!     let connection = Connection::new(
//!         connect_transport(),
//!         ConnectionConfig::default(),
//!         registry,
//!     )?;
//!     connection.set_client_id("inventory-worker")?;
//!
//!     let session = connection.create_session(false, AckMode::Auto).await?;
//!     session.create_consumer(Some(Arc::new(PrintListener) as _), false)?;
//!
//!     connection.start().await?;
//!     // ... run until shutdown ...
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod listener;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use completion::{Completion, CompletionTimeout};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionMetadata, ConnectionParams};
pub use consumer::ListenerConsumer;
pub use error::{FerryError, Result};
pub use listener::{
    DeliveryOutcome, ExceptionObserver, ListenerError, ListenerFailure, MessageListener,
    ReceiveHook,
};
pub use message::{CodecError, Message, MessageBody, MessageCodec, StandardCodec};
pub use registry::ClientIdRegistry;
pub use session::{AckMode, Session};
pub use transport::{
    BrokerConnection, Channel, Delivery, DeliveryHandler, ShutdownObserver, ShutdownSignal,
    TransportError,
};
