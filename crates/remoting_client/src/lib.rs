//! # Remoting Client
//!
//! Client side of the remoting object-sync protocol.
//!
//! This crate provides:
//! - A local object cache with transient, ghost and resolved objects
//! - Graph encoding and decoding with per-request deduplication
//! - A transaction manager that batches local changes into one exchange
//! - [`ClientPersistor`], the application-facing proxy of the server
//! - [`ProxyFacade`], a sequence-checked `ServerFacade` over a transport
//! - Loopback and TCP transports
//!
//! ## Architecture
//!
//! Mutations only touch the cache and are recorded against the open
//! transaction. Ending the transaction encodes every pending entry with one
//! known-objects set, sends a single `executeClientAction`, then promotes
//! transient objects, applies the returned versions and decodes the server
//! side effects.
//!
//! ## Key Invariants
//!
//! - A transaction with nothing pending makes no request
//! - Each object contributes at most one entry to a batch
//! - A response is accepted only if it answers the outstanding request
//! - A reference the decoder cannot resolve fails the exchange
//!
//! ## Example
//!
//! ```rust,no_run
//! use remoting_client::{ClientConfig, ClientPersistor, LoopbackTransport, ProxyFacade};
//! use remoting_protocol::TypeRegistry;
//! use remoting_server::{RemotingServer, ServerEndpoint};
//! use std::sync::Arc;
//!
//! let types = TypeRegistry::new()
//!     .with_type("Customer")
//!     .value("name", "String")
//!     .done();
//! let server = RemotingServer::builder(types.clone()).build()?;
//! let endpoint = ServerEndpoint::new(Arc::new(server));
//! let proxy = ProxyFacade::new(LoopbackTransport::new(endpoint));
//!
//! let mut persistor = ClientPersistor::new(Arc::new(proxy), Arc::new(types), ClientConfig::new("alice"));
//! persistor.open()?;
//! persistor.start_transaction()?;
//! let ada = persistor.create_transient("Customer")?;
//! persistor.set_value(ada, "name", Some("Ada"))?;
//! persistor.make_persistent(ada)?;
//! persistor.end_transaction()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cache;
mod config;
mod decoder;
mod encoder;
mod error;
mod persistor;
mod proxy;
mod transaction;
mod transport;

pub use cache::{LocalField, LocalObject, LocalRef, ObjectCache, ObjectState};
pub use config::ClientConfig;
pub use decoder::{Decoded, GraphDecoder};
pub use encoder::GraphEncoder;
pub use error::{ClientError, ClientResult};
pub use persistor::{ActionResult, ClientPersistor};
pub use proxy::ProxyFacade;
pub use transaction::{
    EntryConflict, PendingEntry, Recorded, TransactionManager, TransactionOutcome,
};
pub use transport::{LoopbackTransport, StreamTransport, Transport};
