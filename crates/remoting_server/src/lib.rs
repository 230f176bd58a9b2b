//! # Remoting Server
//!
//! Reference server for the remoting object-sync protocol.
//!
//! This crate provides:
//! - An in-memory object store with optimistic versioning
//! - Session management with HMAC-SHA256 signed tokens
//! - Authorization, service and domain action registries
//! - The `ServerFacade` implementation
//! - A frame endpoint and a blocking TCP listener
//!
//! # Architecture
//!
//! Every mutating request runs as one unit of work under a single write
//! lock. Each object it touches gets exactly one new version, and the store
//! is restored if the unit fails. Responses are encoded with a fresh
//! known-objects set, so a graph is always finite on the wire.
//!
//! # Example
//!
//! ```rust,no_run
//! use remoting_protocol::TypeRegistry;
//! use remoting_server::{Listener, RemotingServer, ServerConfig, ServerEndpoint};
//! use std::sync::Arc;
//!
//! let types = TypeRegistry::new()
//!     .with_type("Customer")
//!     .value("name", "String")
//!     .done();
//! let config = ServerConfig::default().with_auth(b"a-long-shared-secret".to_vec());
//! let server = RemotingServer::builder(types).config(config.clone()).build()?;
//!
//! let endpoint = Arc::new(ServerEndpoint::new(Arc::new(server)));
//! Listener::bind(&config, endpoint)?.run()?;
//! # Ok::<(), remoting_server::ServerError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod actions;
mod auth;
mod batch;
mod config;
mod context;
mod encoder;
mod endpoint;
mod error;
mod server;
mod services;
mod store;

pub use actions::{ActionHandler, ActionOutcome, ActionRegistry};
pub use auth::{
    AcceptAny, AllowAll, Authenticator, Authorization, Authorizer, PasswordTable, RuleAuthorizer,
    SessionRegistry,
};
pub use config::ServerConfig;
pub use context::{ActionContext, Effects};
pub use endpoint::{Listener, ListenerHandle, ServerEndpoint};
pub use error::{ServerError, ServerResult};
pub use server::{RemotingServer, ServerBuilder};
pub use services::ServiceRegistry;
pub use store::{ObjectStore, Snapshot, StoredField, StoredObject};
