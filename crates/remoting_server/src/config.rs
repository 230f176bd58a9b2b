//! Server configuration.

use remoting_protocol::DEFAULT_MAX_FRAME_LEN;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the remoting server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: SocketAddr,
    /// Maximum number of entries in one `executeClientAction` batch.
    pub max_batch_entries: usize,
    /// Maximum length of an incoming frame.
    pub max_frame_len: usize,
    /// Whether `openSession` checks passwords with the configured
    /// authenticator. When false any non-empty user name is accepted.
    pub require_auth: bool,
    /// Secret for signing session tokens. A random one is generated when
    /// absent.
    pub auth_secret: Option<Vec<u8>>,
    /// How long a session stays valid after it was opened.
    pub session_expiry: Duration,
    /// Properties returned by `getProperties`.
    pub properties: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_batch_entries: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            require_auth: false,
            auth_secret: None,
            session_expiry: Duration::from_secs(8 * 60 * 60),
            properties: BTreeMap::new(),
        }
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_entries(mut self, max: usize) -> Self {
        self.max_batch_entries = max;
        self
    }

    /// Sets the maximum frame length.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Enables password checks and signs tokens with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the session expiry.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Adds a property reported by `getProperties`.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7470)))
    }
}
