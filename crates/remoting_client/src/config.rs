//! Configuration for the client.

use remoting_protocol::DEFAULT_MAX_FRAME_LEN;
use std::time::Duration;

/// Configuration for one client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User the session is opened for.
    pub user: String,
    /// Password presented when opening the session.
    pub password: String,
    /// Largest response frame accepted from a stream transport.
    pub max_frame_len: usize,
    /// Read and write timeout of a stream transport.
    ///
    /// A request that times out is reported as a transport failure; it is
    /// never retried.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// Creates a configuration for `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: String::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Sets the maximum frame length.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Sets the transport timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Waits indefinitely for responses.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("anonymous")
    }
}
