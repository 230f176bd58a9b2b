//! Optimistic-concurrency version stamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A concurrency stamp attached to every persistent object.
///
/// The sequence advances by one on every accepted write. `user` and
/// `time_millis` record who made the write and when; they are carried for
/// diagnostics and never take part in staleness decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    sequence: u64,
    user: String,
    time_millis: u64,
}

impl Version {
    /// Creates a version with explicit fields.
    pub fn new(sequence: u64, user: impl Into<String>, time_millis: u64) -> Self {
        Self {
            sequence,
            user: user.into(),
            time_millis,
        }
    }

    /// The version given to a newly persisted object.
    pub fn initial(user: impl Into<String>) -> Self {
        Self::new(1, user, now_millis())
    }

    /// The version following this one.
    #[must_use]
    pub fn next(&self, user: impl Into<String>) -> Self {
        Self::new(self.sequence + 1, user, now_millis())
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the user who made the write.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the write time in Unix milliseconds.
    pub fn time_millis(&self) -> u64 {
        self.time_millis
    }

    /// Returns true if `local` was not derived from `remote`'s current
    /// state, so a write based on `local` must be rejected.
    pub fn is_stale(local: &Version, remote: &Version) -> bool {
        local.sequence != remote.sequence
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} ({})", self.sequence, self.user)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
