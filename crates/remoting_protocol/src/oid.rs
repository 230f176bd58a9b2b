//! Object identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// The identifying part of an [`Oid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OidKey {
    /// A client-created object the server has not persisted yet.
    Transient(Uuid),
    /// A server-assigned persistent key.
    Persistent(String),
}

/// Identity of a domain object on either side of the wire.
///
/// Equality and hashing consider only the [`OidKey`]: two persistent oids
/// are equal iff their keys match, two transient oids iff their markers
/// match, and a transient oid never equals a persistent one. When the
/// server persists a transient object the replacement oid records the old
/// one in [`previous`](Oid::previous); that link, not equality, is how a
/// client retargets its references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oid {
    key: OidKey,
    previous: Option<Box<Oid>>,
}

impl Oid {
    /// Creates a fresh transient oid.
    pub fn transient() -> Self {
        Self {
            key: OidKey::Transient(Uuid::new_v4()),
            previous: None,
        }
    }

    /// Creates a transient oid with a known marker.
    pub fn with_marker(marker: Uuid) -> Self {
        Self {
            key: OidKey::Transient(marker),
            previous: None,
        }
    }

    /// Creates a persistent oid.
    pub fn persistent(key: impl Into<String>) -> Self {
        Self {
            key: OidKey::Persistent(key.into()),
            previous: None,
        }
    }

    /// Creates the persistent oid that replaces `previous`.
    pub fn promoted(key: impl Into<String>, previous: &Oid) -> Self {
        Self {
            key: OidKey::Persistent(key.into()),
            previous: Some(Box::new(previous.without_previous())),
        }
    }

    /// Returns the identifying key.
    pub fn key(&self) -> &OidKey {
        &self.key
    }

    /// Returns the persistent key, if any.
    pub fn persistent_key(&self) -> Option<&str> {
        match &self.key {
            OidKey::Persistent(key) => Some(key),
            OidKey::Transient(_) => None,
        }
    }

    /// Returns true if this oid has not been persisted.
    pub fn is_transient(&self) -> bool {
        matches!(self.key, OidKey::Transient(_))
    }

    /// Returns the oid this one replaced.
    pub fn previous(&self) -> Option<&Oid> {
        self.previous.as_deref()
    }

    /// Returns a copy without the `previous` link.
    pub fn without_previous(&self) -> Oid {
        Oid {
            key: self.key.clone(),
            previous: None,
        }
    }
}

impl PartialEq for Oid {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Oid {}

impl Hash for Oid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            OidKey::Transient(marker) => write!(f, "T:{}", marker.simple()),
            OidKey::Persistent(key) => write!(f, "P:{key}"),
        }
    }
}
