//! Request-scoped set of objects already placed on the wire.

use crate::oid::Oid;
use std::collections::HashSet;

/// Oids whose full representation has already been emitted in the current
/// exchange.
///
/// An encoder creates one set per request (or per response), consults it
/// before emitting an `ObjectData`/`CollectionData`, and emits an
/// `IdentityData` stub instead when the oid is already present. Sharing the
/// set across exchanges would elide objects the peer never received, so it
/// is never pooled or reused.
#[derive(Debug, Default)]
pub struct KnownObjects {
    placed: HashSet<Oid>,
}

impl KnownObjects {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `oid` as placed. Returns true the first time it is seen.
    pub fn mark(&mut self, oid: &Oid) -> bool {
        if self.placed.contains(oid) {
            return false;
        }
        self.placed.insert(oid.without_previous());
        true
    }

    /// Returns true if `oid` has been placed.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.placed.contains(oid)
    }

    /// Number of placed oids.
    pub fn len(&self) -> usize {
        self.placed.len()
    }

    /// Returns true if nothing has been placed.
    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }
}
