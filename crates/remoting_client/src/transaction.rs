//! Client-side transaction manager.
//!
//! A transaction collects ADD, CHANGE and DELETE events against cached
//! objects and commits them as a single `executeClientAction` exchange.
//!
//! ```text
//! Idle --start--> Open --record*--> Open --end--> (one round trip) --> Idle
//!                   \--abort--> Idle
//! ```
//!
//! Each object contributes at most one entry, kept in the order the object
//! was first touched. Later events fold into the existing entry:
//!
//! | pending | event  | result  |
//! |---------|--------|---------|
//! | ADD     | CHANGE | ADD     |
//! | ADD     | DELETE | dropped |
//! | CHANGE  | CHANGE | CHANGE  |
//! | CHANGE  | DELETE | DELETE  |
//! | DELETE  | any    | DELETE  |

use crate::cache::{LocalRef, ObjectCache};
use crate::decoder::GraphDecoder;
use crate::encoder::GraphEncoder;
use crate::error::{ClientError, ClientResult};
use remoting_protocol::{
    AuthenticationSession, ClientActionResult, ClientActionType, EntryFailure,
    ExecuteClientActionRequest, ExecuteClientActionResponse, FieldOrderProvider, ServerFacade,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Idle,
    Open,
}

/// One pending batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    /// Object the entry is for.
    pub object: LocalRef,
    /// Aggregated event.
    pub kind: ClientActionType,
}

/// What became of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The object has an entry in the batch.
    Pending(ClientActionType),
    /// A pending ADD met a DELETE; the object will never reach the server.
    Cancelled,
}

/// An entry the server refused.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryConflict {
    /// Object of the refused entry.
    pub object: LocalRef,
    /// Reason given by the server.
    pub failure: EntryFailure,
}

/// Result of ending a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOutcome {
    /// Exchanges made with the server: 0 or 1.
    pub round_trips: usize,
    /// Objects that became persistent, entries and reachable ones.
    pub persisted: Vec<LocalRef>,
    /// Objects whose change was accepted.
    pub changed: Vec<LocalRef>,
    /// Objects deleted.
    pub deleted: Vec<LocalRef>,
    /// Entries refused by the server.
    pub conflicts: Vec<EntryConflict>,
}

impl TransactionOutcome {
    /// Returns true if every entry was accepted.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Accumulates the changes of one session.
#[derive(Debug)]
pub struct TransactionManager {
    state: TransactionState,
    entries: Vec<PendingEntry>,
}

impl TransactionManager {
    /// Creates an idle manager.
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            entries: Vec::new(),
        }
    }

    /// Opens a transaction.
    pub fn start(&mut self) -> ClientResult<()> {
        if self.is_open() {
            return Err(ClientError::TransactionAlreadyOpen);
        }
        self.state = TransactionState::Open;
        Ok(())
    }

    /// Returns true while a transaction is open.
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Returns the pending entries in batch order.
    pub fn pending(&self) -> &[PendingEntry] {
        &self.entries
    }

    /// Records an event against `object`.
    pub fn record(&mut self, object: LocalRef, kind: ClientActionType) -> ClientResult<Recorded> {
        if !self.is_open() {
            return Err(ClientError::NotInTransaction);
        }
        let Some(position) = self.entries.iter().position(|e| e.object == object) else {
            self.entries.push(PendingEntry { object, kind });
            return Ok(Recorded::Pending(kind));
        };

        let folded = match (self.entries[position].kind, kind) {
            (ClientActionType::Add, ClientActionType::Delete) => {
                self.entries.remove(position);
                return Ok(Recorded::Cancelled);
            }
            (ClientActionType::Add, _) => ClientActionType::Add,
            (ClientActionType::Delete, _) | (_, ClientActionType::Delete) => {
                ClientActionType::Delete
            }
            (ClientActionType::Change, _) => ClientActionType::Change,
        };
        self.entries[position].kind = folded;
        Ok(Recorded::Pending(folded))
    }

    /// Discards the transaction without contacting the server.
    ///
    /// Returns the entries that were pending.
    pub fn abort(&mut self) -> ClientResult<Vec<PendingEntry>> {
        if !self.is_open() {
            return Err(ClientError::NoTransaction);
        }
        self.state = TransactionState::Idle;
        Ok(std::mem::take(&mut self.entries))
    }

    /// Commits the transaction.
    ///
    /// With nothing pending no request is made. Otherwise every entry goes
    /// out in one request, encoded with a single known-objects set, and the
    /// response is reconciled into `cache`. If the request itself fails the
    /// transaction stays open with its entries, so the caller may retry or
    /// abort.
    pub fn end(
        &mut self,
        facade: &dyn ServerFacade,
        session: &AuthenticationSession,
        cache: &mut ObjectCache,
        types: &dyn FieldOrderProvider,
    ) -> ClientResult<TransactionOutcome> {
        if !self.is_open() {
            return Err(ClientError::NoTransaction);
        }
        if self.entries.is_empty() {
            self.state = TransactionState::Idle;
            debug!("transaction ended with nothing to commit");
            return Ok(TransactionOutcome::default());
        }

        let request = self.request(session, cache, types)?;
        let response = facade.execute_client_action(request)?;

        self.state = TransactionState::Idle;
        let entries = std::mem::take(&mut self.entries);
        let outcome = reconcile(&entries, response, cache, types)?;
        info!(
            entries = entries.len(),
            persisted = outcome.persisted.len(),
            changed = outcome.changed.len(),
            deleted = outcome.deleted.len(),
            conflicts = outcome.conflicts.len(),
            "transaction committed"
        );
        Ok(outcome)
    }

    fn request(
        &self,
        session: &AuthenticationSession,
        cache: &ObjectCache,
        types: &dyn FieldOrderProvider,
    ) -> ClientResult<ExecuteClientActionRequest> {
        let dirty: HashSet<LocalRef> = self
            .entries
            .iter()
            .filter(|e| e.kind != ClientActionType::Delete)
            .map(|e| e.object)
            .collect();
        let mut encoder = GraphEncoder::new(cache, types, &dirty);

        let mut data = Vec::with_capacity(self.entries.len());
        let mut kinds = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            data.push(match entry.kind {
                ClientActionType::Delete => encoder.identity(entry.object)?,
                ClientActionType::Add | ClientActionType::Change => encoder.entry(entry.object)?,
            });
            kinds.push(entry.kind);
        }
        debug!(entries = data.len(), placed = encoder.placed(), "batch encoded");

        Ok(ExecuteClientActionRequest {
            session: session.clone(),
            data,
            types: kinds,
        })
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn reconcile(
    entries: &[PendingEntry],
    response: ExecuteClientActionResponse,
    cache: &mut ObjectCache,
    types: &dyn FieldOrderProvider,
) -> ClientResult<TransactionOutcome> {
    if response.results.len() != entries.len() {
        return Err(ClientError::unexpected(format!(
            "{} results for {} entries",
            response.results.len(),
            entries.len()
        )));
    }

    let mut outcome = TransactionOutcome {
        round_trips: 1,
        ..TransactionOutcome::default()
    };
    for (entry, result) in entries.iter().zip(response.results) {
        match (entry.kind, result) {
            (ClientActionType::Add, ClientActionResult::Persisted(identity)) => {
                cache.retarget(entry.object, identity.oid, identity.version)?;
                outcome.persisted.push(entry.object);
            }
            (ClientActionType::Change, ClientActionResult::Changed(version)) => {
                cache.get_mut(entry.object)?.set_version(Some(version));
                outcome.changed.push(entry.object);
            }
            (ClientActionType::Delete, ClientActionResult::Deleted) => {
                cache.dispose(entry.object)?;
                outcome.deleted.push(entry.object);
            }
            (kind, ClientActionResult::Failed(failure)) => {
                warn!(?kind, oid = %failure.oid(), ?failure, "entry refused");
                if let EntryFailure::VersionConflict { actual, .. } = &failure {
                    cache.observe(entry.object, Some(actual))?;
                }
                outcome.conflicts.push(EntryConflict {
                    object: entry.object,
                    failure,
                });
            }
            (kind, other) => {
                return Err(ClientError::unexpected(format!(
                    "{kind:?} entry answered with {other:?}"
                )))
            }
        }
    }

    for identity in response.reachable {
        let previous = identity.oid.previous().cloned().ok_or_else(|| {
            ClientError::unexpected(format!("reachable {} has no previous oid", identity.oid))
        })?;
        let r = cache
            .lookup(&previous)
            .ok_or(ClientError::DanglingReference(previous))?;
        cache.retarget(r, identity.oid, identity.version)?;
        outcome.persisted.push(r);
    }

    GraphDecoder::new(cache, types).changes(&response.changes)?;
    Ok(outcome)
}
