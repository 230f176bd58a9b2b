//! Application of an `executeClientAction` batch.
//!
//! The batch is applied in two passes. The first collects every complete
//! `ObjectData` in the ADD and CHANGE graphs, so a reference to a transient
//! object can be resolved wherever in the batch its state appears. The
//! second applies the ADD and CHANGE entries in order, persists transient
//! objects reached from them (reported as reachable), and only then applies
//! the DELETE entries. An ADD or CHANGE entry whose state already appeared
//! earlier in the batch may be sent as an identity stub.
//!
//! Staleness is always judged against the version an object had before the
//! batch, so the version bump a delete gives to the objects referring to the
//! deleted one never fails a later entry of the same batch.
//!
//! Per-entry outcomes (version conflict, missing object) are results; a
//! reference that cannot be resolved or a malformed entry fails the whole
//! batch and the caller rolls the store back.

use crate::context::ActionContext;
use crate::error::{ServerError, ServerResult};
use crate::store::StoredField;
use remoting_protocol::{
    ClientActionResult, ClientActionType, Data, EntryFailure, FieldKind, IdentityData, ObjectData,
    Oid, Version,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Outcome of a batch that was applied.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub(crate) results: Vec<ClientActionResult>,
    pub(crate) reachable: Vec<IdentityData>,
}

#[derive(Default)]
struct Batch<'d> {
    graphs: HashMap<Oid, &'d ObjectData>,
    promoted: HashMap<Oid, Oid>,
    order: Vec<Oid>,
    pending: VecDeque<Oid>,
    applied: HashSet<Oid>,
}

pub(crate) fn apply_batch(
    ctx: &mut ActionContext<'_>,
    data: &[Data],
    types: &[ClientActionType],
) -> ServerResult<BatchOutcome> {
    if data.len() != types.len() {
        return Err(ServerError::InvalidRequest(format!(
            "{} payloads for {} entry types",
            data.len(),
            types.len()
        )));
    }

    let mut batch = Batch::default();
    for (entry, kind) in data.iter().zip(types) {
        if matches!(kind, ClientActionType::Add | ClientActionType::Change) {
            batch.collect(entry);
        }
    }

    let mut results: Vec<Option<ClientActionResult>> = Vec::with_capacity(data.len());
    let mut deletes = Vec::new();
    let mut added = HashSet::new();
    for (index, (entry, kind)) in data.iter().zip(types).enumerate() {
        let result = match kind {
            ClientActionType::Add => {
                let object = batch.entry_graph(entry, index)?;
                if !object.oid.is_transient() {
                    return Err(ServerError::InvalidRequest(format!(
                        "entry {index}: {} is already persistent",
                        object.oid
                    )));
                }
                added.insert(object.oid.clone());
                batch.add(ctx, object)?
            }
            ClientActionType::Change => {
                let object = batch.entry_graph(entry, index)?;
                batch.change(ctx, object)?
            }
            ClientActionType::Delete => {
                let identity = entry.to_identity().ok_or_else(|| {
                    ServerError::InvalidRequest(format!("entry {index}: delete needs an identity"))
                })?;
                deletes.push((index, identity));
                results.push(None);
                continue;
            }
        };
        trace!(index, ?kind, ?result, "entry applied");
        results.push(Some(result));
    }

    batch.drain(ctx)?;

    for (index, identity) in &deletes {
        let result = delete(ctx, identity)?;
        trace!(index, ?result, "delete applied");
        results[*index] = Some(result);
    }

    let mut outcome = BatchOutcome {
        results: results.into_iter().flatten().collect(),
        ..BatchOutcome::default()
    };

    for transient in &batch.order {
        if added.contains(transient) {
            continue;
        }
        if let Some(promoted) = batch.promoted.get(transient) {
            let stored = ctx.get(promoted)?;
            outcome.reachable.push(IdentityData::new(
                promoted.clone(),
                stored.type_name.clone(),
                Some(stored.version.clone()),
            ));
        }
    }

    debug!(
        entries = outcome.results.len(),
        reachable = outcome.reachable.len(),
        "batch applied"
    );
    Ok(outcome)
}

fn conflict(oid: &Oid, client: Option<&Version>, server: &Version) -> Option<ClientActionResult> {
    match client {
        Some(version) if !Version::is_stale(version, server) => None,
        _ => Some(ClientActionResult::Failed(EntryFailure::VersionConflict {
            oid: oid.clone(),
            expected: client.cloned(),
            actual: server.clone(),
        })),
    }
}

fn delete(ctx: &mut ActionContext<'_>, identity: &IdentityData) -> ServerResult<ClientActionResult> {
    if !ctx.store().contains(&identity.oid) {
        return Ok(ClientActionResult::Failed(EntryFailure::NotFound {
            oid: identity.oid.clone(),
        }));
    }
    let current = ctx.version_before(&identity.oid)?;
    if let Some(failure) = conflict(&identity.oid, identity.version.as_ref(), &current) {
        return Ok(failure);
    }
    ctx.destroy(&identity.oid)?;
    Ok(ClientActionResult::Deleted)
}

impl<'d> Batch<'d> {
    fn collect(&mut self, data: &'d Data) {
        match data {
            Data::Object(object) => {
                if let Some(fields) = object.fields() {
                    if !self.graphs.contains_key(&object.oid) {
                        self.graphs.insert(object.oid.clone(), object);
                    }
                    for field in fields {
                        self.collect(field);
                    }
                }
            }
            Data::Collection(collection) => {
                for element in collection.elements().unwrap_or_default() {
                    self.collect(element);
                }
            }
            Data::Null(_) | Data::Encodable(_) | Data::Identity(_) => {}
        }
    }

    /// Returns the state sent for an ADD or CHANGE entry.
    fn entry_graph(&self, entry: &'d Data, index: usize) -> ServerResult<&'d ObjectData> {
        match entry {
            Data::Object(object) if object.has_complete_data() => Ok(object),
            Data::Object(_) | Data::Identity(_) => entry
                .oid()
                .and_then(|oid| self.graphs.get(oid).copied())
                .ok_or_else(|| {
                    ServerError::InvalidRequest(format!(
                        "entry {index}: no state sent for {}",
                        entry.type_name()
                    ))
                }),
            other => Err(ServerError::InvalidRequest(format!(
                "entry {index}: expected object data, got {}",
                other.type_name()
            ))),
        }
    }

    /// Maps a wire oid to the stored oid, persisting a transient object on
    /// first reference.
    fn resolve(&mut self, ctx: &mut ActionContext<'_>, oid: &Oid) -> ServerResult<Oid> {
        if !oid.is_transient() {
            return if ctx.store().contains(oid) {
                Ok(oid.without_previous())
            } else {
                Err(ServerError::DanglingReference(oid.clone()))
            };
        }
        if let Some(promoted) = self.promoted.get(oid) {
            return Ok(promoted.without_previous());
        }
        let graph = self
            .graphs
            .get(oid)
            .ok_or_else(|| ServerError::DanglingReference(oid.clone()))?;
        let promoted = ctx.create_promoted(&graph.type_name, oid)?;
        self.promoted.insert(oid.clone(), promoted.clone());
        self.order.push(oid.clone());
        self.pending.push_back(oid.clone());
        Ok(promoted.without_previous())
    }

    fn add(&mut self, ctx: &mut ActionContext<'_>, object: &'d ObjectData) -> ServerResult<ClientActionResult> {
        let target = self.resolve(ctx, &object.oid)?;
        if self.applied.insert(object.oid.clone()) {
            self.apply(ctx, object, &target)?;
        }
        let promoted = self
            .promoted
            .get(&object.oid)
            .cloned()
            .unwrap_or_else(|| target.clone());
        let stored = ctx.get(&target)?;
        Ok(ClientActionResult::Persisted(IdentityData::new(
            promoted,
            stored.type_name.clone(),
            Some(stored.version.clone()),
        )))
    }

    fn change(&mut self, ctx: &mut ActionContext<'_>, object: &'d ObjectData) -> ServerResult<ClientActionResult> {
        if object.oid.is_transient() {
            return Err(ServerError::InvalidRequest(format!(
                "cannot change transient {}",
                object.oid
            )));
        }
        if !ctx.store().contains(&object.oid) {
            return Ok(ClientActionResult::Failed(EntryFailure::NotFound {
                oid: object.oid.clone(),
            }));
        }
        let current = ctx.version_before(&object.oid)?;
        if let Some(failure) = conflict(&object.oid, object.version.as_ref(), &current) {
            debug!(oid = %object.oid, "stale change rejected");
            return Ok(failure);
        }
        self.apply(ctx, object, &object.oid)?;
        Ok(ClientActionResult::Changed(ctx.get(&object.oid)?.version.clone()))
    }

    /// Persists transient objects referenced by applied entries.
    fn drain(&mut self, ctx: &mut ActionContext<'_>) -> ServerResult<()> {
        while let Some(transient) = self.pending.pop_front() {
            if !self.applied.insert(transient.clone()) {
                continue;
            }
            let graph = self
                .graphs
                .get(&transient)
                .copied()
                .ok_or_else(|| ServerError::DanglingReference(transient.clone()))?;
            let target = self.resolve(ctx, &transient)?;
            self.apply(ctx, graph, &target)?;
        }
        Ok(())
    }

    /// Copies the field content of `object` onto the stored `target`.
    fn apply(&mut self, ctx: &mut ActionContext<'_>, object: &'d ObjectData, target: &Oid) -> ServerResult<()> {
        let specs = ctx.specs(&object.type_name)?;
        let fields = object.fields().unwrap_or_default();
        if fields.len() != specs.len() {
            return Err(ServerError::InvalidRequest(format!(
                "{} carries {} fields, {} declared",
                object.oid,
                fields.len(),
                specs.len()
            )));
        }

        for (spec, data) in specs.iter().zip(fields) {
            let content = match (spec.kind, data) {
                (kind, Data::Null(_)) => StoredField::empty(kind),
                (FieldKind::Value, Data::Encodable(value)) => {
                    StoredField::Value(Some(value.encoded.clone()))
                }
                (FieldKind::Reference, Data::Identity(_) | Data::Object(_)) => {
                    match data.oid() {
                        Some(oid) => StoredField::Reference(Some(self.resolve(ctx, oid)?)),
                        None => StoredField::Reference(None),
                    }
                }
                (FieldKind::Collection, Data::Collection(collection)) => {
                    let Some(elements) = collection.elements() else {
                        // Not loaded by the client; keep the stored elements.
                        continue;
                    };
                    let mut resolved = Vec::with_capacity(elements.len());
                    for element in elements {
                        let oid = element.oid().ok_or_else(|| {
                            ServerError::InvalidRequest(format!(
                                "{}.{} holds a non-object element",
                                object.type_name, spec.name
                            ))
                        })?;
                        resolved.push(self.resolve(ctx, oid)?);
                    }
                    StoredField::Collection(resolved)
                }
                (kind, other) => {
                    return Err(ServerError::InvalidRequest(format!(
                        "{}.{} is a {kind:?} field but got {}",
                        object.type_name,
                        spec.name,
                        other.type_name()
                    )))
                }
            };
            ctx.replace_field(target, &spec.name, content)?;
        }
        ctx.touch(target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;
    use remoting_protocol::{CollectionData, TypeRegistry};

    fn types() -> TypeRegistry {
        TypeRegistry::new()
            .with_type("Customer")
            .value("name", "String")
            .collection("orders", "Order")
            .done()
            .with_type("Order")
            .value("number", "Int")
            .reference("customer", "Customer")
            .done()
    }

    fn order(oid: &Oid, number: &str, customer: Data) -> Data {
        Data::Object(ObjectData::complete(
            oid.clone(),
            "Order",
            None,
            vec![Data::value("Int", number), customer],
        ))
    }

    #[test]
    fn transient_cycle_is_persisted_once() {
        let types = types();
        let mut store = ObjectStore::new();
        let customer = Oid::transient();
        let first = Oid::transient();

        let graph = Data::Object(ObjectData::complete(
            customer.clone(),
            "Customer",
            None,
            vec![
                Data::value("String", "Ada"),
                Data::Collection(CollectionData::with_elements(
                    Oid::transient(),
                    "Order",
                    None,
                    vec![order(
                        &first,
                        "1",
                        Data::Identity(IdentityData::new(customer.clone(), "Customer", None)),
                    )],
                )),
            ],
        ));

        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let outcome = apply_batch(&mut ctx, &[graph], &[ClientActionType::Add]).unwrap();
        ctx.finish();

        let persisted = match &outcome.results[0] {
            ClientActionResult::Persisted(identity) => identity.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(persisted.oid.persistent_key(), Some("Customer#1"));
        assert_eq!(persisted.oid.previous(), Some(&customer));
        assert_eq!(outcome.reachable.len(), 1);
        assert_eq!(outcome.reachable[0].oid.previous(), Some(&first));

        let order_oid = outcome.reachable[0].oid.without_previous();
        let stored = store.get(&order_oid).unwrap();
        assert_eq!(
            stored.field("customer"),
            Some(&StoredField::Reference(Some(persisted.oid.without_previous())))
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn entry_already_sent_inside_another_graph() {
        let types = types();
        let mut store = ObjectStore::new();
        let customer = Oid::transient();
        let first = Oid::transient();

        let customer_graph = Data::Object(ObjectData::complete(
            customer.clone(),
            "Customer",
            None,
            vec![Data::value("String", "Ada"), Data::null("Order")],
        ));
        let entries = [
            order(&first, "1", customer_graph),
            Data::Identity(IdentityData::new(customer.clone(), "Customer", None)),
        ];

        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let outcome = apply_batch(
            &mut ctx,
            &entries,
            &[ClientActionType::Add, ClientActionType::Add],
        )
        .unwrap();
        ctx.finish();

        assert!(matches!(
            &outcome.results[1],
            ClientActionResult::Persisted(identity) if identity.oid.previous() == Some(&customer)
        ));
        assert!(outcome.reachable.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unresolvable_reference_fails_the_batch() {
        let types = types();
        let mut store = ObjectStore::new();
        let stray = Data::Identity(IdentityData::new(Oid::transient(), "Customer", None));

        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let err = apply_batch(
            &mut ctx,
            &[order(&Oid::transient(), "7", stray)],
            &[ClientActionType::Add],
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::DanglingReference(_)));
    }

    #[test]
    fn stale_change_and_missing_delete_are_entry_failures() {
        let types = types();
        let mut store = ObjectStore::new();
        let customer = {
            let mut ctx = ActionContext::new(&mut store, &types, "setup");
            ctx.create("Customer").unwrap()
        };
        let current = store.get(&customer).unwrap().version.clone();
        let stale = Version::new(current.sequence() + 5, "elsewhere", 0);

        let change = Data::Object(ObjectData::complete(
            customer.clone(),
            "Customer",
            Some(stale.clone()),
            vec![Data::value("String", "Bob"), Data::null("Order")],
        ));
        let missing = Data::Identity(IdentityData::new(
            Oid::persistent("Order#42"),
            "Order",
            Some(Version::initial("x")),
        ));

        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let outcome = apply_batch(
            &mut ctx,
            &[change, missing],
            &[ClientActionType::Change, ClientActionType::Delete],
        )
        .unwrap();
        let effects = ctx.finish();

        assert_eq!(
            outcome.results[0],
            ClientActionResult::Failed(EntryFailure::VersionConflict {
                oid: customer.clone(),
                expected: Some(stale),
                actual: current.clone(),
            })
        );
        assert!(matches!(
            outcome.results[1],
            ClientActionResult::Failed(EntryFailure::NotFound { .. })
        ));
        assert!(effects.changed.is_empty());
        assert_eq!(store.get(&customer).unwrap().version, current);
    }

    fn customer_with_order(store: &mut ObjectStore, types: &TypeRegistry) -> (IdentityData, IdentityData) {
        let mut ctx = ActionContext::new(store, types, "setup");
        let customer = ctx.create("Customer").unwrap();
        let order = ctx.create("Order").unwrap();
        ctx.set_reference(&order, "customer", Some(customer.clone())).unwrap();
        ctx.add_element(&customer, "orders", order.clone()).unwrap();
        ctx.finish();
        (store.get(&customer).unwrap().identity(), store.get(&order).unwrap().identity())
    }

    #[test]
    fn delete_does_not_make_a_later_change_stale() {
        let types = types();
        let mut store = ObjectStore::new();
        let (customer, order) = customer_with_order(&mut store, &types);
        let before = order.version.clone().unwrap();

        let change = Data::Object(ObjectData::complete(
            order.oid.clone(),
            "Order",
            Some(before.clone()),
            vec![
                Data::value("Int", "2"),
                Data::Identity(customer.clone()),
            ],
        ));
        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let outcome = apply_batch(
            &mut ctx,
            &[Data::Identity(customer.clone()), change],
            &[ClientActionType::Delete, ClientActionType::Change],
        )
        .unwrap();
        let effects = ctx.finish();

        assert_eq!(outcome.results[0], ClientActionResult::Deleted);
        let ClientActionResult::Changed(version) = &outcome.results[1] else {
            panic!("unexpected {:?}", outcome.results[1]);
        };
        assert_eq!(version.sequence(), before.sequence() + 1);

        let stored = store.get(&order.oid).unwrap();
        assert_eq!(&stored.version, version);
        assert_eq!(stored.value("number"), Some("2"));
        assert_eq!(stored.field("customer"), Some(&StoredField::Reference(None)));
        assert!(!store.contains(&customer.oid));
        assert_eq!(effects.disposed.len(), 1);
    }

    #[test]
    fn deleting_objects_that_refer_to_each_other() {
        let types = types();
        let mut store = ObjectStore::new();
        let (customer, order) = customer_with_order(&mut store, &types);

        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        let outcome = apply_batch(
            &mut ctx,
            &[Data::Identity(order), Data::Identity(customer)],
            &[ClientActionType::Delete, ClientActionType::Delete],
        )
        .unwrap();
        ctx.finish();

        assert_eq!(
            outcome.results,
            vec![ClientActionResult::Deleted, ClientActionResult::Deleted]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let types = types();
        let mut store = ObjectStore::new();
        let mut ctx = ActionContext::new(&mut store, &types, "alice");
        assert!(matches!(
            apply_batch(&mut ctx, &[], &[ClientActionType::Delete]),
            Err(ServerError::InvalidRequest(_))
        ));
    }
}
