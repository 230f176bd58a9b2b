//! In-memory object store.

use remoting_protocol::{FieldKind, FieldSpec, IdentityData, Oid, Version};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Content of one stored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredField {
    /// Encoded value; `None` when unset.
    Value(Option<String>),
    /// Referenced object; `None` when unset.
    Reference(Option<Oid>),
    /// Referenced elements in order.
    Collection(Vec<Oid>),
}

impl StoredField {
    /// Returns the empty content for a field of `kind`.
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Value => StoredField::Value(None),
            FieldKind::Reference => StoredField::Reference(None),
            FieldKind::Collection => StoredField::Collection(Vec::new()),
        }
    }

    /// Returns every oid this field refers to.
    pub fn references(&self) -> Vec<&Oid> {
        match self {
            StoredField::Value(_) | StoredField::Reference(None) => Vec::new(),
            StoredField::Reference(Some(oid)) => vec![oid],
            StoredField::Collection(elements) => elements.iter().collect(),
        }
    }
}

/// A persistent domain object.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Persistent oid.
    pub oid: Oid,
    /// Type name.
    pub type_name: String,
    /// Current version.
    pub version: Version,
    /// Fields by name.
    pub fields: BTreeMap<String, StoredField>,
}

impl StoredObject {
    /// Creates an object with every declared field empty.
    pub fn blank(oid: Oid, type_name: impl Into<String>, version: Version, specs: &[FieldSpec]) -> Self {
        let fields = specs
            .iter()
            .map(|spec| (spec.name.clone(), StoredField::empty(spec.kind)))
            .collect();
        Self {
            oid,
            type_name: type_name.into(),
            version,
            fields,
        }
    }

    /// Returns the reference form of this object.
    pub fn identity(&self) -> IdentityData {
        IdentityData::new(self.oid.clone(), self.type_name.clone(), Some(self.version.clone()))
    }

    /// Returns the named field.
    pub fn field(&self, name: &str) -> Option<&StoredField> {
        self.fields.get(name)
    }

    /// Returns the named value field's content.
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(StoredField::Value(Some(value))) => Some(value),
            _ => None,
        }
    }

    /// Returns true if any field refers to `target`.
    pub fn refers_to(&self, target: &Oid) -> bool {
        self.fields
            .values()
            .any(|field| field.references().contains(&target))
    }
}

/// Undo data for one open snapshot.
#[derive(Debug, Clone, Default)]
struct Journal {
    next_serial: u64,
    key_counters: HashMap<String, u64>,
    seen: HashSet<u64>,
    /// Prior state of each slot, in first-touch order.
    saved: Vec<(u64, Oid, Option<StoredObject>)>,
}

/// Handle to an open snapshot.
///
/// Pass it back to [`ObjectStore::restore`] or [`ObjectStore::release`].
#[derive(Debug)]
#[must_use]
pub struct Snapshot {
    depth: usize,
}

/// Objects by oid, in insertion order.
///
/// The store is a plain value; the server guards it with a lock and takes
/// a [`snapshot`](Self::snapshot) before a batch so a failed batch can be
/// undone as a whole. A snapshot journals the prior state of each object
/// the first time it is written, so its cost follows the size of the
/// change rather than the size of the store.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: BTreeMap<u64, StoredObject>,
    index: HashMap<Oid, u64>,
    next_serial: u64,
    key_counters: HashMap<String, u64>,
    journals: Vec<Journal>,
}

impl ObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh persistent oid of the form `"{type}#{n}"`.
    pub fn allocate_oid(&mut self, type_name: &str) -> Oid {
        Oid::persistent(self.next_key(type_name))
    }

    /// Allocates the persistent oid replacing the transient `previous`.
    pub fn promote(&mut self, type_name: &str, previous: &Oid) -> Oid {
        Oid::promoted(self.next_key(type_name), previous)
    }

    fn next_key(&mut self, type_name: &str) -> String {
        let next = self.key_counters.entry(type_name.to_string()).or_insert(1);
        let key = format!("{type_name}#{next}");
        *next += 1;
        key
    }

    /// Inserts or replaces an object. Any `previous` link on its oid is
    /// dropped.
    pub fn insert(&mut self, mut object: StoredObject) {
        object.oid = object.oid.without_previous();
        let key = object.oid.clone();
        let serial = match self.index.get(&key) {
            Some(serial) => *serial,
            None => {
                let serial = self.next_serial;
                self.next_serial += 1;
                self.index.insert(key.clone(), serial);
                serial
            }
        };
        self.remember(serial, &key);
        self.objects.insert(serial, object);
    }

    /// Returns the object with `oid`.
    pub fn get(&self, oid: &Oid) -> Option<&StoredObject> {
        self.index.get(oid).and_then(|serial| self.objects.get(serial))
    }

    /// Returns the object with `oid` for mutation.
    pub fn get_mut(&mut self, oid: &Oid) -> Option<&mut StoredObject> {
        let serial = *self.index.get(oid)?;
        self.remember(serial, oid);
        self.objects.get_mut(&serial)
    }

    /// Returns true if `oid` exists.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.index.contains_key(oid)
    }

    /// Removes and returns the object with `oid`.
    pub fn remove(&mut self, oid: &Oid) -> Option<StoredObject> {
        let serial = *self.index.get(oid)?;
        self.remember(serial, oid);
        self.index.remove(oid);
        self.objects.remove(&serial)
    }

    /// Returns the objects that refer to `target`.
    pub fn referrers(&self, target: &Oid) -> Vec<Oid> {
        self.objects
            .values()
            .filter(|object| object.refers_to(target))
            .map(|object| object.oid.clone())
            .collect()
    }

    /// Iterates over instances of `type_name` in insertion order.
    pub fn instances<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a StoredObject> {
        self.objects
            .values()
            .filter(move |object| object.type_name == type_name)
    }

    /// Returns true if any instance of `type_name` exists.
    pub fn has_instances(&self, type_name: &str) -> bool {
        self.instances(type_name).next().is_some()
    }

    /// Returns the number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Starts journaling writes so they can be undone.
    ///
    /// Snapshots nest; each must be ended with [`restore`](Self::restore) or
    /// [`release`](Self::release), innermost first.
    pub fn snapshot(&mut self) -> Snapshot {
        self.journals.push(Journal {
            next_serial: self.next_serial,
            key_counters: self.key_counters.clone(),
            ..Journal::default()
        });
        Snapshot {
            depth: self.journals.len(),
        }
    }

    /// Undoes every write made since `snapshot` was taken.
    pub fn restore(&mut self, snapshot: Snapshot) {
        while self.journals.len() >= snapshot.depth {
            let Some(journal) = self.journals.pop() else {
                break;
            };
            for (serial, oid, before) in journal.saved.into_iter().rev() {
                match before {
                    Some(object) => {
                        self.index.insert(oid, serial);
                        self.objects.insert(serial, object);
                    }
                    None => {
                        self.index.remove(&oid);
                        self.objects.remove(&serial);
                    }
                }
            }
            self.next_serial = journal.next_serial;
            self.key_counters = journal.key_counters;
        }
    }

    /// Keeps every write made since `snapshot` was taken.
    ///
    /// The undo data moves to the enclosing snapshot, if any.
    pub fn release(&mut self, snapshot: Snapshot) {
        while self.journals.len() >= snapshot.depth {
            let Some(journal) = self.journals.pop() else {
                break;
            };
            if let Some(outer) = self.journals.last_mut() {
                for (serial, oid, before) in journal.saved {
                    if outer.seen.insert(serial) {
                        outer.saved.push((serial, oid, before));
                    }
                }
            }
        }
    }

    /// Returns true while a snapshot is open.
    pub fn in_snapshot(&self) -> bool {
        !self.journals.is_empty()
    }

    fn remember(&mut self, serial: u64, oid: &Oid) {
        let Some(journal) = self.journals.last_mut() else {
            return;
        };
        if journal.seen.insert(serial) {
            let before = self.objects.get(&serial).cloned();
            journal.saved.push((serial, oid.clone(), before));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", FieldKind::Value, "String"),
            FieldSpec::new("orders", FieldKind::Collection, "Order"),
        ]
    }

    #[test]
    fn keys_are_allocated_per_type() {
        let mut store = ObjectStore::new();
        assert_eq!(store.allocate_oid("Order"), Oid::persistent("Order#1"));
        assert_eq!(store.allocate_oid("Order"), Oid::persistent("Order#2"));
        assert_eq!(store.allocate_oid("Customer"), Oid::persistent("Customer#1"));
    }

    #[test]
    fn promotion_links_previous() {
        let mut store = ObjectStore::new();
        let transient = Oid::transient();
        let promoted = store.promote("Order", &transient);

        assert_eq!(promoted.persistent_key(), Some("Order#1"));
        assert_eq!(promoted.previous(), Some(&transient));
    }

    #[test]
    fn insert_get_remove() {
        let mut store = ObjectStore::new();
        let oid = store.allocate_oid("Customer");
        store.insert(StoredObject::blank(oid.clone(), "Customer", Version::initial("u"), &specs()));

        assert!(store.contains(&oid));
        assert_eq!(store.get(&oid).unwrap().fields.len(), 2);
        assert!(store.has_instances("Customer"));
        assert!(!store.has_instances("Order"));

        assert!(store.remove(&oid).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn referrers_are_found() {
        let mut store = ObjectStore::new();
        let customer = store.allocate_oid("Customer");
        let order = store.allocate_oid("Order");

        let mut object = StoredObject::blank(customer.clone(), "Customer", Version::initial("u"), &specs());
        object
            .fields
            .insert("orders".into(), StoredField::Collection(vec![order.clone()]));
        store.insert(object);

        assert_eq!(store.referrers(&order), vec![customer]);
    }

    #[test]
    fn restore_undoes_changes() {
        let mut store = ObjectStore::new();
        let first = store.allocate_oid("Customer");
        store.insert(StoredObject::blank(first.clone(), "Customer", Version::initial("u"), &specs()));

        let snapshot = store.snapshot();
        let second = store.allocate_oid("Customer");
        store.insert(StoredObject::blank(second.clone(), "Customer", Version::initial("u"), &specs()));
        store.remove(&first);

        store.restore(snapshot);
        assert!(store.contains(&first));
        assert!(!store.contains(&second));
        assert!(!store.in_snapshot());
        // Keys handed out before the restore are allocated again.
        assert_eq!(store.allocate_oid("Customer"), Oid::persistent("Customer#2"));
    }

    #[test]
    fn journal_keeps_only_touched_objects() {
        let mut store = ObjectStore::new();
        let mut oids = Vec::new();
        for _ in 0..50 {
            let oid = store.allocate_oid("Customer");
            store.insert(StoredObject::blank(oid.clone(), "Customer", Version::initial("u"), &specs()));
            oids.push(oid);
        }

        let target = &oids[7];
        let original = store.get(target).unwrap().version.clone();
        let snapshot = store.snapshot();
        store.get_mut(target).unwrap().version = original.next("alice");
        store.get_mut(target).unwrap().version = original.next("bob");
        assert_eq!(store.journals[0].saved.len(), 1);

        store.restore(snapshot);
        assert_eq!(store.get(target).unwrap().version, original);
        assert_eq!(store.len(), 50);
        let listed: Vec<_> = store.instances("Customer").map(|o| o.oid.clone()).collect();
        assert_eq!(listed, oids);
    }

    #[test]
    fn released_snapshot_folds_into_the_outer_one() {
        let mut store = ObjectStore::new();
        let first = store.allocate_oid("Customer");
        store.insert(StoredObject::blank(first.clone(), "Customer", Version::initial("u"), &specs()));

        let outer = store.snapshot();
        let inner = store.snapshot();
        store.remove(&first);
        store.release(inner);
        assert!(store.in_snapshot());
        assert!(!store.contains(&first));

        store.restore(outer);
        assert!(store.contains(&first));
        assert!(!store.in_snapshot());
    }

    #[test]
    fn instances_keep_insertion_order() {
        let mut store = ObjectStore::new();
        let mut oids = Vec::new();
        for _ in 0..12 {
            let oid = store.allocate_oid("Customer");
            store.insert(StoredObject::blank(oid.clone(), "Customer", Version::initial("u"), &specs()));
            oids.push(oid);
        }
        let listed: Vec<_> = store.instances("Customer").map(|o| o.oid.clone()).collect();
        assert_eq!(listed, oids);
    }
}
