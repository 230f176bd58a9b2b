//! Local object cache.
//!
//! Objects live in an arena addressed by [`LocalRef`]. The oid index is
//! separate, so when the server promotes a transient object only the index
//! entry changes and every handle held by the application, and every
//! reference field pointing at the object, follows automatically.

use crate::error::{ClientError, ClientResult};
use remoting_protocol::{FieldKind, FieldSpec, Oid, Version};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Handle to an object in an [`ObjectCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalRef(usize);

impl LocalRef {
    /// Returns the arena slot.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Lifecycle of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Created locally, not yet known to the server.
    Transient,
    /// Known by identity only; fields must be loaded before use.
    Ghost,
    /// Fields reflect the last state received or sent.
    Resolved,
    /// Destroyed.
    Disposed,
}

/// Content of one cached field.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalField {
    /// Encoded value, `None` when empty.
    Value(Option<String>),
    /// Referenced object.
    Reference(Option<LocalRef>),
    /// Elements, `None` until loaded.
    Collection(Option<Vec<LocalRef>>),
}

impl LocalField {
    /// Returns the empty content of a field of `kind`.
    ///
    /// A fresh collection is loaded and empty.
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Value => LocalField::Value(None),
            FieldKind::Reference => LocalField::Reference(None),
            FieldKind::Collection => LocalField::Collection(Some(Vec::new())),
        }
    }
}

/// A cached domain object.
#[derive(Debug, Clone)]
pub struct LocalObject {
    oid: Oid,
    type_name: String,
    version: Option<Version>,
    state: ObjectState,
    fields: BTreeMap<String, LocalField>,
}

impl LocalObject {
    /// Returns the oid. After promotion it links to the transient oid.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Returns the type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the last known version.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Returns true if the object has not been persisted.
    pub fn is_transient(&self) -> bool {
        self.state == ObjectState::Transient
    }

    /// Returns true if the object has been destroyed.
    pub fn is_disposed(&self) -> bool {
        self.state == ObjectState::Disposed
    }

    /// Returns the content of `field`.
    pub fn field(&self, field: &str) -> Option<&LocalField> {
        self.fields.get(field)
    }

    /// Returns the value of a value field.
    pub fn value(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(LocalField::Value(Some(value))) => Some(value),
            _ => None,
        }
    }

    /// Returns the target of a reference field.
    pub fn reference(&self, field: &str) -> Option<LocalRef> {
        match self.fields.get(field) {
            Some(LocalField::Reference(target)) => *target,
            _ => None,
        }
    }

    /// Returns the elements of a loaded collection field.
    pub fn elements(&self, field: &str) -> Option<&[LocalRef]> {
        match self.fields.get(field) {
            Some(LocalField::Collection(Some(elements))) => Some(elements),
            _ => None,
        }
    }

    pub(crate) fn set_field(&mut self, field: &str, content: LocalField) {
        self.fields.insert(field.to_string(), content);
    }

    pub(crate) fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }
}

/// Every object the client holds.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: Vec<LocalObject>,
    index: HashMap<Oid, LocalRef>,
}

impl ObjectCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of objects ever cached, disposed ones included.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Finds the object currently known by `oid`.
    pub fn lookup(&self, oid: &Oid) -> Option<LocalRef> {
        self.index.get(oid).copied()
    }

    /// Returns the object behind `r`.
    pub fn get(&self, r: LocalRef) -> ClientResult<&LocalObject> {
        self.objects.get(r.0).ok_or(ClientError::UnknownObject(r))
    }

    pub(crate) fn get_mut(&mut self, r: LocalRef) -> ClientResult<&mut LocalObject> {
        self.objects.get_mut(r.0).ok_or(ClientError::UnknownObject(r))
    }

    /// Returns the object behind `r`, failing if it was disposed.
    pub fn live(&self, r: LocalRef) -> ClientResult<&LocalObject> {
        let object = self.get(r)?;
        if object.is_disposed() {
            return Err(ClientError::Disposed(object.oid.clone()));
        }
        Ok(object)
    }

    /// Iterates over live objects.
    pub fn iter(&self) -> impl Iterator<Item = (LocalRef, &LocalObject)> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, object)| !object.is_disposed())
            .map(|(slot, object)| (LocalRef(slot), object))
    }

    /// Creates a transient object with empty fields.
    pub fn create_transient(&mut self, type_name: &str, specs: &[FieldSpec]) -> LocalRef {
        let fields = specs
            .iter()
            .map(|spec| (spec.name.clone(), LocalField::empty(spec.kind)))
            .collect();
        self.push(LocalObject {
            oid: Oid::transient(),
            type_name: type_name.to_string(),
            version: None,
            state: ObjectState::Transient,
            fields,
        })
    }

    /// Returns the object known by `oid`, creating a ghost if there is none.
    pub fn ghost(&mut self, oid: &Oid, type_name: &str, version: Option<Version>) -> LocalRef {
        if let Some(r) = self.lookup(oid) {
            return r;
        }
        trace!(%oid, type_name, "ghost created");
        self.push(LocalObject {
            oid: oid.clone(),
            type_name: type_name.to_string(),
            version,
            state: ObjectState::Ghost,
            fields: BTreeMap::new(),
        })
    }

    fn push(&mut self, object: LocalObject) -> LocalRef {
        let r = LocalRef(self.objects.len());
        self.index.insert(object.oid.without_previous(), r);
        self.objects.push(object);
        r
    }

    /// Replaces the whole state of `r` with state received from the server.
    pub(crate) fn resolve(
        &mut self,
        r: LocalRef,
        version: Option<Version>,
        fields: BTreeMap<String, LocalField>,
    ) -> ClientResult<()> {
        let object = self.get_mut(r)?;
        object.version = version;
        object.fields = fields;
        object.state = ObjectState::Resolved;
        Ok(())
    }

    /// Notes the version of `r` seen in a stub.
    ///
    /// A resolved object whose version moved on becomes a ghost again so
    /// that it is reloaded before use.
    pub(crate) fn observe(&mut self, r: LocalRef, version: Option<&Version>) -> ClientResult<()> {
        let object = self.get_mut(r)?;
        match object.state {
            ObjectState::Ghost if version.is_some() => {
                object.version = version.cloned();
            }
            ObjectState::Resolved => {
                if let (Some(local), Some(remote)) = (&object.version, version) {
                    if Version::is_stale(local, remote) {
                        trace!(oid = %object.oid, "stale copy invalidated");
                        object.state = ObjectState::Ghost;
                        object.version = Some(remote.clone());
                        object.fields.clear();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Drops the local state of a resolved object so it is reloaded.
    pub(crate) fn invalidate(&mut self, r: LocalRef) -> ClientResult<()> {
        let object = self.get_mut(r)?;
        if object.state == ObjectState::Resolved {
            object.state = ObjectState::Ghost;
            object.fields.clear();
        }
        Ok(())
    }

    /// Moves `r` to the persistent `oid` assigned by the server.
    ///
    /// `oid` keeps its `previous` link, so the object still records the
    /// transient oid it had.
    pub fn retarget(&mut self, r: LocalRef, oid: Oid, version: Option<Version>) -> ClientResult<()> {
        let old = self.get(r)?.oid.without_previous();
        if self.index.get(&old) == Some(&r) {
            self.index.remove(&old);
        }
        self.index.insert(oid.without_previous(), r);

        let object = self.get_mut(r)?;
        trace!(from = %old, to = %oid, "object retargeted");
        object.oid = oid;
        object.version = version;
        object.state = ObjectState::Resolved;
        Ok(())
    }

    /// Marks `r` disposed and detaches every cached reference to it.
    pub fn dispose(&mut self, r: LocalRef) -> ClientResult<()> {
        let oid = self.get(r)?.oid.without_previous();
        if self.index.get(&oid) == Some(&r) {
            self.index.remove(&oid);
        }
        for object in &mut self.objects {
            for field in object.fields.values_mut() {
                match field {
                    LocalField::Reference(target) if *target == Some(r) => *target = None,
                    LocalField::Collection(Some(elements)) => elements.retain(|e| *e != r),
                    _ => {}
                }
            }
        }
        let object = self.get_mut(r)?;
        object.state = ObjectState::Disposed;
        object.fields.clear();
        Ok(())
    }
}
