//! Decoding of response data into the cache.

use crate::cache::{LocalField, LocalRef, ObjectCache, ObjectState};
use crate::error::{ClientError, ClientResult};
use remoting_protocol::{
    Data, EncodableObjectData, FieldKind, FieldOrderProvider, FieldSpec, IdentityData,
    ObjectChanges, ObjectData,
};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// A decoded `Data` value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// No value.
    Null,
    /// A scalar or value object.
    Value(EncodableObjectData),
    /// A domain object.
    Object(LocalRef),
    /// The elements of a collection.
    Objects(Vec<LocalRef>),
    /// A collection whose elements were not sent.
    Unloaded,
}

/// Applies response data to an [`ObjectCache`].
///
/// An `IdentityData` must resolve to an object already in the cache,
/// including one decoded earlier from the same response; otherwise the
/// response is rejected with [`ClientError::DanglingReference`].
///
/// Objects with uncommitted local changes can be pinned. Their fields and
/// version are left alone, so the pending batch still carries the local
/// state and the version it was based on; if the server copy moved on, the
/// commit reports the conflict.
pub struct GraphDecoder<'a> {
    cache: &'a mut ObjectCache,
    types: &'a dyn FieldOrderProvider,
    pinned: HashSet<LocalRef>,
}

impl<'a> GraphDecoder<'a> {
    /// Creates a decoder writing into `cache`.
    pub fn new(cache: &'a mut ObjectCache, types: &'a dyn FieldOrderProvider) -> Self {
        Self {
            cache,
            types,
            pinned: HashSet::new(),
        }
    }

    /// Protects `objects` from being overwritten by decoded state.
    #[must_use]
    pub fn with_pinned(mut self, objects: impl IntoIterator<Item = LocalRef>) -> Self {
        self.pinned.extend(objects);
        self
    }

    /// Decodes any `Data`.
    pub fn decode(&mut self, data: &Data) -> ClientResult<Decoded> {
        Ok(match data {
            Data::Null(_) => Decoded::Null,
            Data::Encodable(value) => Decoded::Value(value.clone()),
            Data::Identity(identity) => Decoded::Object(self.identity(identity)?),
            Data::Object(object) => Decoded::Object(self.object(object)?),
            Data::Collection(collection) => match collection.elements() {
                Some(elements) => Decoded::Objects(self.elements(elements)?),
                None => Decoded::Unloaded,
            },
        })
    }

    /// Resolves an identity against the cache.
    pub fn identity(&self, identity: &IdentityData) -> ClientResult<LocalRef> {
        self.cache
            .lookup(&identity.oid)
            .ok_or_else(|| ClientError::DanglingReference(identity.oid.clone()))
    }

    /// Decodes an object, updating the cached copy.
    ///
    /// A stub only registers the object. An unresolved collection keeps the
    /// loaded elements when the object's version did not move; otherwise it
    /// is marked unloaded.
    pub fn object(&mut self, object: &ObjectData) -> ClientResult<LocalRef> {
        let r = self
            .cache
            .ghost(&object.oid, &object.type_name, object.version.clone());
        let pinned = self.pinned.contains(&r);
        let Some(fields) = object.fields() else {
            if !pinned {
                self.cache.observe(r, object.version.as_ref())?;
            }
            return Ok(r);
        };

        let specs = self.specs(&object.type_name)?;
        if fields.len() != specs.len() {
            return Err(ClientError::unexpected(format!(
                "{} carries {} fields, {} declared",
                object.oid,
                fields.len(),
                specs.len()
            )));
        }

        let unchanged = {
            let cached = self.cache.get(r)?;
            cached.state() == ObjectState::Resolved && cached.version() == object.version.as_ref()
        };

        let mut decoded = BTreeMap::new();
        for (spec, data) in specs.iter().zip(fields) {
            let content = match data {
                Data::Collection(collection) if collection.elements().is_none() => {
                    let loaded = if unchanged {
                        self.cache.get(r)?.elements(&spec.name).map(<[LocalRef]>::to_vec)
                    } else {
                        None
                    };
                    LocalField::Collection(loaded)
                }
                _ => self.content(spec, data)?,
            };
            decoded.insert(spec.name.clone(), content);
        }

        if pinned {
            let cached = self.cache.get(r)?;
            if cached.version() != object.version.as_ref() {
                debug!(oid = %object.oid, "server copy moved on under a pending change");
            }
            return Ok(r);
        }
        self.cache.resolve(r, object.version.clone(), decoded)?;
        Ok(r)
    }

    /// Decodes the content of `field` of `owner` and stores it.
    pub fn field(&mut self, owner: LocalRef, field: &str, data: &Data) -> ClientResult<Decoded> {
        let type_name = self.cache.live(owner)?.type_name().to_string();
        let spec = self
            .specs(&type_name)?
            .iter()
            .find(|spec| spec.name == field)
            .ok_or_else(|| ClientError::UnknownField {
                type_name: type_name.clone(),
                field: field.to_string(),
            })?;

        let content = self.content(spec, data)?;
        if self.pinned.contains(&owner) {
            let kept = self.cache.get(owner)?.field(field).cloned();
            if let Some(kept) = kept.filter(|kept| *kept != LocalField::Collection(None)) {
                return Ok(match kept {
                    LocalField::Value(Some(value)) => Decoded::Value(EncodableObjectData::new(
                        spec.target_type.clone(),
                        value,
                    )),
                    LocalField::Value(None) | LocalField::Reference(None) => Decoded::Null,
                    LocalField::Reference(Some(target)) => Decoded::Object(target),
                    LocalField::Collection(Some(elements)) => Decoded::Objects(elements),
                    LocalField::Collection(None) => Decoded::Unloaded,
                });
            }
        }
        let decoded = match &content {
            LocalField::Value(_) => self.decode(data)?,
            LocalField::Reference(Some(target)) => Decoded::Object(*target),
            LocalField::Reference(None) => Decoded::Null,
            LocalField::Collection(Some(elements)) => Decoded::Objects(elements.clone()),
            LocalField::Collection(None) => Decoded::Unloaded,
        };
        self.cache.get_mut(owner)?.set_field(field, content);
        Ok(decoded)
    }

    /// Applies the side effects of a mutating response.
    ///
    /// Returns the objects updated.
    pub fn changes(&mut self, changes: &ObjectChanges) -> ClientResult<Vec<LocalRef>> {
        let mut updated = Vec::with_capacity(changes.updates.len());
        for object in &changes.updates {
            updated.push(self.object(object)?);
        }
        for identity in &changes.disposed {
            if let Some(r) = self.cache.lookup(&identity.oid) {
                debug!(oid = %identity.oid, "disposed by the server");
                self.cache.dispose(r)?;
            }
        }
        Ok(updated)
    }

    fn specs(&self, type_name: &str) -> ClientResult<&'a [FieldSpec]> {
        let types: &'a dyn FieldOrderProvider = self.types;
        types
            .fields(type_name)
            .ok_or_else(|| ClientError::UnknownType(type_name.to_string()))
    }

    fn content(&mut self, spec: &FieldSpec, data: &Data) -> ClientResult<LocalField> {
        Ok(match (spec.kind, data) {
            (FieldKind::Value, Data::Null(_)) => LocalField::Value(None),
            (FieldKind::Value, Data::Encodable(value)) => {
                LocalField::Value(Some(value.encoded.clone()))
            }
            (FieldKind::Reference, Data::Null(_)) => LocalField::Reference(None),
            (FieldKind::Reference, Data::Identity(identity)) => {
                LocalField::Reference(Some(self.identity(identity)?))
            }
            (FieldKind::Reference, Data::Object(object)) => {
                LocalField::Reference(Some(self.object(object)?))
            }
            (FieldKind::Collection, Data::Null(_)) => LocalField::Collection(Some(Vec::new())),
            (FieldKind::Collection, Data::Collection(collection)) => {
                match collection.elements() {
                    Some(elements) => LocalField::Collection(Some(self.elements(elements)?)),
                    None => LocalField::Collection(None),
                }
            }
            (kind, other) => {
                return Err(ClientError::unexpected(format!(
                    "{} is a {kind:?} field but got {}",
                    spec.name,
                    other.type_name()
                )))
            }
        })
    }

    fn elements(&mut self, elements: &[Data]) -> ClientResult<Vec<LocalRef>> {
        let mut decoded = Vec::with_capacity(elements.len());
        for element in elements {
            let r = match element {
                Data::Identity(identity) => self.identity(identity)?,
                Data::Object(object) => self.object(object)?,
                other => {
                    return Err(ClientError::unexpected(format!(
                        "collection element is {}",
                        other.type_name()
                    )))
                }
            };
            decoded.push(r);
        }
        Ok(decoded)
    }
}
