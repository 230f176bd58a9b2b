//! Encoding of cached objects into request data.

use crate::cache::{LocalField, LocalObject, LocalRef, ObjectCache, ObjectState};
use crate::error::{ClientError, ClientResult};
use remoting_protocol::{
    collection_oid, CollectionData, Data, FieldKind, FieldOrderProvider, IdentityData,
    KnownObjects, ObjectData,
};
use std::collections::HashSet;

/// Builds the wire graphs of one request.
///
/// One encoder, and so one known-objects set, serves a whole request. An
/// object is sent in full at most once: the entry itself, and any transient
/// or dirty object it reaches, the first time it is met. Every later
/// occurrence, and every clean persistent object, is sent as an
/// `IdentityData`.
pub struct GraphEncoder<'a> {
    cache: &'a ObjectCache,
    types: &'a dyn FieldOrderProvider,
    dirty: &'a HashSet<LocalRef>,
    known: KnownObjects,
}

impl<'a> GraphEncoder<'a> {
    /// Creates an encoder. `dirty` lists the persistent objects whose local
    /// state differs from the server's.
    pub fn new(
        cache: &'a ObjectCache,
        types: &'a dyn FieldOrderProvider,
        dirty: &'a HashSet<LocalRef>,
    ) -> Self {
        Self {
            cache,
            types,
            dirty,
            known: KnownObjects::new(),
        }
    }

    /// Returns the number of objects sent in full so far.
    pub fn placed(&self) -> usize {
        self.known.len()
    }

    /// Encodes the state of `r` as a batch entry.
    pub fn entry(&mut self, r: LocalRef) -> ClientResult<Data> {
        let object = self.cache.live(r)?;
        if self.known.contains(object.oid()) {
            return Ok(Data::Identity(identity(object)));
        }
        Ok(Data::Object(self.complete(object)?))
    }

    /// Encodes `r` by identity.
    pub fn identity(&self, r: LocalRef) -> ClientResult<Data> {
        Ok(Data::Identity(identity(self.cache.get(r)?)))
    }

    /// Encodes a reference to `r` met inside a graph.
    pub fn reference(&mut self, r: LocalRef) -> ClientResult<Data> {
        let object = self.cache.live(r)?;
        let full = match object.state() {
            ObjectState::Transient => true,
            ObjectState::Resolved => self.dirty.contains(&r),
            ObjectState::Ghost | ObjectState::Disposed => false,
        };
        if full && !self.known.contains(object.oid()) {
            Ok(Data::Object(self.complete(object)?))
        } else {
            Ok(Data::Identity(identity(object)))
        }
    }

    fn complete(&mut self, object: &LocalObject) -> ClientResult<ObjectData> {
        if object.state() == ObjectState::Ghost {
            return Err(ClientError::unexpected(format!(
                "{} must be resolved before it is sent",
                object.oid()
            )));
        }
        let specs = self
            .types
            .fields(object.type_name())
            .ok_or_else(|| ClientError::UnknownType(object.type_name().to_string()))?;
        self.known.mark(object.oid());

        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let content = match (spec.kind, object.field(&spec.name)) {
                (FieldKind::Value, Some(LocalField::Value(Some(value)))) => {
                    Data::value(&spec.target_type, value.clone())
                }
                (FieldKind::Reference, Some(LocalField::Reference(Some(target)))) => {
                    self.reference(*target)?
                }
                (FieldKind::Collection, Some(LocalField::Collection(Some(elements)))) => {
                    let mut encoded = Vec::with_capacity(elements.len());
                    for element in elements {
                        encoded.push(self.reference(*element)?);
                    }
                    Data::Collection(CollectionData::with_elements(
                        collection_oid(object.oid(), &spec.name),
                        &spec.target_type,
                        object.version().cloned(),
                        encoded,
                    ))
                }
                (FieldKind::Collection, Some(LocalField::Collection(None))) => {
                    Data::Collection(CollectionData::unresolved(
                        collection_oid(object.oid(), &spec.name),
                        &spec.target_type,
                        object.version().cloned(),
                    ))
                }
                _ => Data::null(&spec.target_type),
            };
            fields.push(content);
        }

        Ok(ObjectData::complete(
            object.oid().without_previous(),
            object.type_name(),
            object.version().cloned(),
            fields,
        ))
    }
}

fn identity(object: &LocalObject) -> IdentityData {
    IdentityData::new(
        object.oid().without_previous(),
        object.type_name(),
        object.version().cloned(),
    )
}
