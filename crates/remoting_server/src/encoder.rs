//! Encoding of stored objects into response data.

use crate::context::Effects;
use crate::error::{ServerError, ServerResult};
use crate::store::{ObjectStore, StoredField, StoredObject};
use remoting_protocol::{
    collection_oid, CollectionData, Data, FieldKind, FieldOrderProvider, FieldSpec, KnownObjects,
    ObjectChanges, ObjectData, Oid,
};
use tracing::warn;

/// Builds the `Data` of one response.
///
/// A referenced object goes out as a stub the first time it appears in the
/// response and as `IdentityData` afterwards. Collections of a complete
/// object are sent without their elements; the client loads them with
/// `resolveField`.
pub(crate) struct ResponseEncoder<'a> {
    store: &'a ObjectStore,
    types: &'a dyn FieldOrderProvider,
    known: KnownObjects,
}

impl<'a> ResponseEncoder<'a> {
    pub(crate) fn new(store: &'a ObjectStore, types: &'a dyn FieldOrderProvider) -> Self {
        Self {
            store,
            types,
            known: KnownObjects::new(),
        }
    }

    /// Returns the store being encoded.
    pub(crate) fn store(&self) -> &'a ObjectStore {
        self.store
    }

    fn lookup(&self, oid: &Oid) -> ServerResult<&'a StoredObject> {
        let store: &'a ObjectStore = self.store;
        store
            .get(oid)
            .ok_or_else(|| ServerError::ObjectNotFound(oid.clone()))
    }

    fn specs(&self, type_name: &str) -> ServerResult<&'a [FieldSpec]> {
        let types: &'a dyn FieldOrderProvider = self.types;
        types
            .fields(type_name)
            .ok_or_else(|| ServerError::UnknownType(type_name.to_string()))
    }

    /// Encodes the full state of `oid`.
    pub(crate) fn complete(&mut self, oid: &Oid) -> ServerResult<ObjectData> {
        let object = self.lookup(oid)?;
        let specs = self.specs(&object.type_name)?;
        self.known.mark(&object.oid);

        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let content = match object.field(&spec.name) {
                Some(StoredField::Value(Some(value))) => Data::value(&spec.target_type, value.clone()),
                Some(StoredField::Reference(Some(target))) => self.reference(target, &spec.target_type),
                Some(StoredField::Collection(_)) => Data::Collection(CollectionData::unresolved(
                    collection_oid(&object.oid, &spec.name),
                    &spec.target_type,
                    Some(object.version.clone()),
                )),
                Some(StoredField::Value(None)) | Some(StoredField::Reference(None)) | None => {
                    Data::null(&spec.target_type)
                }
            };
            fields.push(content);
        }

        Ok(ObjectData::complete(
            object.oid.clone(),
            object.type_name.clone(),
            Some(object.version.clone()),
            fields,
        ))
    }

    /// Encodes a reference to `oid`.
    pub(crate) fn reference(&mut self, oid: &Oid, declared_type: &str) -> Data {
        match self.store.get(oid) {
            Some(object) if self.known.mark(oid) => Data::Object(ObjectData::stub(
                object.oid.clone(),
                object.type_name.clone(),
                Some(object.version.clone()),
            )),
            Some(object) => Data::Identity(object.identity()),
            None => {
                warn!(%oid, "reference to missing object encoded as null");
                Data::null(declared_type)
            }
        }
    }

    /// Encodes one field of `oid`, loading collection elements.
    pub(crate) fn field(&mut self, oid: &Oid, field: &str) -> ServerResult<Data> {
        let object = self.lookup(oid)?;
        let spec = self
            .specs(&object.type_name)?
            .iter()
            .find(|spec| spec.name == field)
            .ok_or_else(|| ServerError::UnknownField {
                type_name: object.type_name.clone(),
                field: field.to_string(),
            })?;

        let data = match (spec.kind, object.field(field)) {
            (FieldKind::Collection, Some(StoredField::Collection(elements))) => {
                let elements = elements
                    .iter()
                    .map(|element| self.reference(element, &spec.target_type))
                    .collect();
                Data::Collection(CollectionData::with_elements(
                    collection_oid(&object.oid, field),
                    &spec.target_type,
                    Some(object.version.clone()),
                    elements,
                ))
            }
            (FieldKind::Collection, _) => Data::Collection(CollectionData::with_elements(
                collection_oid(&object.oid, field),
                &spec.target_type,
                Some(object.version.clone()),
                Vec::new(),
            )),
            (_, Some(StoredField::Reference(Some(target)))) => {
                self.reference(target, &spec.target_type)
            }
            (_, Some(StoredField::Value(Some(value)))) => Data::value(&spec.target_type, value.clone()),
            _ => Data::null(&spec.target_type),
        };
        Ok(data)
    }

    /// Encodes a list of objects as a collection with its elements.
    pub(crate) fn list(&mut self, type_name: &str, oids: &[Oid]) -> Data {
        let elements = oids
            .iter()
            .map(|oid| self.reference(oid, type_name))
            .collect();
        Data::Collection(CollectionData::with_elements(
            Oid::transient(),
            type_name,
            None,
            elements,
        ))
    }

    /// Encodes the side effects of a unit of work.
    pub(crate) fn changes(&mut self, effects: &Effects) -> ServerResult<ObjectChanges> {
        let mut updates = Vec::with_capacity(effects.changed.len());
        for oid in &effects.changed {
            if self.store.contains(oid) {
                updates.push(self.complete(oid)?);
            }
        }
        Ok(ObjectChanges {
            updates,
            disposed: effects.disposed.clone(),
        })
    }
}
