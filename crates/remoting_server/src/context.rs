//! Change tracking for one server-side unit of work.

use crate::error::{ServerError, ServerResult};
use crate::store::{ObjectStore, StoredField, StoredObject};
use remoting_protocol::{FieldKind, FieldOrderProvider, FieldSpec, IdentityData, Oid, Version};
use std::collections::{HashMap, HashSet};

/// Everything a unit of work changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Objects created or modified, in first-touch order.
    pub changed: Vec<Oid>,
    /// Objects destroyed.
    pub disposed: Vec<IdentityData>,
    /// Informational messages.
    pub messages: Vec<String>,
    /// Warnings.
    pub warnings: Vec<String>,
}

/// Mutable access to the store for one request.
///
/// Each object touched is given a new version exactly once, however many
/// of its fields change. The server rolls the store back if the unit of
/// work fails.
pub struct ActionContext<'a> {
    store: &'a mut ObjectStore,
    types: &'a dyn FieldOrderProvider,
    user: &'a str,
    touched: HashSet<Oid>,
    /// Versions of pre-existing objects before their first touch.
    originals: HashMap<Oid, Version>,
    effects: Effects,
}

impl<'a> ActionContext<'a> {
    /// Creates a context acting for `user`.
    pub fn new(store: &'a mut ObjectStore, types: &'a dyn FieldOrderProvider, user: &'a str) -> Self {
        Self {
            store,
            types,
            user,
            touched: HashSet::new(),
            originals: HashMap::new(),
            effects: Effects::default(),
        }
    }

    /// Returns the acting user.
    pub fn user(&self) -> &str {
        self.user
    }

    /// Returns the store for reading.
    pub fn store(&self) -> &ObjectStore {
        &*self.store
    }

    /// Returns the object with `oid`.
    pub fn get(&self, oid: &Oid) -> ServerResult<&StoredObject> {
        self.store
            .get(oid)
            .ok_or_else(|| ServerError::ObjectNotFound(oid.clone()))
    }

    /// Returns the version `oid` had when this unit of work started.
    ///
    /// Objects created by the unit report their current version.
    pub fn version_before(&self, oid: &Oid) -> ServerResult<Version> {
        match self.originals.get(oid) {
            Some(version) => Ok(version.clone()),
            None => Ok(self.get(oid)?.version.clone()),
        }
    }

    /// Returns the declared fields of `type_name`.
    pub fn specs(&self, type_name: &str) -> ServerResult<&'a [FieldSpec]> {
        let types: &'a dyn FieldOrderProvider = self.types;
        types
            .fields(type_name)
            .ok_or_else(|| ServerError::UnknownType(type_name.to_string()))
    }

    /// Returns the declared field `field` of `type_name`.
    pub fn spec(&self, type_name: &str, field: &str) -> ServerResult<&'a FieldSpec> {
        self.specs(type_name)?
            .iter()
            .find(|spec| spec.name == field)
            .ok_or_else(|| ServerError::UnknownField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    /// Creates a new persistent object of `type_name` with empty fields.
    pub fn create(&mut self, type_name: &str) -> ServerResult<Oid> {
        let specs = self.specs(type_name)?;
        let oid = self.store.allocate_oid(type_name);
        self.insert_new(oid.clone(), type_name, specs);
        Ok(oid)
    }

    /// Creates the persistent replacement of the transient `previous`.
    ///
    /// The returned oid carries the `previous` link.
    pub fn create_promoted(&mut self, type_name: &str, previous: &Oid) -> ServerResult<Oid> {
        let specs = self.specs(type_name)?;
        let oid = self.store.promote(type_name, previous);
        self.insert_new(oid.clone(), type_name, specs);
        Ok(oid)
    }

    fn insert_new(&mut self, oid: Oid, type_name: &str, specs: &[FieldSpec]) {
        let object = StoredObject::blank(oid.clone(), type_name, Version::initial(self.user), specs);
        self.store.insert(object);
        self.touched.insert(oid.clone());
        self.effects.changed.push(oid.without_previous());
    }

    /// Sets or clears a value field.
    pub fn set_value(&mut self, oid: &Oid, field: &str, value: Option<String>) -> ServerResult<()> {
        self.expect_kind(oid, field, FieldKind::Value)?;
        self.replace_field(oid, field, StoredField::Value(value))
    }

    /// Sets or clears a reference field.
    pub fn set_reference(&mut self, oid: &Oid, field: &str, target: Option<Oid>) -> ServerResult<()> {
        self.expect_kind(oid, field, FieldKind::Reference)?;
        if let Some(target) = &target {
            self.get(target)?;
        }
        self.replace_field(oid, field, StoredField::Reference(target))
    }

    /// Appends `element` to a collection field unless already present.
    pub fn add_element(&mut self, oid: &Oid, field: &str, element: Oid) -> ServerResult<()> {
        self.expect_kind(oid, field, FieldKind::Collection)?;
        self.get(&element)?;
        let mut elements = self.elements(oid, field)?;
        if !elements.contains(&element) {
            elements.push(element);
            self.replace_field(oid, field, StoredField::Collection(elements))?;
        }
        Ok(())
    }

    /// Removes `element` from a collection field.
    pub fn remove_element(&mut self, oid: &Oid, field: &str, element: &Oid) -> ServerResult<()> {
        self.expect_kind(oid, field, FieldKind::Collection)?;
        let mut elements = self.elements(oid, field)?;
        let before = elements.len();
        elements.retain(|e| e != element);
        if elements.len() != before {
            self.replace_field(oid, field, StoredField::Collection(elements))?;
        }
        Ok(())
    }

    /// Replaces the content of `field` without checking references.
    pub(crate) fn replace_field(&mut self, oid: &Oid, field: &str, content: StoredField) -> ServerResult<()> {
        let object = self.touch(oid)?;
        match object.fields.get_mut(field) {
            Some(slot) => {
                *slot = content;
                Ok(())
            }
            None => Err(ServerError::UnknownField {
                type_name: object.type_name.clone(),
                field: field.to_string(),
            }),
        }
    }

    /// Destroys an object, clearing every reference to it.
    pub fn destroy(&mut self, oid: &Oid) -> ServerResult<()> {
        let identity = self.get(oid)?.identity();
        for referrer in self.store.referrers(oid) {
            if referrer == *oid {
                continue;
            }
            let object = self.touch(&referrer)?;
            for field in object.fields.values_mut() {
                match field {
                    StoredField::Reference(target) if target.as_ref() == Some(oid) => *target = None,
                    StoredField::Collection(elements) => elements.retain(|e| e != oid),
                    _ => {}
                }
            }
        }
        self.store.remove(oid);
        self.effects.changed.retain(|c| c != oid);
        self.effects.disposed.push(identity);
        Ok(())
    }

    /// Records an informational message for the caller.
    pub fn message(&mut self, message: impl Into<String>) {
        self.effects.messages.push(message.into());
    }

    /// Records a warning for the caller.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.effects.warnings.push(warning.into());
    }

    /// Marks `oid` as changed, giving it a new version on first touch.
    pub fn touch(&mut self, oid: &Oid) -> ServerResult<&mut StoredObject> {
        let user = self.user;
        let object = self
            .store
            .get_mut(oid)
            .ok_or_else(|| ServerError::ObjectNotFound(oid.clone()))?;
        if self.touched.insert(oid.without_previous()) {
            self.originals
                .insert(oid.without_previous(), object.version.clone());
            object.version = object.version.next(user);
            self.effects.changed.push(oid.without_previous());
        }
        Ok(object)
    }

    /// Ends the unit of work.
    pub fn finish(self) -> Effects {
        self.effects
    }

    fn expect_kind(&self, oid: &Oid, field: &str, kind: FieldKind) -> ServerResult<()> {
        let object = self.get(oid)?;
        let spec = self.spec(&object.type_name, field)?;
        if spec.kind != kind {
            return Err(ServerError::InvalidRequest(format!(
                "{}.{field} is a {:?} field, not {kind:?}",
                object.type_name, spec.kind
            )));
        }
        Ok(())
    }

    fn elements(&self, oid: &Oid, field: &str) -> ServerResult<Vec<Oid>> {
        match self.get(oid)?.field(field) {
            Some(StoredField::Collection(elements)) => Ok(elements.clone()),
            _ => Ok(Vec::new()),
        }
    }
}
