//! Field-order capability supplied by the metamodel layer.
//!
//! `ObjectData` carries its fields as a flat array. Both peers align that
//! array with named members through a [`FieldOrderProvider`], which also
//! tells the encoder whether a field holds a value, a reference or a
//! collection.

use std::collections::BTreeMap;

/// How a field's content is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalar or value object, sent as `EncodableObjectData`.
    Value,
    /// Reference to another domain object.
    Reference,
    /// Collection of references.
    Collection,
}

/// Description of one field of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Encoding strategy.
    pub kind: FieldKind,
    /// Declared type of the value, referenced object or collection element.
    pub target_type: String,
}

impl FieldSpec {
    /// Creates a field description.
    pub fn new(name: impl Into<String>, kind: FieldKind, target_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target_type: target_type.into(),
        }
    }
}

/// Supplies the ordered fields of a type.
pub trait FieldOrderProvider: Send + Sync {
    /// Returns the fields of `type_name` in wire order.
    fn fields(&self, type_name: &str) -> Option<&[FieldSpec]>;

    /// Returns the position of `field` within `type_name`.
    fn field_index(&self, type_name: &str, field: &str) -> Option<usize> {
        self.fields(type_name)?
            .iter()
            .position(|spec| spec.name == field)
    }

    /// Returns the named field of `type_name`.
    fn field(&self, type_name: &str, field: &str) -> Option<&FieldSpec> {
        self.fields(type_name)?.iter().find(|spec| spec.name == field)
    }
}

/// A [`FieldOrderProvider`] backed by explicit registrations.
///
/// ```
/// use remoting_protocol::{FieldKind, FieldOrderProvider, TypeRegistry};
///
/// let registry = TypeRegistry::new()
///     .with_type("Customer")
///     .value("name", "String")
///     .collection("orders", "Order")
///     .done();
///
/// assert_eq!(registry.field_index("Customer", "orders"), Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, Vec<FieldSpec>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type with its fields in order.
    pub fn register(&mut self, type_name: impl Into<String>, fields: Vec<FieldSpec>) {
        self.types.insert(type_name.into(), fields);
    }

    /// Starts registering a type with a builder.
    pub fn with_type(self, type_name: impl Into<String>) -> TypeBuilder {
        TypeBuilder {
            registry: self,
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Returns the registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl FieldOrderProvider for TypeRegistry {
    fn fields(&self, type_name: &str) -> Option<&[FieldSpec]> {
        self.types.get(type_name).map(Vec::as_slice)
    }
}

/// Builder returned by [`TypeRegistry::with_type`].
#[derive(Debug)]
pub struct TypeBuilder {
    registry: TypeRegistry,
    type_name: String,
    fields: Vec<FieldSpec>,
}

impl TypeBuilder {
    /// Adds a value field.
    pub fn value(mut self, name: &str, value_type: &str) -> Self {
        self.fields
            .push(FieldSpec::new(name, FieldKind::Value, value_type));
        self
    }

    /// Adds a reference field.
    pub fn reference(mut self, name: &str, target_type: &str) -> Self {
        self.fields
            .push(FieldSpec::new(name, FieldKind::Reference, target_type));
        self
    }

    /// Adds a collection field.
    pub fn collection(mut self, name: &str, element_type: &str) -> Self {
        self.fields
            .push(FieldSpec::new(name, FieldKind::Collection, element_type));
        self
    }

    /// Finishes the type and returns the registry.
    pub fn done(mut self) -> TypeRegistry {
        self.registry.register(self.type_name, self.fields);
        self.registry
    }
}
