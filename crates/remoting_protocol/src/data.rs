//! Wire representation of domain data.
//!
//! A [`Data`] value is created fresh for every exchange and consumed
//! immediately by the peer. Object and collection variants nest further
//! `Data`, so the wire shape is a tree: a second appearance of an object
//! within one exchange is sent as an [`IdentityData`] stub (see
//! [`KnownObjects`](crate::KnownObjects)).

use crate::oid::Oid;
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// A value crossing the client/server boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Data {
    /// An absent reference or value.
    Null(NullData),
    /// A scalar or value object without identity.
    Encodable(EncodableObjectData),
    /// A reference to a domain object without its content.
    Identity(IdentityData),
    /// A domain object, complete or as a stub.
    Object(ObjectData),
    /// A collection, with or without its elements.
    Collection(CollectionData),
}

impl Data {
    /// Creates a null of the given declared type.
    pub fn null(type_name: impl Into<String>) -> Self {
        Data::Null(NullData::new(type_name))
    }

    /// Creates an encoded value.
    pub fn value(type_name: impl Into<String>, encoded: impl Into<String>) -> Self {
        Data::Encodable(EncodableObjectData::new(type_name, encoded))
    }

    /// Returns the declared type name.
    pub fn type_name(&self) -> &str {
        match self {
            Data::Null(d) => &d.type_name,
            Data::Encodable(d) => &d.type_name,
            Data::Identity(d) => &d.type_name,
            Data::Object(d) => &d.type_name,
            Data::Collection(d) => &d.type_name,
        }
    }

    /// Returns the oid for variants that carry identity.
    pub fn oid(&self) -> Option<&Oid> {
        match self {
            Data::Identity(d) => Some(&d.oid),
            Data::Object(d) => Some(&d.oid),
            Data::Collection(d) => Some(&d.oid),
            Data::Null(_) | Data::Encodable(_) => None,
        }
    }

    /// Returns the version for variants that carry one.
    pub fn version(&self) -> Option<&Version> {
        match self {
            Data::Identity(d) => d.version.as_ref(),
            Data::Object(d) => d.version.as_ref(),
            Data::Collection(d) => d.version.as_ref(),
            Data::Null(_) | Data::Encodable(_) => None,
        }
    }

    /// Returns true for [`Data::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null(_))
    }

    /// Returns the reference form of an identified value.
    pub fn to_identity(&self) -> Option<IdentityData> {
        match self {
            Data::Identity(d) => Some(d.clone()),
            Data::Object(d) => Some(d.identity()),
            Data::Collection(d) => Some(IdentityData::new(
                d.oid.clone(),
                d.type_name.clone(),
                d.version.clone(),
            )),
            Data::Null(_) | Data::Encodable(_) => None,
        }
    }
}

/// A null, typed so the decoder can check it against the declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullData {
    /// Declared type.
    pub type_name: String,
}

impl NullData {
    /// Creates a typed null.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

/// A value object in its encoded string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodableObjectData {
    /// Declared type.
    pub type_name: String,
    /// Encoded payload.
    pub encoded: String,
}

impl EncodableObjectData {
    /// Creates an encoded value.
    pub fn new(type_name: impl Into<String>, encoded: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            encoded: encoded.into(),
        }
    }
}

/// A reference to a domain object (`ReferenceData`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityData {
    /// Object identity.
    pub oid: Oid,
    /// Object type.
    pub type_name: String,
    /// Version stamp; absent for transient objects.
    pub version: Option<Version>,
}

impl IdentityData {
    /// Creates a reference.
    pub fn new(oid: Oid, type_name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            oid,
            type_name: type_name.into(),
            version,
        }
    }
}

/// A domain object on the wire.
///
/// Field content is present exactly when the object was sent complete.
/// A stub carries identity, type and version so the receiver can create a
/// placeholder it resolves later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    /// Object identity.
    pub oid: Oid,
    /// Object type.
    pub type_name: String,
    /// Version stamp; absent for transient objects.
    pub version: Option<Version>,
    fields: Option<Vec<Data>>,
}

impl ObjectData {
    /// Creates a complete object with fields in declared order.
    pub fn complete(
        oid: Oid,
        type_name: impl Into<String>,
        version: Option<Version>,
        fields: Vec<Data>,
    ) -> Self {
        Self {
            oid,
            type_name: type_name.into(),
            version,
            fields: Some(fields),
        }
    }

    /// Creates a stub without field content.
    pub fn stub(oid: Oid, type_name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            oid,
            type_name: type_name.into(),
            version,
            fields: None,
        }
    }

    /// Returns true if field content is present.
    pub fn has_complete_data(&self) -> bool {
        self.fields.is_some()
    }

    /// Returns the field content of a complete object.
    pub fn fields(&self) -> Option<&[Data]> {
        self.fields.as_deref()
    }

    /// Returns the reference form of this object.
    pub fn identity(&self) -> IdentityData {
        IdentityData::new(self.oid.clone(), self.type_name.clone(), self.version.clone())
    }
}

/// A collection on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionData {
    /// Collection identity.
    pub oid: Oid,
    /// Element type.
    pub type_name: String,
    /// Version stamp of the owning object.
    pub version: Option<Version>,
    elements: Option<Vec<Data>>,
}

impl CollectionData {
    /// Creates a collection with all of its elements.
    pub fn with_elements(
        oid: Oid,
        type_name: impl Into<String>,
        version: Option<Version>,
        elements: Vec<Data>,
    ) -> Self {
        Self {
            oid,
            type_name: type_name.into(),
            version,
            elements: Some(elements),
        }
    }

    /// Creates a collection whose elements were not sent.
    pub fn unresolved(oid: Oid, type_name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            oid,
            type_name: type_name.into(),
            version,
            elements: None,
        }
    }

    /// Returns true if all elements are present.
    pub fn has_all_elements(&self) -> bool {
        self.elements.is_some()
    }

    /// Returns the elements, if sent.
    pub fn elements(&self) -> Option<&[Data]> {
        self.elements.as_deref()
    }
}

/// Oid of the collection held in `field` of the object `owner`.
///
/// Collections have no identity of their own on the server, so both sides
/// derive one from the owner's oid and the field name.
pub fn collection_oid(owner: &Oid, field: &str) -> Oid {
    let base = match owner.key() {
        crate::oid::OidKey::Persistent(key) => key.clone(),
        crate::oid::OidKey::Transient(marker) => marker.simple().to_string(),
    };
    Oid::persistent(format!("{base}/{field}"))
}
