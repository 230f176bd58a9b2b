//! Request and response messages, one pair per protocol operation.

use crate::data::{Data, EncodableObjectData, IdentityData, ObjectData};
use crate::oid::Oid;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The session a request is made under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationSession {
    /// Session id.
    pub id: Uuid,
    /// Authenticated user.
    pub user: String,
    /// Roles granted to the user.
    pub roles: Vec<String>,
    /// Server-issued token proving the session was opened by the server.
    pub token: Vec<u8>,
}

/// Objects changed or disposed on the server as a side effect of a call.
///
/// Server-side business logic may cascade, so a client applies every entry,
/// not only the object it targeted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectChanges {
    /// Objects whose state or version changed.
    pub updates: Vec<ObjectData>,
    /// Objects that no longer exist.
    pub disposed: Vec<IdentityData>,
}

impl ObjectChanges {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.disposed.is_empty()
    }
}

/// Kind of a server runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Session missing, unknown, forged or expired.
    Authentication,
    /// Request was malformed or referred to unknown types, fields or actions.
    InvalidRequest,
    /// Target object does not exist.
    ObjectNotFound,
    /// Target object was changed by someone else.
    ConcurrencyConflict,
    /// A reference stub could not be resolved.
    DanglingReference,
    /// A domain rule rejected the call.
    BusinessRule,
    /// Unexpected server failure.
    Internal,
}

/// A runtime fault raised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFault {
    /// Fault kind.
    pub kind: FaultKind,
    /// Description.
    pub message: String,
}

impl ServerFault {
    /// Creates a fault.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// Session lifecycle

/// Opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

/// Response to [`OpenSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    /// The new session.
    pub session: AuthenticationSession,
}

/// Closes a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    /// Session to close.
    pub session: AuthenticationSession,
}

/// Response to [`CloseSessionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionResponse {}

// Authorization

/// Asks whether a member of an object may be seen or used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object owning the member.
    pub target: IdentityData,
    /// Member (field or action) name.
    pub member: String,
}

/// Outcome of an authorization check. A denial is a normal value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    /// Whether the member is allowed.
    pub allowed: bool,
    /// Why it was denied.
    pub reason: Option<String>,
}

impl AuthorizationResponse {
    /// An allowing response.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denying response.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

// Environment

/// Reads the server's configuration properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropertiesRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
}

/// Response to [`GetPropertiesRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropertiesResponse {
    /// Server properties.
    pub properties: BTreeMap<String, String>,
}

// Field mutation

/// Sets a reference field, or adds to a collection field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAssociationRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object being changed, with the version the client holds.
    pub target: IdentityData,
    /// Field name.
    pub field: String,
    /// Object to associate.
    pub associate: IdentityData,
}

/// Response to [`SetAssociationRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAssociationResponse {
    /// Side effects.
    pub changes: ObjectChanges,
}

/// Clears a reference field, or removes from a collection field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearAssociationRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object being changed.
    pub target: IdentityData,
    /// Field name.
    pub field: String,
    /// Object to dissociate.
    pub associate: IdentityData,
}

/// Response to [`ClearAssociationRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearAssociationResponse {
    /// Side effects.
    pub changes: ObjectChanges,
}

/// Sets a value field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetValueRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object being changed.
    pub target: IdentityData,
    /// Field name.
    pub field: String,
    /// New value.
    pub value: EncodableObjectData,
}

/// Response to [`SetValueRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetValueResponse {
    /// Side effects.
    pub changes: ObjectChanges,
}

/// Clears a value field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearValueRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object being changed.
    pub target: IdentityData,
    /// Field name.
    pub field: String,
}

/// Response to [`ClearValueRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearValueResponse {
    /// Side effects.
    pub changes: ObjectChanges,
}

// Batched client changes

/// Per-entry kind of a client action batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientActionType {
    /// Make a transient object persistent.
    Add,
    /// Apply a persistent object's new state.
    Change,
    /// Destroy a persistent object.
    Delete,
}

/// A batch of client-originated changes.
///
/// `data` and `types` are parallel arrays: `data[i]` is an `ObjectData`
/// graph for `Add`/`Change` entries and an `IdentityData` for `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteClientActionRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Payload per entry.
    pub data: Vec<Data>,
    /// Kind per entry.
    pub types: Vec<ClientActionType>,
}

/// Why a single batch entry was not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryFailure {
    /// The client's version is stale.
    VersionConflict {
        /// Object concerned.
        oid: Oid,
        /// Version the client sent.
        expected: Option<Version>,
        /// Version the server holds.
        actual: Version,
    },
    /// The object does not exist on the server.
    NotFound {
        /// Object concerned.
        oid: Oid,
    },
    /// A domain rule rejected the entry.
    Rejected {
        /// Object concerned.
        oid: Oid,
        /// Reason.
        reason: String,
    },
}

impl EntryFailure {
    /// Returns the oid of the failed entry.
    pub fn oid(&self) -> &Oid {
        match self {
            EntryFailure::VersionConflict { oid, .. }
            | EntryFailure::NotFound { oid }
            | EntryFailure::Rejected { oid, .. } => oid,
        }
    }
}

/// Outcome of a single batch entry, parallel to the request's entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientActionResult {
    /// An `Add` entry was persisted; the oid links to the transient one.
    Persisted(IdentityData),
    /// A `Change` entry was applied; the object's new version.
    Changed(Version),
    /// A `Delete` entry was applied.
    Deleted,
    /// The entry was not applied.
    Failed(EntryFailure),
}

/// Response to [`ExecuteClientActionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteClientActionResponse {
    /// One result per request entry.
    pub results: Vec<ClientActionResult>,
    /// Transient objects persisted by reachability rather than as entries.
    pub reachable: Vec<IdentityData>,
    /// Every object the batch changed or disposed.
    pub changes: ObjectChanges,
}

// Server actions

/// Invokes a domain action on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteServerActionRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Target object; `None` for actions on a type.
    pub target: Option<IdentityData>,
    /// Type declaring the action.
    pub type_name: String,
    /// Action name.
    pub action: String,
    /// Arguments.
    pub parameters: Vec<Data>,
}

/// Response to [`ExecuteServerActionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteServerActionResponse {
    /// Returned value.
    pub result: Data,
    /// Side effects.
    pub changes: ObjectChanges,
    /// Informational messages raised by the action.
    pub messages: Vec<String>,
    /// Warnings raised by the action.
    pub warnings: Vec<String>,
}

// Services

/// Resolves the identity of a well-known service object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidForServiceRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Service id.
    pub service_id: String,
}

/// Response to [`OidForServiceRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidForServiceResponse {
    /// The service object's identity.
    pub identity: IdentityData,
}

// Object retrieval

/// Fetches an object by oid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetObjectRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object oid.
    pub oid: Oid,
    /// Expected type.
    pub type_name: String,
}

/// Response to [`GetObjectRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetObjectResponse {
    /// The object, complete.
    pub object: ObjectData,
}

/// Loads the full state of an object the client holds as a stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveObjectRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Object to resolve.
    pub target: IdentityData,
}

/// Response to [`ResolveObjectRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveObjectResponse {
    /// The object, complete.
    pub object: ObjectData,
}

/// Loads a single lazily-sent field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveFieldRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Owning object.
    pub target: IdentityData,
    /// Field name.
    pub field: String,
}

/// Response to [`ResolveFieldRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveFieldResponse {
    /// Field content.
    pub content: Data,
}

// Queries

/// Selects instances of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Criteria {
    /// Every instance.
    AllInstances {
        /// Type to search.
        type_name: String,
    },
    /// Instances whose title contains `title`, ignoring case.
    ByTitle {
        /// Type to search.
        type_name: String,
        /// Title fragment.
        title: String,
    },
    /// Instances whose value fields equal every non-null value field of
    /// `pattern`.
    ByPattern {
        /// Pattern object; its type is the type searched.
        pattern: ObjectData,
    },
}

impl Criteria {
    /// Returns the type searched.
    pub fn type_name(&self) -> &str {
        match self {
            Criteria::AllInstances { type_name } | Criteria::ByTitle { type_name, .. } => {
                type_name
            }
            Criteria::ByPattern { pattern } => &pattern.type_name,
        }
    }
}

/// Runs a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindInstancesRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Selection.
    pub criteria: Criteria,
}

/// Response to [`FindInstancesRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindInstancesResponse {
    /// Matching objects.
    pub instances: Vec<ObjectData>,
}

/// Asks whether any instance of a type exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasInstancesRequest {
    /// Invoking session.
    pub session: AuthenticationSession,
    /// Type to check.
    pub type_name: String,
}

/// Response to [`HasInstancesRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasInstancesResponse {
    /// Whether an instance exists.
    pub has_instances: bool,
}

/// Every request, as one closed type for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// `openSession`.
    OpenSession(OpenSessionRequest),
    /// `closeSession`.
    CloseSession(CloseSessionRequest),
    /// `authorizeUsability`.
    AuthorizeUsability(AuthorizationRequest),
    /// `authorizeVisibility`.
    AuthorizeVisibility(AuthorizationRequest),
    /// `getProperties`.
    GetProperties(GetPropertiesRequest),
    /// `setAssociation`.
    SetAssociation(SetAssociationRequest),
    /// `clearAssociation`.
    ClearAssociation(ClearAssociationRequest),
    /// `setValue`.
    SetValue(SetValueRequest),
    /// `clearValue`.
    ClearValue(ClearValueRequest),
    /// `executeClientAction`.
    ExecuteClientAction(ExecuteClientActionRequest),
    /// `executeServerAction`.
    ExecuteServerAction(ExecuteServerActionRequest),
    /// `oidForService`.
    OidForService(OidForServiceRequest),
    /// `getObject`.
    GetObject(GetObjectRequest),
    /// `resolveImmediately`.
    ResolveObject(ResolveObjectRequest),
    /// `resolveField`.
    ResolveField(ResolveFieldRequest),
    /// `findInstances`.
    FindInstances(FindInstancesRequest),
    /// `hasInstances`.
    HasInstances(HasInstancesRequest),
}

impl Request {
    /// Returns the operation name.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::OpenSession(_) => "openSession",
            Request::CloseSession(_) => "closeSession",
            Request::AuthorizeUsability(_) => "authorizeUsability",
            Request::AuthorizeVisibility(_) => "authorizeVisibility",
            Request::GetProperties(_) => "getProperties",
            Request::SetAssociation(_) => "setAssociation",
            Request::ClearAssociation(_) => "clearAssociation",
            Request::SetValue(_) => "setValue",
            Request::ClearValue(_) => "clearValue",
            Request::ExecuteClientAction(_) => "executeClientAction",
            Request::ExecuteServerAction(_) => "executeServerAction",
            Request::OidForService(_) => "oidForService",
            Request::GetObject(_) => "getObject",
            Request::ResolveObject(_) => "resolveImmediately",
            Request::ResolveField(_) => "resolveField",
            Request::FindInstances(_) => "findInstances",
            Request::HasInstances(_) => "hasInstances",
        }
    }

    /// Returns the invoking session; `None` only for `openSession`.
    pub fn session(&self) -> Option<&AuthenticationSession> {
        match self {
            Request::OpenSession(_) => None,
            Request::CloseSession(r) => Some(&r.session),
            Request::AuthorizeUsability(r) | Request::AuthorizeVisibility(r) => Some(&r.session),
            Request::GetProperties(r) => Some(&r.session),
            Request::SetAssociation(r) => Some(&r.session),
            Request::ClearAssociation(r) => Some(&r.session),
            Request::SetValue(r) => Some(&r.session),
            Request::ClearValue(r) => Some(&r.session),
            Request::ExecuteClientAction(r) => Some(&r.session),
            Request::ExecuteServerAction(r) => Some(&r.session),
            Request::OidForService(r) => Some(&r.session),
            Request::GetObject(r) => Some(&r.session),
            Request::ResolveObject(r) => Some(&r.session),
            Request::ResolveField(r) => Some(&r.session),
            Request::FindInstances(r) => Some(&r.session),
            Request::HasInstances(r) => Some(&r.session),
        }
    }
}

/// Every response, as one closed type for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// `openSession`.
    OpenSession(OpenSessionResponse),
    /// `closeSession`.
    CloseSession(CloseSessionResponse),
    /// `authorizeUsability` / `authorizeVisibility`.
    Authorization(AuthorizationResponse),
    /// `getProperties`.
    GetProperties(GetPropertiesResponse),
    /// `setAssociation`.
    SetAssociation(SetAssociationResponse),
    /// `clearAssociation`.
    ClearAssociation(ClearAssociationResponse),
    /// `setValue`.
    SetValue(SetValueResponse),
    /// `clearValue`.
    ClearValue(ClearValueResponse),
    /// `executeClientAction`.
    ExecuteClientAction(ExecuteClientActionResponse),
    /// `executeServerAction`.
    ExecuteServerAction(ExecuteServerActionResponse),
    /// `oidForService`.
    OidForService(OidForServiceResponse),
    /// `getObject`.
    GetObject(GetObjectResponse),
    /// `resolveImmediately`.
    ResolveObject(ResolveObjectResponse),
    /// `resolveField`.
    ResolveField(ResolveFieldResponse),
    /// `findInstances`.
    FindInstances(FindInstancesResponse),
    /// `hasInstances`.
    HasInstances(HasInstancesResponse),
    /// A runtime fault in place of the operation's response.
    Fault(ServerFault),
}

impl Response {
    /// Returns the operation name this response belongs to.
    pub fn operation(&self) -> &'static str {
        match self {
            Response::OpenSession(_) => "openSession",
            Response::CloseSession(_) => "closeSession",
            Response::Authorization(_) => "authorize",
            Response::GetProperties(_) => "getProperties",
            Response::SetAssociation(_) => "setAssociation",
            Response::ClearAssociation(_) => "clearAssociation",
            Response::SetValue(_) => "setValue",
            Response::ClearValue(_) => "clearValue",
            Response::ExecuteClientAction(_) => "executeClientAction",
            Response::ExecuteServerAction(_) => "executeServerAction",
            Response::OidForService(_) => "oidForService",
            Response::GetObject(_) => "getObject",
            Response::ResolveObject(_) => "resolveImmediately",
            Response::ResolveField(_) => "resolveField",
            Response::FindInstances(_) => "findInstances",
            Response::HasInstances(_) => "hasInstances",
            Response::Fault(_) => "fault",
        }
    }
}
