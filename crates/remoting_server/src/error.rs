//! Error types for the remoting server.

use remoting_protocol::{FacadeError, FaultKind, Oid, ServerFault, Version};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Session missing, forged, closed or expired, or bad credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Type not known to the metamodel.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// Field not declared by the type.
    #[error("unknown field {type_name}.{field}")]
    UnknownField {
        /// Type name.
        type_name: String,
        /// Field name.
        field: String,
    },

    /// Object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(Oid),

    /// The caller's version of an object is stale.
    #[error("concurrency conflict on {oid}: client has {expected:?}, server has {actual}")]
    ConcurrencyConflict {
        /// Object concerned.
        oid: Oid,
        /// Version the caller sent.
        expected: Option<Version>,
        /// Version the server holds.
        actual: Version,
    },

    /// A reference in a request could not be resolved.
    #[error("dangling reference: {0}")]
    DanglingReference(Oid),

    /// No service registered under the id.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// No action registered for the type.
    #[error("unknown action {type_name}.{action}")]
    UnknownAction {
        /// Type name.
        type_name: String,
        /// Action name.
        action: String,
    },

    /// A domain rule rejected the call.
    #[error("rejected: {0}")]
    BusinessRule(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the caller caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::UnknownType(_)
                | ServerError::UnknownField { .. }
                | ServerError::ObjectNotFound(_)
                | ServerError::ConcurrencyConflict { .. }
                | ServerError::DanglingReference(_)
                | ServerError::UnknownService(_)
                | ServerError::UnknownAction { .. }
                | ServerError::BusinessRule(_)
        )
    }

    /// Returns true if this is a server-side failure.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }

    /// Returns the fault kind reported to the client.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ServerError::AuthenticationFailed(_) => FaultKind::Authentication,
            ServerError::InvalidRequest(_)
            | ServerError::UnknownType(_)
            | ServerError::UnknownField { .. }
            | ServerError::UnknownService(_)
            | ServerError::UnknownAction { .. } => FaultKind::InvalidRequest,
            ServerError::ObjectNotFound(_) => FaultKind::ObjectNotFound,
            ServerError::ConcurrencyConflict { .. } => FaultKind::ConcurrencyConflict,
            ServerError::DanglingReference(_) => FaultKind::DanglingReference,
            ServerError::BusinessRule(_) => FaultKind::BusinessRule,
            ServerError::Internal(_) | ServerError::Io(_) => FaultKind::Internal,
        }
    }

    /// Converts into the fault sent back to the client.
    pub fn into_fault(self) -> ServerFault {
        ServerFault::new(self.fault_kind(), self.to_string())
    }
}

impl From<ServerError> for FacadeError {
    fn from(err: ServerError) -> Self {
        FacadeError::Fault(err.into_fault())
    }
}
