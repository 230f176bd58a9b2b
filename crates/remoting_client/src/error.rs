//! Error types for the client.

use crate::cache::LocalRef;
use remoting_protocol::{FacadeError, FieldKind, Oid, ServerFault};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised on the client side.
///
/// Version conflicts of batch entries are not errors; they are reported in
/// the transaction outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The exchange with the server failed.
    #[error(transparent)]
    Facade(#[from] FacadeError),

    /// No session is open.
    #[error("no session is open")]
    NotConnected,

    /// `start_transaction` was called inside a transaction.
    #[error("a transaction is already open")]
    TransactionAlreadyOpen,

    /// `end_transaction` or `abort_transaction` was called with no
    /// transaction open.
    #[error("no transaction is open")]
    NoTransaction,

    /// A mutation was attempted outside a transaction.
    #[error("mutations require an open transaction")]
    NotInTransaction,

    /// A response referred to an object that is neither in the response
    /// nor in the cache.
    #[error("dangling reference to {0}")]
    DanglingReference(Oid),

    /// The handle does not belong to this cache.
    #[error("unknown local object {0:?}")]
    UnknownObject(LocalRef),

    /// The object has been disposed.
    #[error("{0} has been disposed")]
    Disposed(Oid),

    /// The operation needs a persistent object.
    #[error("{0} is not persistent")]
    NotPersistent(Oid),

    /// The object is already persistent.
    #[error("{0} is already persistent")]
    AlreadyPersistent(Oid),

    /// The type is not known to the metamodel.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// The field is not declared by the type.
    #[error("unknown field {type_name}.{field}")]
    UnknownField {
        /// Declaring type.
        type_name: String,
        /// Field name.
        field: String,
    },

    /// The field exists but holds another kind of content.
    #[error("{type_name}.{field} is not a {expected:?} field")]
    WrongFieldKind {
        /// Declaring type.
        type_name: String,
        /// Field name.
        field: String,
        /// Kind the operation needs.
        expected: FieldKind,
    },

    /// A response did not have the expected shape.
    #[error("unexpected data: {0}")]
    UnexpectedData(String),
}

impl ClientError {
    /// Creates an unexpected-data error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedData(message.into())
    }

    /// Returns true for failures of the protocol itself, which abort the
    /// whole exchange.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            ClientError::Facade(err) => err.is_protocol_error(),
            ClientError::DanglingReference(_) | ClientError::UnexpectedData(_) => true,
            _ => false,
        }
    }

    /// Returns the server fault, if this error carries one.
    pub fn fault(&self) -> Option<&ServerFault> {
        match self {
            ClientError::Facade(err) => err.fault(),
            _ => None,
        }
    }
}
