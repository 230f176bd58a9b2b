//! Error types for the protocol crate.

use crate::messages::ServerFault;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for façade calls.
pub type FacadeResult<T> = Result<T, FacadeError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a message to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The decoded message violates a structural rule of the protocol.
    #[error("invalid message structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// A frame announced a length above the configured limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Unexpected end of input while reading a frame.
    #[error("unexpected end of input")]
    UnexpectedEof,
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }
}

/// Errors returned by a [`ServerFacade`](crate::ServerFacade) call.
///
/// Domain outcomes such as an authorization denial or a per-entry version
/// conflict are *not* errors; they travel inside normal responses. This
/// type covers runtime faults raised by the server and protocol failures
/// detected while carrying the exchange.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FacadeError {
    /// The server raised a runtime fault.
    #[error("server fault: {0}")]
    Fault(ServerFault),

    /// A response envelope did not answer the outstanding request.
    #[error("response out of sequence: expected {expected}, got {actual}")]
    OutOfSequence {
        /// Id of the request awaiting a response.
        expected: u64,
        /// Id carried by the received envelope.
        actual: u64,
    },

    /// A second request was issued on a session with one still outstanding.
    #[error("request {outstanding} still in flight on this session")]
    RequestInFlight {
        /// Id of the outstanding request.
        outstanding: u64,
    },

    /// A response was received with no request outstanding.
    #[error("unsolicited response {actual}")]
    Unsolicited {
        /// Id carried by the received envelope.
        actual: u64,
    },

    /// The response variant does not belong to the operation invoked.
    #[error("unexpected response for {operation}: got {got}")]
    UnexpectedResponse {
        /// Operation that was invoked.
        operation: &'static str,
        /// Operation the response belongs to.
        got: &'static str,
    },

    /// Connection loss or I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl FacadeError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns true for failures of the protocol itself, which abort the
    /// whole exchange.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            FacadeError::OutOfSequence { .. }
                | FacadeError::RequestInFlight { .. }
                | FacadeError::Unsolicited { .. }
                | FacadeError::UnexpectedResponse { .. }
        )
    }

    /// Returns the server fault, if this error carries one.
    pub fn fault(&self) -> Option<&ServerFault> {
        match self {
            FacadeError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<ServerFault> for FacadeError {
    fn from(fault: ServerFault) -> Self {
        FacadeError::Fault(fault)
    }
}

impl From<std::io::Error> for FacadeError {
    fn from(err: std::io::Error) -> Self {
        FacadeError::Transport(err.to_string())
    }
}
