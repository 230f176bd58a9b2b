//! # Remoting Protocol
//!
//! Wire types, correlation and codecs for the remoting object protocol.
//!
//! This crate provides:
//! - [`Oid`] and [`Version`] for identity and optimistic concurrency
//! - [`Data`] and its variants, the wire form of domain objects
//! - One request/response pair per operation of the [`ServerFacade`]
//! - [`Correlator`] for sequence-checked request/response pairing
//! - CBOR encoding and length-prefixed framing
//!
//! Both the server and the client build on these types; nothing here
//! stores objects or opens connections.
//!
//! ## Usage
//!
//! ```
//! use remoting_protocol::{Correlator, Decode, Encode, OpenSessionRequest, Request, RequestEnvelope};
//!
//! let mut correlator = Correlator::new();
//! let envelope = correlator
//!     .begin(Request::OpenSession(OpenSessionRequest {
//!         user: "alice".into(),
//!         password: "secret".into(),
//!     }))
//!     .unwrap();
//!
//! let bytes = envelope.encode().unwrap();
//! assert_eq!(RequestEnvelope::decode(&bytes).unwrap(), envelope);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod data;
mod envelope;
mod error;
mod facade;
mod frame;
mod known;
mod logging;
mod messages;
mod metamodel;
mod oid;
mod version;

pub use codec::{from_cbor, to_cbor, Decode, Encode};
pub use data::{
    collection_oid, CollectionData, Data, EncodableObjectData, IdentityData, NullData, ObjectData,
};
pub use envelope::{CorrelationState, Correlator, RequestEnvelope, ResponseEnvelope};
pub use error::{CodecError, CodecResult, FacadeError, FacadeResult};
pub use facade::{dispatch, handle_encoded, unexpected, FrameHandler, ServerFacade};
pub use frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_LEN};
pub use known::KnownObjects;
pub use logging::{dump_all, dump_data, LoggingFacade};
pub use messages::{
    AuthenticationSession, AuthorizationRequest, AuthorizationResponse, ClearAssociationRequest,
    ClearAssociationResponse, ClearValueRequest, ClearValueResponse, ClientActionResult,
    ClientActionType, CloseSessionRequest, CloseSessionResponse, Criteria, EntryFailure,
    ExecuteClientActionRequest, ExecuteClientActionResponse, ExecuteServerActionRequest,
    ExecuteServerActionResponse, FaultKind, FindInstancesRequest, FindInstancesResponse,
    GetObjectRequest, GetObjectResponse, GetPropertiesRequest, GetPropertiesResponse,
    HasInstancesRequest, HasInstancesResponse, ObjectChanges, OidForServiceRequest,
    OidForServiceResponse, OpenSessionRequest, OpenSessionResponse, Request, ResolveFieldRequest,
    ResolveFieldResponse, ResolveObjectRequest, ResolveObjectResponse, Response, ServerFault,
    SetAssociationRequest, SetAssociationResponse, SetValueRequest, SetValueResponse,
};
pub use metamodel::{FieldKind, FieldOrderProvider, FieldSpec, TypeBuilder, TypeRegistry};
pub use oid::{Oid, OidKey};
pub use version::Version;
