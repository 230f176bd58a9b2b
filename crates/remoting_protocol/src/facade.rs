//! The server façade: the sole call surface between client and server.

use crate::codec::{Decode, Encode};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{FacadeError, FacadeResult};
use crate::messages::{
    AuthorizationRequest, AuthorizationResponse, ClearAssociationRequest,
    ClearAssociationResponse, ClearValueRequest, ClearValueResponse, CloseSessionRequest,
    CloseSessionResponse, ExecuteClientActionRequest, ExecuteClientActionResponse,
    ExecuteServerActionRequest, ExecuteServerActionResponse, FaultKind, FindInstancesRequest,
    FindInstancesResponse, GetObjectRequest, GetObjectResponse, GetPropertiesRequest,
    GetPropertiesResponse, HasInstancesRequest, HasInstancesResponse, OidForServiceRequest,
    OidForServiceResponse, OpenSessionRequest, OpenSessionResponse, Request,
    ResolveFieldRequest, ResolveFieldResponse, ResolveObjectRequest, ResolveObjectResponse,
    Response, ServerFault, SetAssociationRequest, SetAssociationResponse, SetValueRequest,
    SetValueResponse,
};
use tracing::warn;

/// One method per protocol operation, each a blocking round trip.
///
/// The server implements this directly; the client implements it with a
/// proxy that carries every call over a transport. Any transport in between
/// must preserve the request/response pairing. Implementations never retry.
pub trait ServerFacade: Send + Sync {
    /// Opens a session.
    fn open_session(&self, request: OpenSessionRequest) -> FacadeResult<OpenSessionResponse>;

    /// Closes a session.
    fn close_session(&self, request: CloseSessionRequest) -> FacadeResult<CloseSessionResponse>;

    /// Checks whether a member may be used.
    fn authorize_usability(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse>;

    /// Checks whether a member may be seen.
    fn authorize_visibility(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse>;

    /// Reads server properties.
    fn get_properties(&self, request: GetPropertiesRequest)
        -> FacadeResult<GetPropertiesResponse>;

    /// Sets a reference field or adds to a collection.
    fn set_association(
        &self,
        request: SetAssociationRequest,
    ) -> FacadeResult<SetAssociationResponse>;

    /// Clears a reference field or removes from a collection.
    fn clear_association(
        &self,
        request: ClearAssociationRequest,
    ) -> FacadeResult<ClearAssociationResponse>;

    /// Sets a value field.
    fn set_value(&self, request: SetValueRequest) -> FacadeResult<SetValueResponse>;

    /// Clears a value field.
    fn clear_value(&self, request: ClearValueRequest) -> FacadeResult<ClearValueResponse>;

    /// Applies a batch of client changes.
    fn execute_client_action(
        &self,
        request: ExecuteClientActionRequest,
    ) -> FacadeResult<ExecuteClientActionResponse>;

    /// Invokes a domain action.
    fn execute_server_action(
        &self,
        request: ExecuteServerActionRequest,
    ) -> FacadeResult<ExecuteServerActionResponse>;

    /// Resolves a service's identity.
    fn oid_for_service(&self, request: OidForServiceRequest)
        -> FacadeResult<OidForServiceResponse>;

    /// Fetches an object.
    fn get_object(&self, request: GetObjectRequest) -> FacadeResult<GetObjectResponse>;

    /// Loads an object's full state.
    fn resolve_immediately(
        &self,
        request: ResolveObjectRequest,
    ) -> FacadeResult<ResolveObjectResponse>;

    /// Loads one field.
    fn resolve_field(&self, request: ResolveFieldRequest) -> FacadeResult<ResolveFieldResponse>;

    /// Runs a query.
    fn find_instances(&self, request: FindInstancesRequest)
        -> FacadeResult<FindInstancesResponse>;

    /// Checks for any instance of a type.
    fn has_instances(&self, request: HasInstancesRequest) -> FacadeResult<HasInstancesResponse>;
}

/// Routes `request` to the matching façade method.
///
/// A façade error becomes [`Response::Fault`] so it can travel back to the
/// caller inside the envelope.
pub fn dispatch(facade: &dyn ServerFacade, request: Request) -> Response {
    let operation = request.operation();
    let outcome = match request {
        Request::OpenSession(r) => facade.open_session(r).map(Response::OpenSession),
        Request::CloseSession(r) => facade.close_session(r).map(Response::CloseSession),
        Request::AuthorizeUsability(r) => {
            facade.authorize_usability(r).map(Response::Authorization)
        }
        Request::AuthorizeVisibility(r) => {
            facade.authorize_visibility(r).map(Response::Authorization)
        }
        Request::GetProperties(r) => facade.get_properties(r).map(Response::GetProperties),
        Request::SetAssociation(r) => facade.set_association(r).map(Response::SetAssociation),
        Request::ClearAssociation(r) => {
            facade.clear_association(r).map(Response::ClearAssociation)
        }
        Request::SetValue(r) => facade.set_value(r).map(Response::SetValue),
        Request::ClearValue(r) => facade.clear_value(r).map(Response::ClearValue),
        Request::ExecuteClientAction(r) => facade
            .execute_client_action(r)
            .map(Response::ExecuteClientAction),
        Request::ExecuteServerAction(r) => facade
            .execute_server_action(r)
            .map(Response::ExecuteServerAction),
        Request::OidForService(r) => facade.oid_for_service(r).map(Response::OidForService),
        Request::GetObject(r) => facade.get_object(r).map(Response::GetObject),
        Request::ResolveObject(r) => facade.resolve_immediately(r).map(Response::ResolveObject),
        Request::ResolveField(r) => facade.resolve_field(r).map(Response::ResolveField),
        Request::FindInstances(r) => facade.find_instances(r).map(Response::FindInstances),
        Request::HasInstances(r) => facade.has_instances(r).map(Response::HasInstances),
    };

    outcome.unwrap_or_else(|err| {
        warn!(operation, error = %err, "façade call failed");
        Response::Fault(into_fault(err))
    })
}

fn into_fault(err: FacadeError) -> ServerFault {
    match err {
        FacadeError::Fault(fault) => fault,
        FacadeError::Codec(e) => ServerFault::new(FaultKind::InvalidRequest, e.to_string()),
        other => ServerFault::new(FaultKind::Internal, other.to_string()),
    }
}

/// Handles encoded request frames on the receiving side of a transport.
pub trait FrameHandler: Send + Sync {
    /// Handles one encoded `RequestEnvelope` and returns the encoded
    /// `ResponseEnvelope`.
    fn handle_frame(&self, frame: &[u8]) -> Vec<u8>;
}

/// Decodes a request frame, dispatches it to `facade` and encodes the
/// answer.
///
/// An undecodable frame is answered with a fault under id 0, which no
/// client correlator ever issues, so the caller sees a sequencing failure
/// rather than a result.
pub fn handle_encoded(facade: &dyn ServerFacade, frame: &[u8]) -> Vec<u8> {
    let envelope = match RequestEnvelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable request frame");
            return encode_fault(0, ServerFault::new(FaultKind::InvalidRequest, e.to_string()));
        }
    };

    let id = envelope.id;
    let response = dispatch(facade, envelope.request);
    match (ResponseEnvelope { id, response }).encode() {
        Ok(bytes) => bytes,
        Err(e) => encode_fault(id, ServerFault::new(FaultKind::Internal, e.to_string())),
    }
}

fn encode_fault(id: u64, fault: ServerFault) -> Vec<u8> {
    ResponseEnvelope {
        id,
        response: Response::Fault(fault),
    }
    .encode()
    .unwrap_or_default()
}

/// Converts a response of the wrong variant into an error.
pub fn unexpected(operation: &'static str, response: Response) -> FacadeError {
    match response {
        Response::Fault(fault) => FacadeError::Fault(fault),
        other => FacadeError::UnexpectedResponse {
            operation,
            got: other.operation(),
        },
    }
}
