//! Client-side façade forwarding every call over a transport.

use crate::transport::Transport;
use parking_lot::Mutex;
use remoting_protocol::{
    unexpected, AuthorizationRequest, AuthorizationResponse, ClearAssociationRequest,
    ClearAssociationResponse, ClearValueRequest, ClearValueResponse, CloseSessionRequest,
    CloseSessionResponse, CorrelationState, Correlator, Decode, Encode,
    ExecuteClientActionRequest, ExecuteClientActionResponse, ExecuteServerActionRequest,
    ExecuteServerActionResponse, FacadeError, FacadeResult, FindInstancesRequest,
    FindInstancesResponse, GetObjectRequest, GetObjectResponse, GetPropertiesRequest,
    GetPropertiesResponse, HasInstancesRequest, HasInstancesResponse, OidForServiceRequest,
    OidForServiceResponse, OpenSessionRequest, OpenSessionResponse, Request,
    ResolveFieldRequest, ResolveFieldResponse, ResolveObjectRequest, ResolveObjectResponse,
    Response, ResponseEnvelope, ServerFacade, SetAssociationRequest, SetAssociationResponse,
    SetValueRequest, SetValueResponse,
};
use tracing::{trace, warn};

/// A [`ServerFacade`] that sends each call as one sequence-checked
/// envelope over a [`Transport`].
///
/// One proxy serves one session. The correlator is locked only while an
/// envelope is issued and while its answer is checked, so a second call
/// made while one is in flight fails with
/// [`FacadeError::RequestInFlight`] instead of queueing.
pub struct ProxyFacade<T: Transport> {
    transport: T,
    correlator: Mutex<Correlator>,
}

impl<T: Transport> ProxyFacade<T> {
    /// Creates a proxy over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            correlator: Mutex::new(Correlator::new()),
        }
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the correlation state.
    pub fn state(&self) -> CorrelationState {
        self.correlator.lock().state()
    }

    fn call(&self, request: Request) -> FacadeResult<Response> {
        let operation = request.operation();
        let envelope = self.correlator.lock().begin(request)?;
        let id = envelope.id;

        let exchanged = envelope
            .encode()
            .map_err(FacadeError::from)
            .and_then(|frame| self.transport.round_trip(frame))
            .and_then(|frame| ResponseEnvelope::decode(&frame).map_err(FacadeError::from));
        let answer = match exchanged {
            Ok(answer) => answer,
            Err(err) => {
                warn!(operation, id, error = %err, "exchange abandoned");
                self.correlator.lock().abandon();
                return Err(err);
            }
        };

        let response = self.correlator.lock().complete(answer)?;
        trace!(operation, id, "exchange complete");
        Ok(response)
    }

    fn exchange<R>(
        &self,
        request: Request,
        pick: impl FnOnce(Response) -> Result<R, Response>,
    ) -> FacadeResult<R> {
        let operation = request.operation();
        pick(self.call(request)?).map_err(|other| unexpected(operation, other))
    }
}

impl<T: Transport> ServerFacade for ProxyFacade<T> {
    fn open_session(&self, request: OpenSessionRequest) -> FacadeResult<OpenSessionResponse> {
        self.exchange(Request::OpenSession(request), |r| match r {
            Response::OpenSession(r) => Ok(r),
            other => Err(other),
        })
    }

    fn close_session(&self, request: CloseSessionRequest) -> FacadeResult<CloseSessionResponse> {
        self.exchange(Request::CloseSession(request), |r| match r {
            Response::CloseSession(r) => Ok(r),
            other => Err(other),
        })
    }

    fn authorize_usability(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.exchange(Request::AuthorizeUsability(request), |r| match r {
            Response::Authorization(r) => Ok(r),
            other => Err(other),
        })
    }

    fn authorize_visibility(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.exchange(Request::AuthorizeVisibility(request), |r| match r {
            Response::Authorization(r) => Ok(r),
            other => Err(other),
        })
    }

    fn get_properties(
        &self,
        request: GetPropertiesRequest,
    ) -> FacadeResult<GetPropertiesResponse> {
        self.exchange(Request::GetProperties(request), |r| match r {
            Response::GetProperties(r) => Ok(r),
            other => Err(other),
        })
    }

    fn set_association(
        &self,
        request: SetAssociationRequest,
    ) -> FacadeResult<SetAssociationResponse> {
        self.exchange(Request::SetAssociation(request), |r| match r {
            Response::SetAssociation(r) => Ok(r),
            other => Err(other),
        })
    }

    fn clear_association(
        &self,
        request: ClearAssociationRequest,
    ) -> FacadeResult<ClearAssociationResponse> {
        self.exchange(Request::ClearAssociation(request), |r| match r {
            Response::ClearAssociation(r) => Ok(r),
            other => Err(other),
        })
    }

    fn set_value(&self, request: SetValueRequest) -> FacadeResult<SetValueResponse> {
        self.exchange(Request::SetValue(request), |r| match r {
            Response::SetValue(r) => Ok(r),
            other => Err(other),
        })
    }

    fn clear_value(&self, request: ClearValueRequest) -> FacadeResult<ClearValueResponse> {
        self.exchange(Request::ClearValue(request), |r| match r {
            Response::ClearValue(r) => Ok(r),
            other => Err(other),
        })
    }

    fn execute_client_action(
        &self,
        request: ExecuteClientActionRequest,
    ) -> FacadeResult<ExecuteClientActionResponse> {
        self.exchange(Request::ExecuteClientAction(request), |r| match r {
            Response::ExecuteClientAction(r) => Ok(r),
            other => Err(other),
        })
    }

    fn execute_server_action(
        &self,
        request: ExecuteServerActionRequest,
    ) -> FacadeResult<ExecuteServerActionResponse> {
        self.exchange(Request::ExecuteServerAction(request), |r| match r {
            Response::ExecuteServerAction(r) => Ok(r),
            other => Err(other),
        })
    }

    fn oid_for_service(
        &self,
        request: OidForServiceRequest,
    ) -> FacadeResult<OidForServiceResponse> {
        self.exchange(Request::OidForService(request), |r| match r {
            Response::OidForService(r) => Ok(r),
            other => Err(other),
        })
    }

    fn get_object(&self, request: GetObjectRequest) -> FacadeResult<GetObjectResponse> {
        self.exchange(Request::GetObject(request), |r| match r {
            Response::GetObject(r) => Ok(r),
            other => Err(other),
        })
    }

    fn resolve_immediately(
        &self,
        request: ResolveObjectRequest,
    ) -> FacadeResult<ResolveObjectResponse> {
        self.exchange(Request::ResolveObject(request), |r| match r {
            Response::ResolveObject(r) => Ok(r),
            other => Err(other),
        })
    }

    fn resolve_field(&self, request: ResolveFieldRequest) -> FacadeResult<ResolveFieldResponse> {
        self.exchange(Request::ResolveField(request), |r| match r {
            Response::ResolveField(r) => Ok(r),
            other => Err(other),
        })
    }

    fn find_instances(
        &self,
        request: FindInstancesRequest,
    ) -> FacadeResult<FindInstancesResponse> {
        self.exchange(Request::FindInstances(request), |r| match r {
            Response::FindInstances(r) => Ok(r),
            other => Err(other),
        })
    }

    fn has_instances(&self, request: HasInstancesRequest) -> FacadeResult<HasInstancesResponse> {
        self.exchange(Request::HasInstances(request), |r| match r {
            Response::HasInstances(r) => Ok(r),
            other => Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use proptest::prelude::*;
    use remoting_protocol::{FaultKind, FrameHandler, RequestEnvelope, ServerFault};

    /// Answers every request with a fixed response, under a chosen id.
    struct Scripted {
        shift: u64,
    }

    impl FrameHandler for Scripted {
        fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
            let request = RequestEnvelope::decode(frame).unwrap();
            let response = match request.request {
                Request::CloseSession(_) => Response::CloseSession(CloseSessionResponse {}),
                Request::HasInstances(_) => {
                    Response::HasInstances(HasInstancesResponse { has_instances: true })
                }
                _ => Response::Fault(ServerFault::new(FaultKind::Internal, "scripted")),
            };
            ResponseEnvelope {
                id: request.id + self.shift,
                response,
            }
            .encode()
            .unwrap()
        }
    }

    fn has_instances() -> HasInstancesRequest {
        HasInstancesRequest {
            session: remoting_protocol::AuthenticationSession {
                id: uuid::Uuid::nil(),
                user: "alice".into(),
                roles: Vec::new(),
                token: Vec::new(),
            },
            type_name: "Customer".into(),
        }
    }

    #[test]
    fn matching_answer_is_accepted() {
        let proxy = ProxyFacade::new(LoopbackTransport::new(Scripted { shift: 0 }));
        assert!(proxy.has_instances(has_instances()).unwrap().has_instances);
        assert_eq!(proxy.state(), CorrelationState::Idle);
        assert_eq!(proxy.transport().round_trips(), 1);
    }

    #[test]
    fn stale_answer_is_out_of_sequence() {
        let proxy = ProxyFacade::new(LoopbackTransport::new(Scripted { shift: 1 }));
        let err = proxy.has_instances(has_instances()).unwrap_err();
        assert_eq!(
            err,
            FacadeError::OutOfSequence {
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(proxy.state(), CorrelationState::Idle);
    }

    #[test]
    fn fault_and_wrong_variant_are_errors() {
        let proxy = ProxyFacade::new(LoopbackTransport::new(Scripted { shift: 0 }));
        let err = proxy
            .get_properties(GetPropertiesRequest {
                session: has_instances().session,
            })
            .unwrap_err();
        assert_eq!(err.fault().map(|f| f.kind), Some(FaultKind::Internal));
    }

    struct Broken;

    impl Transport for Broken {
        fn round_trip(&self, _request: Vec<u8>) -> FacadeResult<Vec<u8>> {
            Err(FacadeError::transport("link down"))
        }
    }

    #[test]
    fn transport_failure_releases_the_session() {
        let proxy = ProxyFacade::new(Broken);
        assert!(matches!(
            proxy.has_instances(has_instances()),
            Err(FacadeError::Transport(_))
        ));
        assert_eq!(proxy.state(), CorrelationState::Idle);
    }

    proptest! {
        #[test]
        fn any_shifted_answer_is_rejected(shift in 1u64..1000, calls in 1usize..6) {
            let proxy = ProxyFacade::new(LoopbackTransport::new(Scripted { shift }));
            for _ in 0..calls {
                let err = proxy.has_instances(has_instances()).unwrap_err();
                prop_assert!(err.is_protocol_error());
            }
            prop_assert_eq!(proxy.transport().round_trips(), calls as u64);
        }
    }
}
