//! Diagnostic decorator for any [`ServerFacade`].
//!
//! [`LoggingFacade`] forwards every call unchanged and logs a one-line
//! summary of each request and response at `debug`, plus a recursive dump
//! of the wire data at `trace`. It never alters arguments, results or call
//! order.

use crate::data::Data;
use crate::error::FacadeResult;
use crate::facade::ServerFacade;
use crate::known::KnownObjects;
use crate::messages::{
    AuthorizationRequest, AuthorizationResponse, ClearAssociationRequest,
    ClearAssociationResponse, ClearValueRequest, ClearValueResponse, CloseSessionRequest,
    CloseSessionResponse, ExecuteClientActionRequest, ExecuteClientActionResponse,
    ExecuteServerActionRequest, ExecuteServerActionResponse, FindInstancesRequest,
    FindInstancesResponse, GetObjectRequest, GetObjectResponse, GetPropertiesRequest,
    GetPropertiesResponse, HasInstancesRequest, HasInstancesResponse, ObjectChanges,
    OidForServiceRequest, OidForServiceResponse, OpenSessionRequest, OpenSessionResponse,
    ResolveFieldRequest, ResolveFieldResponse, ResolveObjectRequest, ResolveObjectResponse,
    SetAssociationRequest, SetAssociationResponse, SetValueRequest, SetValueResponse,
};
use std::fmt::Write as _;
use tracing::{debug, enabled, trace, Level};

/// Renders `data` as an indented tree.
///
/// An object or collection whose oid was already rendered earlier in the
/// same dump is printed once more as a single line marked
/// `(already detailed)`.
pub fn dump_data(data: &Data) -> String {
    let mut out = String::new();
    let mut detailed = KnownObjects::new();
    dump_into(&mut out, data, 0, &mut detailed);
    out
}

/// Renders several values, sharing one "already detailed" set.
pub fn dump_all(data: &[Data]) -> String {
    let mut out = String::new();
    let mut detailed = KnownObjects::new();
    for item in data {
        dump_into(&mut out, item, 0, &mut detailed);
    }
    out
}

fn dump_into(out: &mut String, data: &Data, depth: usize, detailed: &mut KnownObjects) {
    let indent = "  ".repeat(depth);
    match data {
        Data::Null(d) => {
            let _ = writeln!(out, "{indent}null <{}>", d.type_name);
        }
        Data::Encodable(d) => {
            let _ = writeln!(out, "{indent}{:?} <{}>", d.encoded, d.type_name);
        }
        Data::Identity(d) => {
            let _ = writeln!(out, "{indent}ref {} <{}> {}", d.oid, d.type_name, version(data));
        }
        Data::Object(d) => {
            if !detailed.mark(&d.oid) {
                let _ = writeln!(out, "{indent}{} <{}> (already detailed)", d.oid, d.type_name);
                return;
            }
            match d.fields() {
                Some(fields) => {
                    let _ = writeln!(out, "{indent}{} <{}> {}", d.oid, d.type_name, version(data));
                    for field in fields {
                        dump_into(out, field, depth + 1, detailed);
                    }
                }
                None => {
                    let _ = writeln!(
                        out,
                        "{indent}{} <{}> {} (stub)",
                        d.oid,
                        d.type_name,
                        version(data)
                    );
                }
            }
        }
        Data::Collection(d) => {
            if !detailed.mark(&d.oid) {
                let _ = writeln!(out, "{indent}{} [{}] (already detailed)", d.oid, d.type_name);
                return;
            }
            match d.elements() {
                Some(elements) => {
                    let _ = writeln!(
                        out,
                        "{indent}{} [{}] {} element(s)",
                        d.oid,
                        d.type_name,
                        elements.len()
                    );
                    for element in elements {
                        dump_into(out, element, depth + 1, detailed);
                    }
                }
                None => {
                    let _ = writeln!(out, "{indent}{} [{}] (not loaded)", d.oid, d.type_name);
                }
            }
        }
    }
}

fn version(data: &Data) -> String {
    data.version()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

fn trace_data(label: &str, data: &[Data]) {
    if enabled!(Level::TRACE) && !data.is_empty() {
        trace!("{label}:\n{}", dump_all(data));
    }
}

fn trace_changes(changes: &ObjectChanges) {
    if enabled!(Level::TRACE) && !changes.is_empty() {
        let updates: Vec<Data> = changes.updates.iter().cloned().map(Data::Object).collect();
        trace!(
            disposed = changes.disposed.len(),
            "updates:\n{}",
            dump_all(&updates)
        );
    }
}

/// A pass-through [`ServerFacade`] that logs every call.
pub struct LoggingFacade<F> {
    inner: F,
}

impl<F: ServerFacade> LoggingFacade<F> {
    /// Wraps `inner`.
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    /// Returns the wrapped façade.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn logged<T>(
        &self,
        operation: &'static str,
        summary: String,
        call: impl FnOnce(&F) -> FacadeResult<T>,
        outcome: impl FnOnce(&T) -> String,
    ) -> FacadeResult<T> {
        debug!(operation, "-> {summary}");
        let result = call(&self.inner);
        match &result {
            Ok(response) => debug!(operation, "<- {}", outcome(response)),
            Err(err) => debug!(operation, error = %err, "<- failed"),
        }
        result
    }
}

impl<F: ServerFacade> ServerFacade for LoggingFacade<F> {
    fn open_session(&self, request: OpenSessionRequest) -> FacadeResult<OpenSessionResponse> {
        self.logged(
            "openSession",
            format!("user={}", request.user),
            |f| f.open_session(request),
            |r| format!("session={}", r.session.id),
        )
    }

    fn close_session(&self, request: CloseSessionRequest) -> FacadeResult<CloseSessionResponse> {
        self.logged(
            "closeSession",
            format!("session={}", request.session.id),
            |f| f.close_session(request),
            |_| "closed".to_string(),
        )
    }

    fn authorize_usability(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.logged(
            "authorizeUsability",
            format!("{}#{}", request.target.oid, request.member),
            |f| f.authorize_usability(request),
            |r| format!("allowed={}", r.allowed),
        )
    }

    fn authorize_visibility(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.logged(
            "authorizeVisibility",
            format!("{}#{}", request.target.oid, request.member),
            |f| f.authorize_visibility(request),
            |r| format!("allowed={}", r.allowed),
        )
    }

    fn get_properties(
        &self,
        request: GetPropertiesRequest,
    ) -> FacadeResult<GetPropertiesResponse> {
        self.logged(
            "getProperties",
            String::new(),
            |f| f.get_properties(request),
            |r| format!("{} properties", r.properties.len()),
        )
    }

    fn set_association(
        &self,
        request: SetAssociationRequest,
    ) -> FacadeResult<SetAssociationResponse> {
        self.logged(
            "setAssociation",
            format!(
                "{}.{} = {}",
                request.target.oid, request.field, request.associate.oid
            ),
            |f| f.set_association(request),
            |r| {
                trace_changes(&r.changes);
                format!("{} updates", r.changes.updates.len())
            },
        )
    }

    fn clear_association(
        &self,
        request: ClearAssociationRequest,
    ) -> FacadeResult<ClearAssociationResponse> {
        self.logged(
            "clearAssociation",
            format!(
                "{}.{} -= {}",
                request.target.oid, request.field, request.associate.oid
            ),
            |f| f.clear_association(request),
            |r| {
                trace_changes(&r.changes);
                format!("{} updates", r.changes.updates.len())
            },
        )
    }

    fn set_value(&self, request: SetValueRequest) -> FacadeResult<SetValueResponse> {
        self.logged(
            "setValue",
            format!(
                "{}.{} = {:?}",
                request.target.oid, request.field, request.value.encoded
            ),
            |f| f.set_value(request),
            |r| {
                trace_changes(&r.changes);
                format!("{} updates", r.changes.updates.len())
            },
        )
    }

    fn clear_value(&self, request: ClearValueRequest) -> FacadeResult<ClearValueResponse> {
        self.logged(
            "clearValue",
            format!("{}.{}", request.target.oid, request.field),
            |f| f.clear_value(request),
            |r| {
                trace_changes(&r.changes);
                format!("{} updates", r.changes.updates.len())
            },
        )
    }

    fn execute_client_action(
        &self,
        request: ExecuteClientActionRequest,
    ) -> FacadeResult<ExecuteClientActionResponse> {
        trace_data("client action data", &request.data);
        self.logged(
            "executeClientAction",
            format!("{} entries {:?}", request.data.len(), request.types),
            |f| f.execute_client_action(request),
            |r| {
                trace_changes(&r.changes);
                format!(
                    "{} results, {} reachable",
                    r.results.len(),
                    r.reachable.len()
                )
            },
        )
    }

    fn execute_server_action(
        &self,
        request: ExecuteServerActionRequest,
    ) -> FacadeResult<ExecuteServerActionResponse> {
        trace_data("action parameters", &request.parameters);
        self.logged(
            "executeServerAction",
            format!(
                "{}.{} on {}",
                request.type_name,
                request.action,
                request
                    .target
                    .as_ref()
                    .map(|t| t.oid.to_string())
                    .unwrap_or_else(|| "-".into())
            ),
            |f| f.execute_server_action(request),
            |r| {
                trace_data("action result", std::slice::from_ref(&r.result));
                trace_changes(&r.changes);
                format!(
                    "result <{}>, {} messages, {} warnings",
                    r.result.type_name(),
                    r.messages.len(),
                    r.warnings.len()
                )
            },
        )
    }

    fn oid_for_service(
        &self,
        request: OidForServiceRequest,
    ) -> FacadeResult<OidForServiceResponse> {
        self.logged(
            "oidForService",
            request.service_id.clone(),
            |f| f.oid_for_service(request),
            |r| r.identity.oid.to_string(),
        )
    }

    fn get_object(&self, request: GetObjectRequest) -> FacadeResult<GetObjectResponse> {
        self.logged(
            "getObject",
            format!("{} <{}>", request.oid, request.type_name),
            |f| f.get_object(request),
            |r| {
                trace_data("object", &[Data::Object(r.object.clone())]);
                r.object.oid.to_string()
            },
        )
    }

    fn resolve_immediately(
        &self,
        request: ResolveObjectRequest,
    ) -> FacadeResult<ResolveObjectResponse> {
        self.logged(
            "resolveImmediately",
            request.target.oid.to_string(),
            |f| f.resolve_immediately(request),
            |r| {
                trace_data("object", &[Data::Object(r.object.clone())]);
                r.object.oid.to_string()
            },
        )
    }

    fn resolve_field(&self, request: ResolveFieldRequest) -> FacadeResult<ResolveFieldResponse> {
        self.logged(
            "resolveField",
            format!("{}.{}", request.target.oid, request.field),
            |f| f.resolve_field(request),
            |r| {
                trace_data("field", std::slice::from_ref(&r.content));
                format!("<{}>", r.content.type_name())
            },
        )
    }

    fn find_instances(
        &self,
        request: FindInstancesRequest,
    ) -> FacadeResult<FindInstancesResponse> {
        self.logged(
            "findInstances",
            format!("{:?}", request.criteria),
            |f| f.find_instances(request),
            |r| format!("{} instances", r.instances.len()),
        )
    }

    fn has_instances(&self, request: HasInstancesRequest) -> FacadeResult<HasInstancesResponse> {
        self.logged(
            "hasInstances",
            request.type_name.clone(),
            |f| f.has_instances(request),
            |r| r.has_instances.to_string(),
        )
    }
}
