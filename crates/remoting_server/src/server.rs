//! The remoting server.

use crate::actions::{ActionHandler, ActionOutcome, ActionRegistry};
use crate::auth::{AcceptAny, AllowAll, Authenticator, Authorization, Authorizer, SessionRegistry};
use crate::batch::apply_batch;
use crate::config::ServerConfig;
use crate::context::{ActionContext, Effects};
use crate::encoder::ResponseEncoder;
use crate::error::{ServerError, ServerResult};
use crate::services::ServiceRegistry;
use crate::store::{ObjectStore, StoredObject};
use parking_lot::RwLock;
use remoting_protocol::{
    AuthenticationSession, AuthorizationRequest, AuthorizationResponse, ClearAssociationRequest,
    ClearAssociationResponse, ClearValueRequest, ClearValueResponse, CloseSessionRequest,
    CloseSessionResponse, Criteria, Data, ExecuteClientActionRequest, ExecuteClientActionResponse,
    ExecuteServerActionRequest, ExecuteServerActionResponse, FacadeResult, FieldKind,
    FieldOrderProvider, FieldSpec, FindInstancesRequest, FindInstancesResponse, GetObjectRequest,
    GetObjectResponse, GetPropertiesRequest, GetPropertiesResponse, HasInstancesRequest,
    HasInstancesResponse, IdentityData, ObjectChanges, ObjectData, Oid, OidForServiceRequest,
    OidForServiceResponse, OpenSessionRequest, OpenSessionResponse, ResolveFieldRequest,
    ResolveFieldResponse, ResolveObjectRequest, ResolveObjectResponse, ServerFacade,
    SetAssociationRequest, SetAssociationResponse, SetValueRequest, SetValueResponse, Version,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// User recorded on objects the server creates itself.
const SYSTEM_USER: &str = "system";

/// The reference server.
///
/// Holds every domain object in memory and implements each protocol
/// operation directly. Mutations run under one write lock and are rolled
/// back as a whole if they fail.
///
/// # Example
///
/// ```
/// use remoting_server::{RemotingServer, ServerConfig};
/// use remoting_protocol::{OpenSessionRequest, ServerFacade, TypeRegistry};
///
/// let types = TypeRegistry::new().with_type("Customer").value("name", "String").done();
/// let server = RemotingServer::builder(types)
///     .config(ServerConfig::default())
///     .build()
///     .unwrap();
///
/// let opened = server
///     .open_session(OpenSessionRequest { user: "alice".into(), password: String::new() })
///     .unwrap();
/// assert_eq!(opened.session.user, "alice");
/// ```
pub struct RemotingServer {
    config: ServerConfig,
    types: Arc<dyn FieldOrderProvider>,
    store: RwLock<ObjectStore>,
    sessions: SessionRegistry,
    authenticator: Box<dyn Authenticator>,
    authorizer: Box<dyn Authorizer>,
    services: HashMap<String, Oid>,
    actions: ActionRegistry,
    batches: AtomicU64,
}

/// Builder for [`RemotingServer`].
pub struct ServerBuilder {
    config: ServerConfig,
    types: Arc<dyn FieldOrderProvider>,
    authenticator: Box<dyn Authenticator>,
    authorizer: Box<dyn Authorizer>,
    services: ServiceRegistry,
    actions: ActionRegistry,
}

impl ServerBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the authenticator used when `require_auth` is on.
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Box::new(authenticator);
        self
    }

    /// Sets the authorization policy.
    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Box::new(authorizer);
        self
    }

    /// Registers a service backed by an object of `type_name`.
    pub fn service(mut self, service_id: &str, type_name: &str) -> Self {
        self.services.register(service_id, type_name);
        self
    }

    /// Registers a domain action.
    pub fn action<F>(mut self, type_name: &str, action: &str, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, Option<&Oid>, &[Data]) -> ServerResult<ActionOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.actions.register(type_name, action, handler);
        self
    }

    /// Builds the server and creates the service objects.
    pub fn build(self) -> ServerResult<RemotingServer> {
        let sessions = match &self.config.auth_secret {
            Some(secret) => SessionRegistry::new(secret.clone(), self.config.session_expiry),
            None => SessionRegistry::with_random_secret(self.config.session_expiry),
        };

        let mut store = ObjectStore::new();
        let mut services = HashMap::new();
        {
            let mut ctx = ActionContext::new(&mut store, self.types.as_ref(), SYSTEM_USER);
            for (service_id, type_name) in self.services.iter() {
                let oid = ctx.create(type_name)?;
                debug!(service_id, %oid, "service registered");
                services.insert(service_id.to_string(), oid);
            }
        }

        info!(
            services = services.len(),
            actions = self.actions.len(),
            require_auth = self.config.require_auth,
            "remoting server ready"
        );

        Ok(RemotingServer {
            config: self.config,
            types: self.types,
            store: RwLock::new(store),
            sessions,
            authenticator: self.authenticator,
            authorizer: self.authorizer,
            services,
            actions: self.actions,
            batches: AtomicU64::new(0),
        })
    }
}

impl RemotingServer {
    /// Starts building a server over the given metamodel.
    pub fn builder(types: impl FieldOrderProvider + 'static) -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig::default(),
            types: Arc::new(types),
            authenticator: Box::new(AcceptAny),
            authorizer: Box::new(AllowAll),
            services: ServiceRegistry::new(),
            actions: ActionRegistry::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the number of stored objects.
    pub fn object_count(&self) -> usize {
        self.store.read().len()
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of `executeClientAction` batches applied.
    pub fn batches_applied(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Reads the store.
    pub fn with_store<T>(&self, f: impl FnOnce(&ObjectStore) -> T) -> T {
        f(&self.store.read())
    }

    /// Runs `f` as one unit of work on behalf of `user`, rolling back if it
    /// fails.
    pub fn transact<T>(
        &self,
        user: &str,
        f: impl FnOnce(&mut ActionContext<'_>) -> ServerResult<T>,
    ) -> ServerResult<T> {
        self.write(user, f, |_, value, _| Ok(value))
    }

    fn write<R, T>(
        &self,
        user: &str,
        apply: impl FnOnce(&mut ActionContext<'_>) -> ServerResult<R>,
        respond: impl FnOnce(&mut ResponseEncoder<'_>, R, Effects) -> ServerResult<T>,
    ) -> ServerResult<T> {
        let mut store = self.store.write();
        let snapshot = store.snapshot();

        let mut ctx = ActionContext::new(&mut store, self.types.as_ref(), user);
        let applied = apply(&mut ctx);
        let effects = ctx.finish();

        match applied {
            Ok(value) => {
                store.release(snapshot);
                let mut encoder = ResponseEncoder::new(&store, self.types.as_ref());
                respond(&mut encoder, value, effects)
            }
            Err(err) => {
                store.restore(snapshot);
                debug!(error = %err, "unit of work rolled back");
                Err(err)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&mut ResponseEncoder<'_>) -> ServerResult<T>) -> ServerResult<T> {
        let store = self.store.read();
        let mut encoder = ResponseEncoder::new(&store, self.types.as_ref());
        f(&mut encoder)
    }

    fn serve<T>(
        &self,
        operation: &'static str,
        session: &AuthenticationSession,
        f: impl FnOnce(&Self) -> ServerResult<T>,
    ) -> FacadeResult<T> {
        let result = self.sessions.validate(session).and_then(|()| f(self));
        result.map_err(|err| {
            if err.is_server_error() {
                error!(operation, user = %session.user, error = %err, "request failed");
            } else {
                debug!(operation, user = %session.user, error = %err, "request refused");
            }
            err.into()
        })
    }

    fn mutate_field(
        &self,
        session: &AuthenticationSession,
        target: &IdentityData,
        apply: impl FnOnce(&mut ActionContext<'_>, &Oid) -> ServerResult<()>,
    ) -> ServerResult<ObjectChanges> {
        self.write(
            &session.user,
            |ctx| {
                let current = ctx.get(&target.oid)?.version.clone();
                check_version(&target.oid, target.version.as_ref(), &current)?;
                apply(ctx, &target.oid)
            },
            |encoder, (), effects| encoder.changes(&effects),
        )
    }

    fn association(
        &self,
        session: &AuthenticationSession,
        target: &IdentityData,
        field: &str,
        associate: &IdentityData,
        set: bool,
    ) -> ServerResult<ObjectChanges> {
        self.mutate_field(session, target, |ctx, oid| {
            let type_name = ctx.get(oid)?.type_name.clone();
            let spec = ctx.spec(&type_name, field)?;
            match (spec.kind, set) {
                (FieldKind::Reference, true) => {
                    ctx.set_reference(oid, field, Some(associate.oid.clone()))
                }
                (FieldKind::Reference, false) => ctx.set_reference(oid, field, None),
                (FieldKind::Collection, true) => {
                    ctx.add_element(oid, field, associate.oid.clone())
                }
                (FieldKind::Collection, false) => ctx.remove_element(oid, field, &associate.oid),
                (FieldKind::Value, _) => Err(ServerError::InvalidRequest(format!(
                    "{type_name}.{field} is not an association"
                ))),
            }
        })
    }

    fn find(&self, criteria: &Criteria) -> ServerResult<Vec<ObjectData>> {
        let specs = self
            .types
            .fields(criteria.type_name())
            .ok_or_else(|| ServerError::UnknownType(criteria.type_name().to_string()))?;
        self.read(|encoder| {
            let matching: Vec<Oid> = encoder
                .store()
                .instances(criteria.type_name())
                .filter(|object| satisfies(criteria, object, specs))
                .map(|object| object.oid.clone())
                .collect();
            matching.iter().map(|oid| encoder.complete(oid)).collect()
        })
    }
}

fn check_version(oid: &Oid, client: Option<&Version>, server: &Version) -> ServerResult<()> {
    match client {
        Some(version) if !Version::is_stale(version, server) => Ok(()),
        _ => Err(ServerError::ConcurrencyConflict {
            oid: oid.clone(),
            expected: client.cloned(),
            actual: server.clone(),
        }),
    }
}

/// Returns true if `object` satisfies `criteria`.
///
/// The title of an object is its first value field.
fn satisfies(criteria: &Criteria, object: &StoredObject, specs: &[FieldSpec]) -> bool {
    match criteria {
        Criteria::AllInstances { .. } => true,
        Criteria::ByTitle { title, .. } => {
            let needle = title.to_lowercase();
            specs
                .iter()
                .find(|spec| spec.kind == FieldKind::Value)
                .and_then(|spec| object.value(&spec.name))
                .is_some_and(|value| value.to_lowercase().contains(&needle))
        }
        Criteria::ByPattern { pattern } => {
            let Some(fields) = pattern.fields() else {
                return true;
            };
            specs.iter().zip(fields).all(|(spec, data)| match data {
                Data::Encodable(value) => object.value(&spec.name) == Some(value.encoded.as_str()),
                _ => true,
            })
        }
    }
}

impl ServerFacade for RemotingServer {
    fn open_session(&self, request: OpenSessionRequest) -> FacadeResult<OpenSessionResponse> {
        let roles = if self.config.require_auth {
            self.authenticator.authenticate(&request.user, &request.password)
        } else {
            AcceptAny.authenticate(&request.user, &request.password)
        };
        let session = roles.and_then(|roles| self.sessions.open(&request.user, roles));
        match session {
            Ok(session) => Ok(OpenSessionResponse { session }),
            Err(err) => {
                info!(user = %request.user, error = %err, "session refused");
                Err(err.into())
            }
        }
    }

    fn close_session(&self, request: CloseSessionRequest) -> FacadeResult<CloseSessionResponse> {
        self.sessions.close(&request.session)?;
        Ok(CloseSessionResponse {})
    }

    fn authorize_usability(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.serve("authorizeUsability", &request.session, |server| {
            Ok(server
                .authorizer
                .is_usable(&request.session, &request.target.type_name, &request.member)
                .into())
        })
    }

    fn authorize_visibility(
        &self,
        request: AuthorizationRequest,
    ) -> FacadeResult<AuthorizationResponse> {
        self.serve("authorizeVisibility", &request.session, |server| {
            Ok(server
                .authorizer
                .is_visible(&request.session, &request.target.type_name, &request.member)
                .into())
        })
    }

    fn get_properties(
        &self,
        request: GetPropertiesRequest,
    ) -> FacadeResult<GetPropertiesResponse> {
        self.serve("getProperties", &request.session, |server| {
            let mut properties = server.config.properties.clone();
            properties.insert(
                "remoting.version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            );
            Ok(GetPropertiesResponse { properties })
        })
    }

    fn set_association(
        &self,
        request: SetAssociationRequest,
    ) -> FacadeResult<SetAssociationResponse> {
        self.serve("setAssociation", &request.session, |server| {
            let changes = server.association(
                &request.session,
                &request.target,
                &request.field,
                &request.associate,
                true,
            )?;
            Ok(SetAssociationResponse { changes })
        })
    }

    fn clear_association(
        &self,
        request: ClearAssociationRequest,
    ) -> FacadeResult<ClearAssociationResponse> {
        self.serve("clearAssociation", &request.session, |server| {
            let changes = server.association(
                &request.session,
                &request.target,
                &request.field,
                &request.associate,
                false,
            )?;
            Ok(ClearAssociationResponse { changes })
        })
    }

    fn set_value(&self, request: SetValueRequest) -> FacadeResult<SetValueResponse> {
        self.serve("setValue", &request.session, |server| {
            let changes = server.mutate_field(&request.session, &request.target, |ctx, oid| {
                let type_name = ctx.get(oid)?.type_name.clone();
                let spec = ctx.spec(&type_name, &request.field)?;
                if spec.target_type != request.value.type_name {
                    return Err(ServerError::InvalidRequest(format!(
                        "{type_name}.{} holds {}, not {}",
                        request.field, spec.target_type, request.value.type_name
                    )));
                }
                ctx.set_value(oid, &request.field, Some(request.value.encoded.clone()))
            })?;
            Ok(SetValueResponse { changes })
        })
    }

    fn clear_value(&self, request: ClearValueRequest) -> FacadeResult<ClearValueResponse> {
        self.serve("clearValue", &request.session, |server| {
            let changes = server.mutate_field(&request.session, &request.target, |ctx, oid| {
                ctx.set_value(oid, &request.field, None)
            })?;
            Ok(ClearValueResponse { changes })
        })
    }

    fn execute_client_action(
        &self,
        request: ExecuteClientActionRequest,
    ) -> FacadeResult<ExecuteClientActionResponse> {
        self.serve("executeClientAction", &request.session, |server| {
            if request.data.len() > server.config.max_batch_entries {
                return Err(ServerError::InvalidRequest(format!(
                    "batch of {} entries exceeds the limit of {}",
                    request.data.len(),
                    server.config.max_batch_entries
                )));
            }
            let response = server.write(
                &request.session.user,
                |ctx| apply_batch(ctx, &request.data, &request.types),
                |encoder, outcome, effects| {
                    Ok(ExecuteClientActionResponse {
                        results: outcome.results,
                        reachable: outcome.reachable,
                        changes: encoder.changes(&effects)?,
                    })
                },
            )?;
            server.batches.fetch_add(1, Ordering::Relaxed);
            info!(
                user = %request.session.user,
                entries = response.results.len(),
                reachable = response.reachable.len(),
                "client batch committed"
            );
            Ok(response)
        })
    }

    fn execute_server_action(
        &self,
        request: ExecuteServerActionRequest,
    ) -> FacadeResult<ExecuteServerActionResponse> {
        self.serve("executeServerAction", &request.session, |server| {
            let handler: &ActionHandler = server
                .actions
                .get(&request.type_name, &request.action)
                .ok_or_else(|| ServerError::UnknownAction {
                    type_name: request.type_name.clone(),
                    action: request.action.clone(),
                })?;

            if let Authorization::Denied(reason) =
                server
                    .authorizer
                    .is_usable(&request.session, &request.type_name, &request.action)
            {
                return Err(ServerError::BusinessRule(format!(
                    "{}.{} is not usable: {reason}",
                    request.type_name, request.action
                )));
            }

            server.write(
                &request.session.user,
                |ctx| {
                    let target = match &request.target {
                        Some(target) => Some(ctx.get(&target.oid)?.oid.clone()),
                        None => None,
                    };
                    handler(ctx, target.as_ref(), &request.parameters)
                },
                |encoder, outcome, effects| {
                    let result = match outcome {
                        ActionOutcome::Nothing => Data::null("void"),
                        ActionOutcome::Value(value) => Data::Encodable(value),
                        ActionOutcome::Object(oid) => Data::Object(encoder.complete(&oid)?),
                        ActionOutcome::Objects { type_name, oids } => {
                            encoder.list(&type_name, &oids)
                        }
                    };
                    Ok(ExecuteServerActionResponse {
                        result,
                        changes: encoder.changes(&effects)?,
                        messages: effects.messages,
                        warnings: effects.warnings,
                    })
                },
            )
        })
    }

    fn oid_for_service(
        &self,
        request: OidForServiceRequest,
    ) -> FacadeResult<OidForServiceResponse> {
        self.serve("oidForService", &request.session, |server| {
            let oid = server
                .services
                .get(&request.service_id)
                .ok_or_else(|| ServerError::UnknownService(request.service_id.clone()))?;
            let identity = server.with_store(|store| {
                store
                    .get(oid)
                    .map(StoredObject::identity)
                    .ok_or_else(|| ServerError::ObjectNotFound(oid.clone()))
            })?;
            Ok(OidForServiceResponse { identity })
        })
    }

    fn get_object(&self, request: GetObjectRequest) -> FacadeResult<GetObjectResponse> {
        self.serve("getObject", &request.session, |server| {
            let object = server.read(|encoder| encoder.complete(&request.oid))?;
            if object.type_name != request.type_name {
                return Err(ServerError::InvalidRequest(format!(
                    "{} is a {}, not a {}",
                    request.oid, object.type_name, request.type_name
                )));
            }
            Ok(GetObjectResponse { object })
        })
    }

    fn resolve_immediately(
        &self,
        request: ResolveObjectRequest,
    ) -> FacadeResult<ResolveObjectResponse> {
        self.serve("resolveImmediately", &request.session, |server| {
            let object = server.read(|encoder| encoder.complete(&request.target.oid))?;
            Ok(ResolveObjectResponse { object })
        })
    }

    fn resolve_field(&self, request: ResolveFieldRequest) -> FacadeResult<ResolveFieldResponse> {
        self.serve("resolveField", &request.session, |server| {
            let content =
                server.read(|encoder| encoder.field(&request.target.oid, &request.field))?;
            Ok(ResolveFieldResponse { content })
        })
    }

    fn find_instances(
        &self,
        request: FindInstancesRequest,
    ) -> FacadeResult<FindInstancesResponse> {
        self.serve("findInstances", &request.session, |server| {
            Ok(FindInstancesResponse {
                instances: server.find(&request.criteria)?,
            })
        })
    }

    fn has_instances(&self, request: HasInstancesRequest) -> FacadeResult<HasInstancesResponse> {
        self.serve("hasInstances", &request.session, |server| {
            Ok(HasInstancesResponse {
                has_instances: server.with_store(|store| store.has_instances(&request.type_name)),
            })
        })
    }
}
