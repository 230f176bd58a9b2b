//! Client-side proxy of the persistence layer.

use crate::cache::{LocalField, LocalObject, LocalRef, ObjectCache, ObjectState};
use crate::config::ClientConfig;
use crate::decoder::{Decoded, GraphDecoder};
use crate::error::{ClientError, ClientResult};
use crate::transaction::{Recorded, TransactionManager, TransactionOutcome};
use remoting_protocol::{
    AuthenticationSession, AuthorizationRequest, AuthorizationResponse, ClientActionType,
    CloseSessionRequest, Criteria, Data, ExecuteServerActionRequest, FieldKind,
    FieldOrderProvider, FieldSpec, FindInstancesRequest, GetObjectRequest, GetPropertiesRequest,
    HasInstancesRequest, IdentityData, OidForServiceRequest, Oid, OpenSessionRequest,
    ResolveFieldRequest, ResolveObjectRequest, ServerFacade,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a server action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    /// Returned value, decoded into the cache.
    pub value: Decoded,
    /// Informational messages raised by the action.
    pub messages: Vec<String>,
    /// Warnings raised by the action.
    pub warnings: Vec<String>,
}

/// Mirrors server objects locally and sends local changes back in batches.
///
/// Reads go to the server immediately. Mutations only touch the cache and
/// are recorded in the open transaction; [`end_transaction`] sends them in
/// one exchange.
///
/// [`end_transaction`]: ClientPersistor::end_transaction
pub struct ClientPersistor {
    facade: Arc<dyn ServerFacade>,
    types: Arc<dyn FieldOrderProvider>,
    config: ClientConfig,
    session: Option<AuthenticationSession>,
    cache: ObjectCache,
    transactions: TransactionManager,
}

impl ClientPersistor {
    /// Creates a persistor talking to `facade`. No session is opened yet.
    pub fn new(
        facade: Arc<dyn ServerFacade>,
        types: Arc<dyn FieldOrderProvider>,
        config: ClientConfig,
    ) -> Self {
        Self {
            facade,
            types,
            config,
            session: None,
            cache: ObjectCache::new(),
            transactions: TransactionManager::new(),
        }
    }

    /// Opens a session for the configured user.
    pub fn open(&mut self) -> ClientResult<&AuthenticationSession> {
        let response = self.facade.open_session(OpenSessionRequest {
            user: self.config.user.clone(),
            password: self.config.password.clone(),
        })?;
        info!(user = %response.session.user, session = %response.session.id, "session opened");
        Ok(self.session.insert(response.session))
    }

    /// Closes the session, discarding any open transaction.
    pub fn close(&mut self) -> ClientResult<()> {
        let session = self.session.take().ok_or(ClientError::NotConnected)?;
        if self.transactions.is_open() {
            self.abort_transaction()?;
        }
        self.facade.close_session(CloseSessionRequest {
            session: session.clone(),
        })?;
        info!(session = %session.id, "session closed");
        Ok(())
    }

    /// Returns the open session.
    pub fn session(&self) -> ClientResult<&AuthenticationSession> {
        self.session.as_ref().ok_or(ClientError::NotConnected)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the cache.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Returns a live cached object.
    pub fn object(&self, r: LocalRef) -> ClientResult<&LocalObject> {
        self.cache.live(r)
    }

    // Transactions

    /// Opens a transaction.
    pub fn start_transaction(&mut self) -> ClientResult<()> {
        self.transactions.start()
    }

    /// Returns true while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transactions.is_open()
    }

    /// Commits the open transaction in at most one exchange.
    pub fn end_transaction(&mut self) -> ClientResult<TransactionOutcome> {
        let session = self.session.as_ref().ok_or(ClientError::NotConnected)?;
        self.transactions
            .end(&*self.facade, session, &mut self.cache, &*self.types)
    }

    /// Discards the open transaction without contacting the server.
    ///
    /// Persistent objects it touched are turned back into ghosts so their
    /// server state is reloaded on next use.
    pub fn abort_transaction(&mut self) -> ClientResult<()> {
        let entries = self.transactions.abort()?;
        for entry in &entries {
            if entry.kind != ClientActionType::Add {
                self.cache.invalidate(entry.object)?;
            }
        }
        debug!(discarded = entries.len(), "transaction aborted");
        Ok(())
    }

    // Local mutation

    /// Creates a transient object of `type_name`.
    pub fn create_transient(&mut self, type_name: &str) -> ClientResult<LocalRef> {
        let specs = self
            .types
            .fields(type_name)
            .ok_or_else(|| ClientError::UnknownType(type_name.to_string()))?;
        Ok(self.cache.create_transient(type_name, specs))
    }

    /// Schedules a transient object to be persisted.
    pub fn make_persistent(&mut self, r: LocalRef) -> ClientResult<()> {
        let object = self.cache.live(r)?;
        if !object.is_transient() {
            return Err(ClientError::AlreadyPersistent(object.oid().clone()));
        }
        self.transactions.record(r, ClientActionType::Add)?;
        Ok(())
    }

    /// Sets or clears a value field.
    pub fn set_value(&mut self, r: LocalRef, field: &str, value: Option<&str>) -> ClientResult<()> {
        self.prepare(r, field, FieldKind::Value)?;
        self.cache
            .get_mut(r)?
            .set_field(field, LocalField::Value(value.map(str::to_string)));
        self.touched(r)
    }

    /// Sets or clears a reference field.
    pub fn set_reference(
        &mut self,
        r: LocalRef,
        field: &str,
        target: Option<LocalRef>,
    ) -> ClientResult<()> {
        if let Some(target) = target {
            self.cache.live(target)?;
        }
        self.prepare(r, field, FieldKind::Reference)?;
        self.cache
            .get_mut(r)?
            .set_field(field, LocalField::Reference(target));
        self.touched(r)
    }

    /// Appends `element` to a collection field.
    ///
    /// Adding an element already present changes nothing.
    pub fn add_element(&mut self, r: LocalRef, field: &str, element: LocalRef) -> ClientResult<()> {
        self.cache.live(element)?;
        let mut elements = self.loaded_elements(r, field)?;
        if elements.contains(&element) {
            return Ok(());
        }
        elements.push(element);
        self.cache
            .get_mut(r)?
            .set_field(field, LocalField::Collection(Some(elements)));
        self.touched(r)
    }

    /// Removes `element` from a collection field.
    pub fn remove_element(
        &mut self,
        r: LocalRef,
        field: &str,
        element: LocalRef,
    ) -> ClientResult<()> {
        let mut elements = self.loaded_elements(r, field)?;
        let before = elements.len();
        elements.retain(|e| *e != element);
        if elements.len() == before {
            return Ok(());
        }
        self.cache
            .get_mut(r)?
            .set_field(field, LocalField::Collection(Some(elements)));
        self.touched(r)
    }

    /// Schedules `r` for deletion.
    ///
    /// A transient object never sent to the server is disposed at once.
    pub fn destroy(&mut self, r: LocalRef) -> ClientResult<()> {
        self.require_transaction()?;
        let transient = self.cache.live(r)?.is_transient();
        let scheduled = self
            .transactions
            .pending()
            .iter()
            .any(|entry| entry.object == r);
        if transient && !scheduled {
            return self.cache.dispose(r);
        }
        if let Recorded::Cancelled = self.transactions.record(r, ClientActionType::Delete)? {
            self.cache.dispose(r)?;
        }
        Ok(())
    }

    fn require_transaction(&self) -> ClientResult<()> {
        if !self.transactions.is_open() {
            return Err(ClientError::NotInTransaction);
        }
        Ok(())
    }

    /// Checks a mutation of `field` and makes sure `r` is resolved.
    fn prepare(&mut self, r: LocalRef, field: &str, kind: FieldKind) -> ClientResult<FieldSpec> {
        self.require_transaction()?;
        let spec = self.spec(r, field)?;
        if spec.kind != kind {
            return Err(ClientError::WrongFieldKind {
                type_name: self.cache.get(r)?.type_name().to_string(),
                field: field.to_string(),
                expected: kind,
            });
        }
        self.resolve(r)?;
        Ok(spec)
    }

    fn loaded_elements(&mut self, r: LocalRef, field: &str) -> ClientResult<Vec<LocalRef>> {
        self.prepare(r, field, FieldKind::Collection)?;
        if let Some(elements) = self.cache.get(r)?.elements(field) {
            return Ok(elements.to_vec());
        }
        match self.resolve_field(r, field)? {
            Decoded::Objects(elements) => Ok(elements),
            other => Err(ClientError::unexpected(format!(
                "collection {field} resolved to {other:?}"
            ))),
        }
    }

    fn touched(&mut self, r: LocalRef) -> ClientResult<()> {
        if !self.cache.get(r)?.is_transient() {
            self.transactions.record(r, ClientActionType::Change)?;
        }
        Ok(())
    }

    /// A decoder that leaves objects with pending entries untouched.
    fn decoder(&mut self) -> GraphDecoder<'_> {
        let pending: Vec<LocalRef> = self
            .transactions
            .pending()
            .iter()
            .map(|entry| entry.object)
            .collect();
        GraphDecoder::new(&mut self.cache, &*self.types).with_pinned(pending)
    }

    fn spec(&self, r: LocalRef, field: &str) -> ClientResult<FieldSpec> {
        let type_name = self.cache.live(r)?.type_name();
        self.types
            .field(type_name, field)
            .cloned()
            .ok_or_else(|| ClientError::UnknownField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    // Retrieval

    /// Fetches the object `oid` of `type_name`.
    pub fn load(&mut self, oid: &Oid, type_name: &str) -> ClientResult<LocalRef> {
        let response = self.facade.get_object(GetObjectRequest {
            session: self.session()?.clone(),
            oid: oid.clone(),
            type_name: type_name.to_string(),
        })?;
        self.decoder().object(&response.object)
    }

    /// Loads the fields of a ghost. Other objects are left as they are.
    pub fn resolve(&mut self, r: LocalRef) -> ClientResult<()> {
        if self.cache.live(r)?.state() != ObjectState::Ghost {
            return Ok(());
        }
        let target = self.identity(r)?;
        let response = self.facade.resolve_immediately(ResolveObjectRequest {
            session: self.session()?.clone(),
            target,
        })?;
        self.decoder().object(&response.object)?;
        Ok(())
    }

    /// Loads one field of `r` and stores it in the cache.
    pub fn resolve_field(&mut self, r: LocalRef, field: &str) -> ClientResult<Decoded> {
        let target = self.identity(r)?;
        let response = self.facade.resolve_field(ResolveFieldRequest {
            session: self.session()?.clone(),
            target,
            field: field.to_string(),
        })?;
        self.decoder().field(r, field, &response.content)
    }

    /// Returns the singleton object behind a service id.
    pub fn service(&mut self, service_id: &str) -> ClientResult<LocalRef> {
        let response = self.facade.oid_for_service(OidForServiceRequest {
            session: self.session()?.clone(),
            service_id: service_id.to_string(),
        })?;
        let identity = response.identity;
        Ok(self
            .cache
            .ghost(&identity.oid, &identity.type_name, identity.version))
    }

    /// Runs a query.
    pub fn find_instances(&mut self, criteria: Criteria) -> ClientResult<Vec<LocalRef>> {
        let response = self.facade.find_instances(FindInstancesRequest {
            session: self.session()?.clone(),
            criteria,
        })?;
        let mut decoder = self.decoder();
        response
            .instances
            .iter()
            .map(|object| decoder.object(object))
            .collect()
    }

    /// Returns true if the server holds any instance of `type_name`.
    pub fn has_instances(&self, type_name: &str) -> ClientResult<bool> {
        let response = self.facade.has_instances(HasInstancesRequest {
            session: self.session()?.clone(),
            type_name: type_name.to_string(),
        })?;
        Ok(response.has_instances)
    }

    /// Reads the server properties.
    pub fn properties(&self) -> ClientResult<BTreeMap<String, String>> {
        let response = self.facade.get_properties(GetPropertiesRequest {
            session: self.session()?.clone(),
        })?;
        Ok(response.properties)
    }

    // Server actions and authorization

    /// Returns `r` as an action parameter.
    pub fn reference(&self, r: LocalRef) -> ClientResult<Data> {
        Ok(Data::Identity(self.identity(r)?))
    }

    /// Invokes `action` of `type_name` on the server, on `target` if given.
    ///
    /// Side effects reported by the server are applied to the cache before
    /// the result is decoded.
    pub fn execute_action(
        &mut self,
        target: Option<LocalRef>,
        type_name: &str,
        action: &str,
        parameters: Vec<Data>,
    ) -> ClientResult<ActionResult> {
        let target = target.map(|r| self.identity(r)).transpose()?;
        let response = self.facade.execute_server_action(ExecuteServerActionRequest {
            session: self.session()?.clone(),
            target,
            type_name: type_name.to_string(),
            action: action.to_string(),
            parameters,
        })?;

        let mut decoder = self.decoder();
        decoder.changes(&response.changes)?;
        let value = decoder.decode(&response.result)?;
        for warning in &response.warnings {
            debug!(action, warning = %warning, "action warning");
        }
        Ok(ActionResult {
            value,
            messages: response.messages,
            warnings: response.warnings,
        })
    }

    /// Asks whether `member` of `r` may be used.
    pub fn is_usable(&self, r: LocalRef, member: &str) -> ClientResult<AuthorizationResponse> {
        let request = self.authorization(r, member)?;
        Ok(self.facade.authorize_usability(request)?)
    }

    /// Asks whether `member` of `r` may be seen.
    pub fn is_visible(&self, r: LocalRef, member: &str) -> ClientResult<AuthorizationResponse> {
        let request = self.authorization(r, member)?;
        Ok(self.facade.authorize_visibility(request)?)
    }

    fn authorization(&self, r: LocalRef, member: &str) -> ClientResult<AuthorizationRequest> {
        Ok(AuthorizationRequest {
            session: self.session()?.clone(),
            target: self.identity(r)?,
            member: member.to_string(),
        })
    }

    /// Identity of a persistent object as the server knows it.
    fn identity(&self, r: LocalRef) -> ClientResult<IdentityData> {
        let object = self.cache.live(r)?;
        if object.is_transient() {
            return Err(ClientError::NotPersistent(object.oid().clone()));
        }
        Ok(IdentityData::new(
            object.oid().without_previous(),
            object.type_name(),
            object.version().cloned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoting_protocol::{FaultKind, TypeRegistry};
    use remoting_server::RemotingServer;

    fn types() -> TypeRegistry {
        TypeRegistry::new()
            .with_type("Customer")
            .value("name", "String")
            .reference("best", "Customer")
            .collection("friends", "Customer")
            .done()
    }

    fn persistor() -> (Arc<RemotingServer>, ClientPersistor) {
        let server = Arc::new(RemotingServer::builder(types()).build().unwrap());
        let mut persistor =
            ClientPersistor::new(server.clone(), Arc::new(types()), ClientConfig::new("alice"));
        persistor.open().unwrap();
        (server, persistor)
    }

    #[test]
    fn mutations_need_a_transaction() {
        let (_, mut persistor) = persistor();
        let ada = persistor.create_transient("Customer").unwrap();
        assert_eq!(
            persistor.set_value(ada, "name", Some("Ada")),
            Err(ClientError::NotInTransaction)
        );
        assert_eq!(persistor.make_persistent(ada), Err(ClientError::NotInTransaction));
        assert_eq!(persistor.destroy(ada), Err(ClientError::NotInTransaction));
    }

    #[test]
    fn field_checks() {
        let (_, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();

        assert!(matches!(
            persistor.set_value(ada, "nickname", Some("A")),
            Err(ClientError::UnknownField { .. })
        ));
        assert!(matches!(
            persistor.set_value(ada, "best", Some("A")),
            Err(ClientError::WrongFieldKind { expected: FieldKind::Value, .. })
        ));
        assert!(matches!(
            persistor.create_transient("Order"),
            Err(ClientError::UnknownType(_))
        ));
        assert!(matches!(
            persistor.is_usable(ada, "name"),
            Err(ClientError::NotPersistent(_))
        ));
    }

    #[test]
    fn add_then_delete_never_reaches_the_server() {
        let (server, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();
        persistor.make_persistent(ada).unwrap();
        persistor.set_value(ada, "name", Some("Ada")).unwrap();
        persistor.destroy(ada).unwrap();

        let outcome = persistor.end_transaction().unwrap();
        assert_eq!(outcome.round_trips, 0);
        assert_eq!(server.batches_applied(), 0);
        assert!(matches!(persistor.object(ada), Err(ClientError::Disposed(_))));
    }

    #[test]
    fn persist_change_and_delete() {
        let (server, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();
        let bob = persistor.create_transient("Customer").unwrap();
        persistor.set_value(ada, "name", Some("Ada")).unwrap();
        persistor.set_value(bob, "name", Some("Bob")).unwrap();
        persistor.set_reference(ada, "best", Some(bob)).unwrap();
        persistor.make_persistent(ada).unwrap();

        let outcome = persistor.end_transaction().unwrap();
        assert_eq!(outcome.persisted, vec![ada, bob]);
        assert_eq!(server.object_count(), 2);
        assert!(!persistor.object(bob).unwrap().is_transient());

        persistor.start_transaction().unwrap();
        persistor.add_element(ada, "friends", bob).unwrap();
        persistor.destroy(bob).unwrap();
        let outcome = persistor.end_transaction().unwrap();
        assert_eq!(outcome.changed, vec![ada]);
        assert_eq!(outcome.deleted, vec![bob]);
        assert_eq!(server.object_count(), 1);
        assert_eq!(persistor.object(ada).unwrap().elements("friends"), Some(&[][..]));
    }

    fn stored_name(server: &RemotingServer, persistor: &ClientPersistor, r: LocalRef) -> Option<String> {
        let oid = persistor.object(r).unwrap().oid().without_previous();
        server.with_store(|store| store.get(&oid).and_then(|o| o.value("name").map(str::to_string)))
    }

    #[test]
    fn reads_inside_a_transaction_keep_pending_changes() {
        let (server, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();
        persistor.set_value(ada, "name", Some("Ada")).unwrap();
        persistor.make_persistent(ada).unwrap();
        persistor.end_transaction().unwrap();

        persistor.start_transaction().unwrap();
        persistor.set_value(ada, "name", Some("Ada L.")).unwrap();
        let found = persistor
            .find_instances(Criteria::AllInstances {
                type_name: "Customer".into(),
            })
            .unwrap();
        assert_eq!(found, vec![ada]);
        assert_eq!(persistor.object(ada).unwrap().value("name"), Some("Ada L."));
        let oid = persistor.object(ada).unwrap().oid().without_previous();
        assert_eq!(persistor.load(&oid, "Customer").unwrap(), ada);
        assert!(matches!(
            persistor.resolve_field(ada, "name").unwrap(),
            Decoded::Value(value) if value.encoded == "Ada L."
        ));

        let outcome = persistor.end_transaction().unwrap();
        assert_eq!(outcome.changed, vec![ada]);
        assert_eq!(stored_name(&server, &persistor, ada).as_deref(), Some("Ada L."));
    }

    #[test]
    fn deleting_a_referenced_object_alongside_a_change_to_its_referrer() {
        let (server, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();
        let bob = persistor.create_transient("Customer").unwrap();
        persistor.set_reference(ada, "best", Some(bob)).unwrap();
        persistor.make_persistent(ada).unwrap();
        persistor.end_transaction().unwrap();

        persistor.start_transaction().unwrap();
        persistor.destroy(bob).unwrap();
        persistor.set_value(ada, "name", Some("Ada")).unwrap();
        let outcome = persistor.end_transaction().unwrap();

        assert!(outcome.is_clean(), "{:?}", outcome.conflicts);
        assert_eq!(outcome.changed, vec![ada]);
        assert_eq!(outcome.deleted, vec![bob]);
        assert_eq!(persistor.object(ada).unwrap().state(), ObjectState::Resolved);
        assert_eq!(persistor.object(ada).unwrap().reference("best"), None);
        assert_eq!(stored_name(&server, &persistor, ada).as_deref(), Some("Ada"));
        assert_eq!(server.object_count(), 1);
    }

    #[test]
    fn abort_reloads_touched_objects() {
        let (_, mut persistor) = persistor();
        persistor.start_transaction().unwrap();
        let ada = persistor.create_transient("Customer").unwrap();
        persistor.set_value(ada, "name", Some("Ada")).unwrap();
        persistor.make_persistent(ada).unwrap();
        persistor.end_transaction().unwrap();

        persistor.start_transaction().unwrap();
        persistor.set_value(ada, "name", Some("Eve")).unwrap();
        persistor.abort_transaction().unwrap();
        assert_eq!(persistor.object(ada).unwrap().state(), ObjectState::Ghost);

        persistor.resolve(ada).unwrap();
        assert_eq!(persistor.object(ada).unwrap().value("name"), Some("Ada"));
    }

    #[test]
    fn closed_persistor_is_not_connected() {
        let (_, mut persistor) = persistor();
        persistor.close().unwrap();
        assert_eq!(persistor.has_instances("Customer"), Err(ClientError::NotConnected));
        assert_eq!(persistor.close(), Err(ClientError::NotConnected));
    }

    #[test]
    fn unknown_service_is_a_fault() {
        let (_, mut persistor) = persistor();
        let err = persistor.service("nowhere").unwrap_err();
        assert!(err.fault().is_some());
        assert_ne!(err.fault().map(|f| f.kind), Some(FaultKind::Authentication));
    }
}
