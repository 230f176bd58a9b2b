//! Integration tests for the client persistor against the reference server.

use parking_lot::Mutex;
use remoting_client::{
    ClientConfig, ClientError, ClientPersistor, Decoded, LoopbackTransport, ObjectState,
    ProxyFacade, StreamTransport, Transport,
};
use remoting_protocol::{
    Criteria, Data, Decode, Encode, EntryFailure, FacadeError, FacadeResult, FieldOrderProvider,
    HasInstancesRequest, LoggingFacade, Oid, ResponseEnvelope, ServerFacade, TypeRegistry,
};
use remoting_server::{
    ActionOutcome, Listener, RemotingServer, RuleAuthorizer, ServerConfig, ServerEndpoint,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn types() -> TypeRegistry {
    TypeRegistry::new()
        .with_type("Customer")
        .value("name", "String")
        .reference("referrer", "Customer")
        .collection("orders", "Order")
        .done()
        .with_type("Order")
        .value("number", "Int")
        .reference("customer", "Customer")
        .done()
        .with_type("Shop")
        .done()
}

fn server() -> RemotingServer {
    RemotingServer::builder(types())
        .service("shop", "Shop")
        .authorizer(RuleAuthorizer::new().disable("Customer", "name", "names are frozen"))
        .action("Shop", "open", |ctx, _target, args| {
            let oid = ctx.create("Customer")?;
            if let Some(Data::Encodable(name)) = args.first() {
                ctx.set_value(&oid, "name", Some(name.encoded.clone()))?;
            }
            ctx.message("welcome");
            Ok(ActionOutcome::Object(oid))
        })
        .action("Customer", "rename", |ctx, target, args| {
            let target = target.cloned().ok_or_else(|| {
                remoting_server::ServerError::BusinessRule("rename needs a customer".into())
            })?;
            let name = match args.first() {
                Some(Data::Encodable(name)) => name.encoded.clone(),
                _ => String::new(),
            };
            ctx.set_value(&target, "name", Some(name))?;
            ctx.warn("renamed");
            Ok(ActionOutcome::Nothing)
        })
        .build()
        .unwrap()
}

type Loopback = ProxyFacade<LoopbackTransport<ServerEndpoint>>;

struct Fixture {
    server: Arc<LoggingFacade<RemotingServer>>,
    proxy: Arc<Loopback>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let server = Arc::new(LoggingFacade::new(server()));
        let endpoint = ServerEndpoint::new(server.clone());
        let proxy = Arc::new(ProxyFacade::new(LoopbackTransport::new(endpoint)));
        Self { server, proxy }
    }

    fn persistor(&self, user: &str) -> ClientPersistor {
        let mut persistor =
            ClientPersistor::new(self.proxy.clone(), Arc::new(types()), ClientConfig::new(user));
        persistor.open().unwrap();
        persistor
    }

    /// A second session with its own proxy and correlator.
    fn second_persistor(&self, user: &str) -> ClientPersistor {
        let endpoint = ServerEndpoint::new(self.server.clone());
        let proxy = ProxyFacade::new(LoopbackTransport::new(endpoint));
        let mut persistor =
            ClientPersistor::new(Arc::new(proxy), Arc::new(types()), ClientConfig::new(user));
        persistor.open().unwrap();
        persistor
    }

    fn round_trips(&self) -> u64 {
        self.proxy.transport().round_trips()
    }

    fn batches(&self) -> u64 {
        self.server.inner().batches_applied()
    }
}

fn persisted_customer(persistor: &mut ClientPersistor, name: &str) -> remoting_client::LocalRef {
    persistor.start_transaction().unwrap();
    let customer = persistor.create_transient("Customer").unwrap();
    persistor.set_value(customer, "name", Some(name)).unwrap();
    persistor.make_persistent(customer).unwrap();
    persistor.end_transaction().unwrap();
    customer
}

#[test]
fn add_and_change_in_one_exchange() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");
    let y = persisted_customer(&mut persistor, "Y");
    let y_before = persistor.object(y).unwrap().version().cloned().unwrap();

    persistor.start_transaction().unwrap();
    let x = persistor.create_transient("Customer").unwrap();
    let t1 = persistor.object(x).unwrap().oid().clone();
    persistor.set_value(x, "name", Some("X")).unwrap();
    persistor.make_persistent(x).unwrap();
    persistor.set_value(y, "name", Some("Y2")).unwrap();

    let calls = fixture.round_trips();
    let outcome = persistor.end_transaction().unwrap();
    assert_eq!(fixture.round_trips(), calls + 1);
    assert_eq!(outcome.round_trips, 1);
    assert_eq!(outcome.persisted, vec![x]);
    assert_eq!(outcome.changed, vec![y]);

    let x_object = persistor.object(x).unwrap();
    assert!(!x_object.oid().is_transient());
    assert_eq!(x_object.oid().previous(), Some(&t1));

    let y_after = persistor.object(y).unwrap().version().cloned().unwrap();
    assert_ne!(y_after.sequence(), y_before.sequence());
    let y_oid = persistor.object(y).unwrap().oid().clone();
    let stored = fixture
        .server
        .inner()
        .with_store(|store| store.get(&y_oid).map(|o| o.version.clone()))
        .unwrap();
    assert_eq!(y_after, stored);

    persistor.start_transaction().unwrap();
    let outcome = persistor.end_transaction().unwrap();
    assert_eq!(outcome.round_trips, 0);
    assert_eq!(fixture.round_trips(), calls + 1);
}

#[test]
fn three_dirty_objects_make_one_request() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");
    let a = persisted_customer(&mut persistor, "a");
    let b = persisted_customer(&mut persistor, "b");
    let c = persisted_customer(&mut persistor, "c");
    let batches = fixture.batches();
    let calls = fixture.round_trips();

    persistor.start_transaction().unwrap();
    for (r, name) in [(a, "A"), (b, "B"), (c, "C")] {
        persistor.set_value(r, "name", Some(name)).unwrap();
        persistor.set_value(r, "name", Some(name.repeat(2).as_str())).unwrap();
    }
    let outcome = persistor.end_transaction().unwrap();

    assert_eq!(outcome.changed, vec![a, b, c]);
    assert_eq!(fixture.batches(), batches + 1);
    assert_eq!(fixture.round_trips(), calls + 1);
}

#[test]
fn promotion_retargets_every_reference() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");
    let holder = persisted_customer(&mut persistor, "holder");

    persistor.start_transaction().unwrap();
    let order = persistor.create_transient("Order").unwrap();
    let friend = persistor.create_transient("Customer").unwrap();
    let transient = persistor.object(friend).unwrap().oid().clone();
    persistor.set_value(order, "number", Some("7")).unwrap();
    persistor.set_reference(order, "customer", Some(friend)).unwrap();
    persistor.set_reference(holder, "referrer", Some(friend)).unwrap();
    persistor.add_element(holder, "orders", order).unwrap();
    let outcome = persistor.end_transaction().unwrap();

    assert_eq!(outcome.changed, vec![holder]);
    assert_eq!(outcome.persisted.len(), 2);
    assert!(outcome.persisted.contains(&friend));
    assert!(outcome.persisted.contains(&order));

    let promoted = persistor.object(friend).unwrap().oid().clone();
    assert!(!promoted.is_transient());
    assert_eq!(promoted.previous(), Some(&transient));
    assert_eq!(persistor.cache().lookup(&transient), None);
    assert_eq!(persistor.cache().lookup(&promoted), Some(friend));
    assert_eq!(persistor.object(holder).unwrap().reference("referrer"), Some(friend));
    assert_eq!(persistor.object(order).unwrap().reference("customer"), Some(friend));

    // A second session sees the same graph.
    let mut other = fixture.second_persistor("bob");
    let holder_oid = persistor.object(holder).unwrap().oid().without_previous();
    let remote = other.load(&holder_oid, "Customer").unwrap();
    let referrer = other.object(remote).unwrap().reference("referrer").unwrap();
    assert_eq!(other.object(referrer).unwrap().oid(), &promoted);
    assert_eq!(other.object(referrer).unwrap().state(), ObjectState::Ghost);
    other.resolve(referrer).unwrap();
    assert_eq!(other.object(referrer).unwrap().state(), ObjectState::Resolved);
    match other.resolve_field(remote, "orders").unwrap() {
        Decoded::Objects(orders) => assert_eq!(orders.len(), 1),
        unexpected => panic!("unexpected {unexpected:?}"),
    }
}

#[test]
fn concurrent_change_is_a_conflict() {
    let fixture = Fixture::new();
    let mut alice = fixture.persistor("alice");
    let customer = persisted_customer(&mut alice, "Ada");
    let oid = alice.object(customer).unwrap().oid().without_previous();

    let mut bob = fixture.second_persistor("bob");
    let bobs_copy = bob.load(&oid, "Customer").unwrap();

    alice.start_transaction().unwrap();
    alice.set_value(customer, "name", Some("Ada Lovelace")).unwrap();
    assert!(alice.end_transaction().unwrap().is_clean());

    bob.start_transaction().unwrap();
    bob.set_value(bobs_copy, "name", Some("Ada King")).unwrap();
    let outcome = bob.end_transaction().unwrap();
    assert_eq!(outcome.conflicts.len(), 1);
    assert!(matches!(
        outcome.conflicts[0].failure,
        EntryFailure::VersionConflict { .. }
    ));
    assert_eq!(bob.object(bobs_copy).unwrap().state(), ObjectState::Ghost);

    bob.resolve(bobs_copy).unwrap();
    assert_eq!(bob.object(bobs_copy).unwrap().value("name"), Some("Ada Lovelace"));
}

#[test]
fn services_actions_and_queries() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");

    let shop = persistor.service("shop").unwrap();
    let opened = persistor
        .execute_action(Some(shop), "Shop", "open", vec![Data::value("String", "Grace Hopper")])
        .unwrap();
    assert_eq!(opened.messages, vec!["welcome"]);
    let Decoded::Object(grace) = opened.value else {
        panic!("expected an object, got {:?}", opened.value);
    };
    assert_eq!(persistor.object(grace).unwrap().value("name"), Some("Grace Hopper"));

    let renamed = persistor
        .execute_action(Some(grace), "Customer", "rename", vec![Data::value("String", "Grace B. Hopper")])
        .unwrap();
    assert_eq!(renamed.value, Decoded::Null);
    assert_eq!(renamed.warnings, vec!["renamed"]);
    assert_eq!(persistor.object(grace).unwrap().value("name"), Some("Grace B. Hopper"));

    persisted_customer(&mut persistor, "Ada Lovelace");
    let found = persistor
        .find_instances(Criteria::ByTitle {
            type_name: "Customer".into(),
            title: "hopper".into(),
        })
        .unwrap();
    assert_eq!(found, vec![grace]);
    let all = persistor
        .find_instances(Criteria::AllInstances {
            type_name: "Customer".into(),
        })
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(persistor.has_instances("Customer").unwrap());
    assert!(!persistor.has_instances("Order").unwrap());
    assert!(persistor.properties().unwrap().contains_key("remoting.version"));
}

#[test]
fn authorization_is_answered_not_raised() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");
    let customer = persisted_customer(&mut persistor, "Ada");

    let usable = persistor.is_usable(customer, "name").unwrap();
    assert!(!usable.allowed);
    assert_eq!(usable.reason.as_deref(), Some("names are frozen"));
    assert!(persistor.is_visible(customer, "name").unwrap().allowed);
    assert!(persistor.is_usable(customer, "orders").unwrap().allowed);
}

#[test]
fn deletion_is_applied_on_both_sides() {
    let fixture = Fixture::new();
    let mut persistor = fixture.persistor("alice");
    let customer = persisted_customer(&mut persistor, "Ada");
    let count = fixture.server.inner().object_count();

    persistor.start_transaction().unwrap();
    persistor.destroy(customer).unwrap();
    let outcome = persistor.end_transaction().unwrap();

    assert_eq!(outcome.deleted, vec![customer]);
    assert_eq!(fixture.server.inner().object_count(), count - 1);
    assert!(matches!(persistor.object(customer), Err(ClientError::Disposed(_))));
}

/// Rewrites the id of every response envelope.
struct Tampering<T> {
    inner: T,
    shift: u64,
}

impl<T: Transport> Transport for Tampering<T> {
    fn round_trip(&self, request: Vec<u8>) -> FacadeResult<Vec<u8>> {
        let mut envelope = ResponseEnvelope::decode(&self.inner.round_trip(request)?)?;
        envelope.id += self.shift;
        Ok(envelope.encode()?)
    }
}

#[test]
fn shifted_response_is_never_accepted() {
    init_tracing();
    let server = Arc::new(server());
    let session = server
        .open_session(remoting_protocol::OpenSessionRequest {
            user: "alice".into(),
            password: String::new(),
        })
        .unwrap()
        .session;
    let endpoint = ServerEndpoint::new(server.clone());
    let proxy = ProxyFacade::new(Tampering {
        inner: LoopbackTransport::new(endpoint),
        shift: 1,
    });

    for _ in 0..3 {
        let err = proxy
            .has_instances(HasInstancesRequest {
                session: session.clone(),
                type_name: "Shop".into(),
            })
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert!(matches!(err, FacadeError::OutOfSequence { .. }));
    }
    assert_eq!(proxy.transport().inner.round_trips(), 3);
}

/// Holds each round trip until the test releases it.
struct Gated<T> {
    inner: T,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl<T: Transport> Transport for Gated<T> {
    fn round_trip(&self, request: Vec<u8>) -> FacadeResult<Vec<u8>> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        self.inner.round_trip(request)
    }
}

#[test]
fn second_call_on_a_busy_session_is_refused() {
    init_tracing();
    let server = Arc::new(server());
    let session = server
        .open_session(remoting_protocol::OpenSessionRequest {
            user: "alice".into(),
            password: String::new(),
        })
        .unwrap()
        .session;
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let proxy = Arc::new(ProxyFacade::new(Gated {
        inner: LoopbackTransport::new(ServerEndpoint::new(server)),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    }));

    let request = HasInstancesRequest {
        session,
        type_name: "Shop".into(),
    };
    let background = {
        let proxy = Arc::clone(&proxy);
        let request = request.clone();
        thread::spawn(move || proxy.has_instances(request))
    };

    entered_rx.recv().unwrap();
    assert_eq!(
        proxy.has_instances(request).unwrap_err(),
        FacadeError::RequestInFlight { outstanding: 1 }
    );
    release_tx.send(()).unwrap();
    assert!(background.join().unwrap().unwrap().has_instances);
}

#[test]
fn persistor_over_tcp() {
    init_tracing();
    let server = Arc::new(server());
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    let listener = Listener::bind(&config, Arc::new(ServerEndpoint::new(server.clone()))).unwrap();
    let handle = listener.spawn().unwrap();

    let client_config = ClientConfig::new("alice");
    let transport = StreamTransport::connect(handle.local_addr(), &client_config).unwrap();
    let types: Arc<dyn FieldOrderProvider> = Arc::new(types());
    let mut persistor =
        ClientPersistor::new(Arc::new(ProxyFacade::new(transport)), types, client_config);
    persistor.open().unwrap();

    let ada = persisted_customer(&mut persistor, "Ada");
    let oid: Oid = persistor.object(ada).unwrap().oid().without_previous();
    assert!(server.with_store(|store| store.contains(&oid)));
    assert_eq!(server.batches_applied(), 1);

    persistor.close().unwrap();
    assert_eq!(server.session_count(), 0);
    handle.shutdown();
}
