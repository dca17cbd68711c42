//! Unit tests over in-memory transports and the loopback interface.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use elwire::ApplicationId;
use elwire::CommandType;
use elwire::DataFrame;
use elwire::DispatchType;
use elwire::ErrorKind;
use elwire::InstanceId;
use elwire::Invocation;
use elwire::NodeId;

use crate::config;
use crate::config::ClusterConfig;
use crate::config::DiscoveryStrategy;
use crate::control::ControlService;
use crate::control::InvocationDispatcher;
use crate::control::LocalInstance;
use crate::control::ReplySink;
use crate::control::client::ControlClient;
use crate::discovery::InstanceDiscoveryService;
use crate::discovery::InstanceHostInfo;
use crate::discovery::Lookup;
use crate::discovery::NamingError;
use crate::discovery::NamingSource;
use crate::discovery::StaticNaming;
use crate::discovery::reconcile;
use crate::error::ClusterError;
use crate::error::Result;
use crate::instance_id::FileInstanceIdStore;
use crate::instance_id::InstanceIdStore;
use crate::instance_id::load_or_create;
use crate::invoker::Callbacks;
use crate::invoker::Executor;
use crate::invoker::Job;
use crate::invoker::RedirectingInvoker;
use crate::invoker::RemoteInvoker;
use crate::invoker::ReturnShape;
use crate::invoker::resolve_hybrid;
use crate::mock_transport::DuplexChannelTransport;
use crate::mock_transport::MockConnector;
use crate::proxy::Arg;
use crate::proxy::CallOutcome;
use crate::proxy::MethodDescriptor;
use crate::proxy::ParamRole;
use crate::proxy::ProxyBuilder;
use crate::proxy::Routing;
use crate::proxy::ServiceDescriptor;
use crate::publisher::Dispatcher;
use crate::publisher::Publisher;
use crate::registry::Cleanup;
use crate::registry::InvokerSource;
use crate::registry::NoCleanup;
use crate::registry::Snapshot;
use crate::routes::RouteHandleRegistry;
use crate::routes::SocketHandle;
use crate::transport::Transport;
use crate::transport::TransportError;

const WAIT: Duration = Duration::from_secs(5);

fn app(n: u128) -> ApplicationId {
    ApplicationId(Uuid::from_u128(n))
}

fn node(instance: u128, application: ApplicationId) -> NodeId {
    NodeId::new(InstanceId(Uuid::from_u128(instance)), application)
}

/// Runs a fake node on `server`: every call is answered with the frames `reply` returns.
fn serve<F>(server: DuplexChannelTransport, reply: F) -> JoinHandle<()>
where
    F: Fn(u64, Invocation) -> Vec<DataFrame> + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(bytes)) = server.recv().await {
            let Ok(DataFrame::Call { seq, invocation }) = DataFrame::decode(&bytes) else {
                continue;
            };
            for frame in reply(seq, invocation) {
                let Ok(bytes) = frame.encode() else { return };
                if server.send(&bytes).await.is_err() {
                    return;
                }
            }
        }
    })
}

fn result(seq: u64, part: u32, payload: &[u8]) -> DataFrame {
    DataFrame::Result { seq, part, payload: payload.to_vec() }
}

fn error(seq: u64, part: u32, message: &str) -> DataFrame {
    DataFrame::Error { seq, part, kind: ErrorKind::Remote, message: message.into() }
}

fn invoker_pair() -> (RemoteInvoker, DuplexChannelTransport) {
    let (client, server) = DuplexChannelTransport::pair();
    (RemoteInvoker::new("mem://node", Box::new(client), WAIT), server)
}

async fn settle(invoker: &RemoteInvoker) {
    tokio::time::timeout(WAIT, async {
        while invoker.pending_calls() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("calls did not settle");
}

// ============================================================================
// Errors and configuration
// ============================================================================

/// Test that independent failures fold into one result.
#[test]
fn test_collect_errors() {
    assert!(ClusterError::collect(Vec::new()).is_ok());

    let one = ClusterError::collect(vec![ClusterError::illegal_state("a")]);
    assert!(matches!(one, Err(ClusterError::IllegalState(_))));

    let many = ClusterError::collect(vec![ClusterError::illegal_state("a"), ClusterError::not_found("b")]);
    match many {
        Err(ClusterError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate, got {:?}", other),
    }
}

/// Test that named values override defaults and unknown names are ignored.
#[test]
fn test_config_from_named_values() {
    let config = ClusterConfig::from_named_values([
        (config::STRATEGY, "server-list-srv"),
        (config::SRV_SERVERS, "10.0.0.1:53, 10.0.0.2"),
        (config::POLL_MILLIS, "250"),
        (config::STATIC_HOSTS, ""),
        ("cluster.unrelated", "whatever"),
    ])
    .expect("valid configuration");

    assert_eq!(config.strategy, DiscoveryStrategy::ServerListSrv);
    assert_eq!(config.srv_servers, vec!["10.0.0.1:53".to_string(), "10.0.0.2".to_string()]);
    assert_eq!(config.poll_interval, Duration::from_millis(250));
    assert!(config.static_hosts.is_empty());
    assert_eq!(config.call_timeout, ClusterConfig::default().call_timeout);
}

/// Test that malformed values are configuration errors.
#[test]
fn test_config_rejects_malformed_values() {
    let bad_millis = ClusterConfig::from_named_values([(config::POLL_MILLIS, "soon")]);
    assert!(matches!(bad_millis, Err(ClusterError::Config(_))));

    for key in [
        config::POLL_MILLIS,
        config::REGISTRY_REFRESH_MILLIS,
        config::CONNECTION_REFRESH_MILLIS,
        config::CONNECT_TIMEOUT_MILLIS,
        config::CALL_TIMEOUT_MILLIS,
    ] {
        let zero = ClusterConfig::from_named_values([(key, "0")]);
        assert!(matches!(zero, Err(ClusterError::Config(_))), "{} accepted zero", key);
    }
    assert!(ClusterConfig::from_named_values([(config::POLL_MILLIS, "1")]).is_ok());

    let bad_strategy = ClusterConfig::from_named_values([(config::STRATEGY, "multicast")]);
    assert!(matches!(bad_strategy, Err(ClusterError::Config(_))));
}

/// Test that the instance id survives a restart and a corrupt file is replaced.
#[test]
fn test_instance_id_persistence() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state").join("instance-id");
    let store = FileInstanceIdStore::new(&path);

    let first = load_or_create(&store)?;
    assert!(path.exists());
    assert_eq!(load_or_create(&FileInstanceIdStore::new(&path))?, first);

    std::fs::write(&path, "not a uuid")?;
    let replaced = load_or_create(&store)?;
    assert_ne!(replaced, first);
    assert_eq!(store.read()?, replaced);
    Ok(())
}

// ============================================================================
// Publishers and route bookkeeping
// ============================================================================

/// Test that asynchronous events arrive in publish order and dropped
/// subscriptions stop receiving.
#[tokio::test]
async fn test_publisher_order_and_unsubscribe() {
    let dispatcher = Dispatcher::spawn("test");
    let publisher: Publisher<u32> = Publisher::new(dispatcher.clone());
    let seen = Arc::new(SyncMutex::new(Vec::new()));

    let subscription = publisher.subscribe({
        let seen = seen.clone();
        move |n: &u32| seen.lock().push(*n)
    });
    for n in 0..10 {
        publisher.publish_async(n);
    }
    dispatcher.flush().await;
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

    drop(subscription);
    assert!(publisher.is_empty());
    publisher.publish(&99);
    assert_eq!(seen.lock().len(), 10);
}

/// Test that removing an address removes every route under it in one step.
#[test]
fn test_route_registry_group_teardown() {
    let mut registry = RouteHandleRegistry::new();
    let route_a = Uuid::from_u128(1);
    let route_b = Uuid::from_u128(2);

    assert!(matches!(
        registry.register_route(SocketHandle(9), route_a, "tcp://nowhere:1"),
        Err(ClusterError::NotFound(_))
    ));

    registry.register_address(SocketHandle(1), "tcp://a:1").expect("address");
    registry.register_route(SocketHandle(2), route_a, "tcp://a:1").expect("route a");
    registry.register_route(SocketHandle(3), route_b, "tcp://a:1").expect("route b");
    registry.pair_instance("tcp://a:0", "tcp://a:1");
    assert!(registry.register_address(SocketHandle(4), "tcp://a:1").is_err());
    assert_eq!(registry.routes_under("tcp://a:1"), vec![route_a, route_b]);
    assert_eq!(registry.invoker_for_control("tcp://a:0"), Some("tcp://a:1"));

    let teardown = registry.unregister_address("tcp://a:1");
    assert_eq!(teardown.address, Some(SocketHandle(1)));
    assert_eq!(teardown.routes, vec![(route_a, SocketHandle(2)), (route_b, SocketHandle(3))]);
    assert_eq!(teardown.control.as_deref(), Some("tcp://a:0"));
    assert_eq!(registry.route_count(), 0);
    assert_eq!(registry.address_count(), 0);
    assert_eq!(registry.handle_for_route(&route_a), None);
    assert_eq!(registry.invoker_for_control("tcp://a:0"), None);
}

/// Test that allocated handles skip live ones and pairings can be dropped alone.
#[test]
fn test_route_registry_allocate_and_unpair() {
    let mut registry = RouteHandleRegistry::new();
    registry.register_address(SocketHandle(1), "tcp://a:1").expect("address");
    registry.register_address(SocketHandle(2), "tcp://b:1").expect("address");

    let handles: Vec<SocketHandle> = (0..3).map(|_| registry.allocate()).collect();
    assert_eq!(handles, vec![SocketHandle(3), SocketHandle(4), SocketHandle(5)]);

    registry.pair_instance("tcp://a:0", "tcp://a:1");
    assert_eq!(registry.unpair_instance("tcp://a:0").as_deref(), Some("tcp://a:1"));
    assert_eq!(registry.control_for_invoker("tcp://a:1"), None);
    assert_eq!(registry.unpair_instance("tcp://a:0"), None);
    assert_eq!(registry.handle_for_address("tcp://a:1"), Some(SocketHandle(1)));
}

// ============================================================================
// Discovery
// ============================================================================

fn hosts(addresses: &[&str]) -> BTreeSet<InstanceHostInfo> {
    addresses.iter().map(|a| InstanceHostInfo::new(*a)).collect()
}

/// Test that a poll reports exactly the added and removed hosts.
#[test]
fn test_reconcile_diff() {
    let previous = hosts(&["tcp://a:1", "tcp://b:1"]);

    let update = reconcile(&previous, Lookup::Found(hosts(&["tcp://b:1", "tcp://c:1"]))).expect("a change");
    assert_eq!(update.added, vec![InstanceHostInfo::new("tcp://c:1")]);
    assert_eq!(update.removed, vec![InstanceHostInfo::new("tcp://a:1")]);

    assert!(reconcile(&previous, Lookup::Found(previous.clone())).is_none());

    let gone = reconcile(&previous, Lookup::NotFound).expect("a change");
    assert!(gone.hosts.is_empty());
    assert_eq!(gone.removed.len(), 2);
}

/// Test that discovery publishes each change once and tracks the known set.
#[tokio::test]
async fn test_discovery_publishes_changes() -> anyhow::Result<()> {
    let naming = Arc::new(StaticNaming::new(["tcp://a:1", "tcp://b:1"]));
    let source: Arc<dyn NamingSource> = naming.clone();
    let discovery = InstanceDiscoveryService::new(source, Duration::from_secs(3600), Duration::from_secs(1));

    let found = Arc::new(SyncMutex::new(Vec::new()));
    let lost = Arc::new(SyncMutex::new(Vec::new()));
    let _found = discovery.subscribe_to_discovery({
        let found = found.clone();
        move |host| found.lock().push(host.connect_address().to_string())
    });
    let _lost = discovery.subscribe_to_undiscovery({
        let lost = lost.clone();
        move |host| lost.lock().push(host.connect_address().to_string())
    });

    discovery.start().await?;
    discovery.flush().await;
    assert_eq!(*found.lock(), vec!["tcp://a:1", "tcp://b:1"]);

    naming.replace(["tcp://b:1", "tcp://c:1"]);
    discovery.poll_now().await;
    discovery.poll_now().await;
    discovery.flush().await;
    assert_eq!(*found.lock(), vec!["tcp://a:1", "tcp://b:1", "tcp://c:1"]);
    assert_eq!(*lost.lock(), vec!["tcp://a:1"]);

    naming.replace(Vec::<String>::new());
    discovery.poll_now().await;
    discovery.flush().await;
    assert!(discovery.known_hosts().is_empty());
    assert_eq!(*lost.lock(), vec!["tcp://a:1", "tcp://b:1", "tcp://c:1"]);

    discovery.stop().await?;
    Ok(())
}

/// Test that double start and idle stop are illegal.
#[tokio::test]
async fn test_discovery_lifecycle_misuse() -> anyhow::Result<()> {
    let discovery = InstanceDiscoveryService::new(
        Arc::new(StaticNaming::new(["tcp://a:1"])),
        Duration::from_secs(3600),
        Duration::from_secs(1),
    );
    assert!(matches!(discovery.stop().await, Err(ClusterError::IllegalState(_))));

    discovery.start().await?;
    assert!(discovery.is_running().await);
    assert!(matches!(discovery.start().await, Err(ClusterError::IllegalState(_))));
    discovery.stop().await?;
    assert!(!discovery.is_running().await);
    Ok(())
}

/// Answers queries from a fixed script, then reports no hosts.
struct Scripted(SyncMutex<VecDeque<std::result::Result<Lookup, NamingError>>>);

#[async_trait::async_trait]
impl NamingSource for Scripted {
    async fn query(&self) -> std::result::Result<Lookup, NamingError> {
        self.0.lock().pop_front().unwrap_or(Ok(Lookup::NotFound))
    }
}

fn found_hosts(addresses: &[&str]) -> Lookup {
    Lookup::Found(addresses.iter().map(|a| InstanceHostInfo::new(*a)).collect())
}

/// Test that a failed query publishes nothing, keeps the known set, and the next
/// poll picks up where it left off.
#[tokio::test]
async fn test_discovery_query_error_is_retried() -> anyhow::Result<()> {
    let script = VecDeque::from([
        Ok(found_hosts(&["tcp://a:1"])),
        Err(NamingError::Query("server failure".into())),
        Ok(found_hosts(&["tcp://a:1", "tcp://b:1"])),
    ]);
    let discovery = InstanceDiscoveryService::new(
        Arc::new(Scripted(SyncMutex::new(script))),
        Duration::from_secs(3600),
        Duration::from_secs(1),
    );

    let events = Arc::new(SyncMutex::new(Vec::new()));
    let _found = discovery.subscribe_to_discovery({
        let events = events.clone();
        move |host| events.lock().push(format!("+{}", host))
    });
    let _lost = discovery.subscribe_to_undiscovery({
        let events = events.clone();
        move |host| events.lock().push(format!("-{}", host))
    });

    discovery.start().await?;
    discovery.flush().await;
    assert_eq!(*events.lock(), vec!["+tcp://a:1"]);

    discovery.poll_now().await;
    discovery.flush().await;
    assert_eq!(*events.lock(), vec!["+tcp://a:1"]);
    assert_eq!(discovery.known_hosts(), vec![InstanceHostInfo::new("tcp://a:1")]);

    discovery.poll_now().await;
    discovery.flush().await;
    assert_eq!(*events.lock(), vec!["+tcp://a:1", "+tcp://b:1"]);
    assert_eq!(discovery.known_hosts().len(), 2);

    discovery.stop().await?;
    Ok(())
}

/// Alternates between one host and none on every query.
struct Flapping(AtomicUsize);

#[async_trait::async_trait]
impl NamingSource for Flapping {
    async fn query(&self) -> std::result::Result<Lookup, NamingError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(if n % 2 == 0 { found_hosts(&["tcp://x:1"]) } else { Lookup::NotFound })
    }
}

/// Test that overlapping polls deliver events for one host in the order the known
/// set changed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_polls_keep_event_order() -> anyhow::Result<()> {
    let discovery = Arc::new(InstanceDiscoveryService::new(
        Arc::new(Flapping(AtomicUsize::new(0))),
        Duration::from_secs(3600),
        Duration::from_secs(1),
    ));

    let events = Arc::new(SyncMutex::new(Vec::new()));
    let _found = discovery.subscribe_to_discovery({
        let events = events.clone();
        move |_: &InstanceHostInfo| events.lock().push(true)
    });
    let _lost = discovery.subscribe_to_undiscovery({
        let events = events.clone();
        move |_: &InstanceHostInfo| events.lock().push(false)
    });

    let polls: Vec<JoinHandle<()>> = (0..64)
        .map(|_| {
            let discovery = discovery.clone();
            tokio::spawn(async move { discovery.poll_now().await })
        })
        .collect();
    for poll in polls {
        poll.await?;
    }
    discovery.flush().await;

    let events = events.lock().clone();
    assert!(!events.is_empty());
    for (i, up) in events.iter().enumerate() {
        assert_eq!(*up, i % 2 == 0, "event {} out of order in {:?}", i, events);
    }
    assert_eq!(events.last() == Some(&true), !discovery.known_hosts().is_empty());
    Ok(())
}

/// Test that SRV answers map to TCP connect addresses without the trailing dot.
#[test]
fn test_srv_target_mapping() {
    let host = InstanceHostInfo::from_srv("node1.cluster.internal.", 28883, 10, 5);
    assert_eq!(host.connect_address(), "tcp://node1.cluster.internal:28883");
    assert_eq!((host.priority(), host.weight()), (10, 5));

    let undotted = InstanceHostInfo::from_srv("node1.cluster.internal", 28883, 0, 0);
    assert_eq!(host, undotted);
    assert_eq!(host, InstanceHostInfo::new("tcp://node1.cluster.internal:28883"));
    assert_ne!(host, InstanceHostInfo::from_srv("node1.cluster.internal.", 28884, 10, 5));
}

// ============================================================================
// Routing snapshot
// ============================================================================

#[derive(Debug)]
struct Fake(u32);

fn supply(id: u32) -> impl FnOnce() -> BoxFuture<'static, Result<Arc<Fake>>> + Send + 'static {
    move || async move { Ok::<_, ClusterError>(Arc::new(Fake(id))) }.boxed()
}

#[derive(Default)]
struct Recorder {
    torn_down: SyncMutex<Vec<NodeId>>,
    reported: SyncMutex<Vec<NodeId>>,
    fail: bool,
    dead: Vec<u32>,
}

#[async_trait::async_trait]
impl Cleanup<Fake> for Recorder {
    async fn teardown(&self, node: NodeId, _invoker: Arc<Fake>) -> Result<()> {
        self.torn_down.lock().push(node);
        if self.fail {
            return Err(ClusterError::illegal_state("teardown refused"));
        }
        Ok(())
    }

    fn report(&self, node: NodeId, _error: ClusterError) {
        self.reported.lock().push(node);
    }

    fn is_live(&self, invoker: &Fake) -> bool {
        !self.dead.contains(&invoker.0)
    }
}

/// Test that re-adding a node keeps its invoker and only moves it.
#[tokio::test]
async fn test_snapshot_readd_keeps_invoker() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let application = app(1);
    let a = node(1, application);
    let b = node(2, application);

    let mut batch = snapshot.begin();
    batch.add(a, 5.0, supply(1)).add(b, 3.0, supply(2));
    let summary = batch.commit(&NoCleanup).await;
    assert_eq!((summary.generation, summary.added, summary.removed), (1, 2, 0));
    assert_eq!(snapshot.best_invoker_for_application(application).expect("best").0, 2);

    let original = snapshot.remote_invoker(&a).expect("a");
    let mut batch = snapshot.begin();
    batch.add(a, 1.0, supply(99));
    let summary = batch.commit(&NoCleanup).await;
    assert_eq!((summary.added, summary.removed), (0, 0));

    let best = snapshot.best_invoker_for_application(application).expect("best");
    assert!(Arc::ptr_eq(&best, &original));
    assert_eq!(snapshot.all_invokers_for_application(application).iter().map(|f| f.0).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(snapshot.table().entry(&a).map(|e| e.load), Some(1.0));
}

/// Test that re-adding a node whose invoker died builds a new one and tears the old
/// one down.
#[tokio::test]
async fn test_snapshot_replaces_dead_invoker() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let application = app(4);
    let a = node(1, application);
    let b = node(2, application);

    let mut batch = snapshot.begin();
    batch.add(a, 1.0, supply(1)).add(b, 2.0, supply(2));
    batch.commit(&NoCleanup).await;
    let healthy = snapshot.remote_invoker(&b).expect("b");

    let recorder = Recorder { dead: vec![1], ..Default::default() };
    let mut batch = snapshot.begin();
    batch.add(a, 1.0, supply(10)).add(b, 2.0, supply(20));
    let summary = batch.commit(&recorder).await;

    assert_eq!((summary.added, summary.removed), (1, 1));
    assert_eq!(snapshot.remote_invoker(&a).expect("a").0, 10);
    assert!(Arc::ptr_eq(&snapshot.remote_invoker(&b).expect("b"), &healthy));
    assert_eq!(*recorder.torn_down.lock(), vec![a]);
}

/// Test that equal loads are ordered by NodeId and unknown applications are not found.
#[tokio::test]
async fn test_snapshot_tiebreak_and_not_found() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let application = app(7);

    let mut batch = snapshot.begin();
    batch.add(node(3, application), 2.0, supply(3));
    batch.add(node(1, application), 2.0, supply(1));
    batch.add(node(2, application), 2.0, supply(2));
    let _ = batch.commit(&NoCleanup).await;

    assert_eq!(snapshot.best_invoker_for_application(application).expect("best").0, 1);
    assert!(matches!(snapshot.best_invoker_for_application(app(8)), Err(ClusterError::NotFound(_))));
    assert!(matches!(snapshot.remote_invoker(&node(4, application)), Err(ClusterError::NotFound(_))));
    assert!(snapshot.all_invokers_for_application(app(8)).is_empty());
}

/// Test that prune removes only untouched nodes and tears each down exactly once.
#[tokio::test]
async fn test_snapshot_prune_tears_down_once() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let recorder = Recorder::default();
    let application = app(1);
    let (a, b, c) = (node(1, application), node(2, application), node(3, application));

    let mut batch = snapshot.begin();
    batch.add(a, 1.0, supply(1)).add(b, 1.0, supply(2)).add(c, 1.0, supply(3));
    let _ = batch.commit(&recorder).await;

    let mut batch = snapshot.begin();
    batch.prune().add(a, 1.0, supply(10)).retain_instance(c.instance_id());
    let summary = batch.commit(&recorder).await;
    assert_eq!(summary.removed, 1);
    assert_eq!(*recorder.torn_down.lock(), vec![b]);
    assert_eq!(snapshot.len(), 2);

    let mut batch = snapshot.begin();
    batch.remove_node(b);
    let _ = batch.commit(&recorder).await;
    assert_eq!(*recorder.torn_down.lock(), vec![b]);

    let summary = snapshot.clear(&recorder).await;
    assert_eq!(summary.removed, 2);
    assert!(snapshot.is_empty());
    let mut torn_down = recorder.torn_down.lock().clone();
    torn_down.sort();
    assert_eq!(torn_down, vec![a, b, c]);
}

/// Test that the best invoker is the lowest load across random load sets.
#[tokio::test]
async fn test_snapshot_best_is_lowest_load() {
    use rand::Rng;

    let snapshot: Snapshot<Fake> = Snapshot::new();
    let application = app(2);
    let rounds: Vec<Vec<f64>> = {
        let mut rng = rand::thread_rng();
        (0..20).map(|_| (0..8).map(|_| f64::from(rng.gen_range(0u32..10))).collect()).collect()
    };

    for loads in rounds {
        let mut batch = snapshot.begin();
        for (i, load) in loads.iter().enumerate() {
            batch.add(node(i as u128 + 1, application), *load, supply(i as u32));
        }
        let _ = batch.commit(&NoCleanup).await;

        let (best, _) = loads
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| a.total_cmp(b).then(ia.cmp(ib)))
            .expect("eight loads");
        let expected = snapshot.remote_invoker(&node(best as u128 + 1, application)).expect("entry");
        let chosen = snapshot.best_invoker_for_application(application).expect("best");
        assert!(Arc::ptr_eq(&chosen, &expected));
    }
}

/// Test that a failing supplier skips its node without failing the commit.
#[tokio::test]
async fn test_snapshot_skips_failed_supplier() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let application = app(1);

    let mut batch = snapshot.begin();
    batch.add(node(1, application), 1.0, supply(1));
    batch.add(node(2, application), 1.0, || {
        async { Err::<Arc<Fake>, _>(ClusterError::not_found("route")) }.boxed()
    });
    let summary = batch.commit(&NoCleanup).await;

    assert_eq!((summary.added, summary.skipped), (1, 1));
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.remote_invoker(&node(2, application)).is_err());
}

/// Test that teardown failures reach the cleanup's report, not the committer.
#[tokio::test]
async fn test_snapshot_reports_teardown_failure() {
    let snapshot: Snapshot<Fake> = Snapshot::new();
    let recorder = Recorder { fail: true, ..Recorder::default() };
    let gone = node(1, app(1));

    let mut batch = snapshot.begin();
    batch.add(gone, 1.0, supply(1));
    let _ = batch.commit(&recorder).await;

    let mut batch = snapshot.begin();
    batch.remove_instance(gone.instance_id());
    let summary = batch.commit(&recorder).await;

    assert_eq!(summary.removed, 1);
    assert_eq!(*recorder.reported.lock(), vec![gone]);
    assert!(snapshot.is_empty());
}

/// Test that readers only ever see whole generations.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_readers_see_whole_generations() {
    let snapshot: Arc<Snapshot<Fake>> = Arc::new(Snapshot::new());
    let application = app(1);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<JoinHandle<usize>> = (0..4)
        .map(|_| {
            let snapshot = snapshot.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut reads = 0;
                while !done.load(Ordering::Acquire) {
                    let seen = snapshot.all_invokers_for_application(application).len();
                    assert!(seen == 0 || seen == 3, "torn read of {} entries", seen);
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            })
        })
        .collect();

    for round in 0..50u32 {
        let mut batch = snapshot.begin();
        for i in 0..3u32 {
            batch.add(node(u128::from(i + 1), application), f64::from(round), supply(round * 10 + i));
        }
        let _ = batch.commit(&NoCleanup).await;
        let _ = snapshot.clear(&NoCleanup).await;
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.await.expect("reader panicked") > 0);
    }
    assert_eq!(snapshot.generation(), 100);
}

// ============================================================================
// Remote invoker
// ============================================================================

/// Test that a synchronous call returns part 0.
#[tokio::test]
async fn test_invoke_sync() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, invocation| vec![result(seq, 0, invocation.method.as_bytes())]);

    let payload = invoker.invoke_sync(Invocation::new("Greeter", "hello")).await.expect("call");
    assert_eq!(payload, b"hello");
    assert_eq!(invoker.pending_calls(), 0);
}

/// Test that a remote error fails the synchronous caller.
#[tokio::test]
async fn test_invoke_sync_remote_error() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, _| vec![error(seq, 0, "boom")]);

    match invoker.invoke_sync(Invocation::new("Greeter", "hello")).await {
        Err(ClusterError::Remote { kind, message }) => {
            assert_eq!(kind, ErrorKind::Remote);
            assert_eq!(message, "boom");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

/// Test that every part reaches its handler once and duplicates are dropped.
#[tokio::test]
async fn test_invoke_callback_multipart() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, _| {
        vec![result(seq, 0, b"zero"), result(seq, 1, b"one"), result(seq, 1, b"again"), result(seq, 2, b"two")]
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (t0, t1, t2) = (tx.clone(), tx.clone(), tx);
    let callbacks = Callbacks::new()
        .on_result(move |p| {
            let _ = t0.send((0, p));
        })
        .on_part(1, move |p| {
            let _ = t1.send((1, p));
        })
        .on_part(2, move |p| {
            let _ = t2.send((2, p));
        });
    invoker.invoke_callback(Invocation::new("Feed", "stream"), callbacks).await.expect("sent");

    let mut parts = Vec::new();
    while let Some(part) = tokio::time::timeout(WAIT, rx.recv()).await.expect("parts") {
        parts.push(part);
    }
    assert_eq!(parts, vec![(0, b"zero".to_vec()), (1, b"one".to_vec()), (2, b"two".to_vec())]);
    assert_eq!(invoker.pending_calls(), 0);
}

/// Test that an error for a part without a handler goes to the error handler.
#[tokio::test]
async fn test_unhandled_part_error_reaches_error_handler() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, _| vec![error(seq, 5, "lost part"), result(seq, 0, b"ok")]);

    let errors = Arc::new(SyncMutex::new(Vec::new()));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let callbacks = Callbacks::new()
        .on_result(move |p| {
            let _ = done_tx.send(p);
        })
        .on_error({
            let errors = errors.clone();
            move |part, e| errors.lock().push((part, e.to_string()))
        });
    invoker.invoke_callback(Invocation::new("Feed", "stream"), callbacks).await.expect("sent");

    assert_eq!(tokio::time::timeout(WAIT, done_rx).await.expect("result").expect("sender"), b"ok");
    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 5);
    assert!(errors[0].1.contains("lost part"));
}

/// Test that losing the transport fails every pending call with the same error.
#[tokio::test]
async fn test_transport_death_fails_pending() {
    let (invoker, server) = invoker_pair();
    let invoker = Arc::new(invoker);
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            let _ = server.recv().await;
            let _ = seen_tx.send(());
        }
        drop(server);
    });

    let first = tokio::spawn({
        let invoker = invoker.clone();
        async move { invoker.invoke_sync(Invocation::new("Slow", "a")).await }
    });
    let second = tokio::spawn({
        let invoker = invoker.clone();
        async move { invoker.invoke_sync(Invocation::new("Slow", "b")).await }
    });
    seen_rx.recv().await;
    seen_rx.recv().await;
    server_task.await.expect("server");

    for call in [first, second] {
        let outcome = tokio::time::timeout(WAIT, call).await.expect("failed in time").expect("task");
        assert!(matches!(outcome, Err(ClusterError::Transport(TransportError::ConnectionLost(_)))));
    }
    assert_eq!(invoker.pending_calls(), 0);

    let late = invoker.invoke_sync(Invocation::new("Slow", "c")).await;
    assert!(matches!(late, Err(ClusterError::Transport(_))));
}

/// Test that an unanswered call times out and leaves nothing pending.
#[tokio::test]
async fn test_call_timeout() {
    let (client, server) = DuplexChannelTransport::pair();
    let invoker = RemoteInvoker::new("mem://silent", Box::new(client), Duration::from_millis(50));

    let outcome = invoker.invoke_sync(Invocation::new("Silent", "wait")).await;
    assert!(matches!(outcome, Err(ClusterError::Timeout(_))));
    assert_eq!(invoker.pending_calls(), 0);
    drop(server);
}

/// Test that a cancelled request delivers nothing afterwards.
#[tokio::test]
async fn test_future_cancel_delivers_nothing() {
    let (invoker, server) = invoker_pair();
    let delivered = Arc::new(AtomicBool::new(false));
    let callbacks = Callbacks::new().on_part(1, {
        let delivered = delivered.clone();
        move |_| delivered.store(true, Ordering::SeqCst)
    });

    let request = invoker.invoke_future(Invocation::new("Job", "run"), callbacks).await.expect("sent");
    let call = server.recv().await.expect("recv").expect("frame");
    let DataFrame::Call { seq, invocation } = DataFrame::decode(&call).expect("decode") else {
        panic!("expected a call frame");
    };
    assert_eq!(seq, request.seq());
    assert_eq!(invocation.dispatch, DispatchType::Future);

    request.cancel();
    assert!(request.is_cancelled());
    for frame in [result(seq, 1, b"late"), result(seq, 0, b"late")] {
        server.send(&frame.encode().expect("encode")).await.expect("send");
    }

    assert!(matches!(request.await, Err(ClusterError::IllegalState(_))));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!delivered.load(Ordering::SeqCst));
    assert_eq!(invoker.pending_calls(), 0);
}

/// Test that every clone of a staged future sees the same result.
#[tokio::test]
async fn test_staged_clones_share_result() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, invocation| {
        assert_eq!(invocation.dispatch, DispatchType::Staged);
        vec![result(seq, 0, b"shared")]
    });

    let staged = invoker.invoke_staged(Invocation::new("Job", "stage")).await.expect("sent");
    let other = staged.clone();
    let mapped = other.map(|r| r.map(|p| p.len()));

    assert_eq!(staged.await.expect("result"), b"shared");
    assert_eq!(mapped.await.expect("result"), 6);
}

/// Test that stopping fails pending calls and a second stop is illegal.
#[tokio::test]
async fn test_stop_twice_is_illegal() {
    let (invoker, _server) = invoker_pair();
    let invoker = Arc::new(invoker);
    let waiting = tokio::spawn({
        let invoker = invoker.clone();
        async move { invoker.invoke_sync(Invocation::new("Slow", "a")).await }
    });
    tokio::time::timeout(WAIT, async {
        while invoker.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("call registered");

    invoker.stop().await.expect("first stop");
    assert!(invoker.is_stopped());
    assert!(waiting.await.expect("task").is_err());
    assert!(matches!(invoker.stop().await, Err(ClusterError::IllegalState(_))));
    assert!(matches!(
        invoker.invoke_sync(Invocation::new("Slow", "b")).await,
        Err(ClusterError::IllegalState(_))
    ));
}

/// Test that hybrid dispatch resolves by return shape.
#[test]
fn test_resolve_hybrid() {
    assert_eq!(resolve_hybrid("m", DispatchType::Hybrid, ReturnShape::Void), DispatchType::Callback);
    assert_eq!(resolve_hybrid("m", DispatchType::Hybrid, ReturnShape::Pending), DispatchType::Future);
    assert_eq!(resolve_hybrid("m", DispatchType::Hybrid, ReturnShape::Value), DispatchType::Synchronous);
    assert_eq!(resolve_hybrid("m", DispatchType::Staged, ReturnShape::Value), DispatchType::Staged);
}

/// Test that an invoker connects through a connector and fails for unknown addresses.
#[tokio::test]
async fn test_invoker_start_through_connector() {
    let connector = MockConnector::new();
    let server = connector.expect("mem://known");
    let _server = serve(server, |seq, _| vec![result(seq, 0, b"up")]);

    let invoker = RemoteInvoker::start(&connector, "mem://known", WAIT).await.expect("connect");
    assert_eq!(invoker.invoke_sync(Invocation::new("Ping", "ping")).await.expect("call"), b"up");
    assert!(RemoteInvoker::start(&connector, "mem://unknown", WAIT).await.is_err());
    assert_eq!(connector.connects(), vec!["mem://known".to_string(), "mem://unknown".to_string()]);
}

// ============================================================================
// Redirection
// ============================================================================

struct Counting {
    runs: AtomicUsize,
}

impl Executor for Counting {
    fn execute(&self, job: Job) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        job();
    }
}

#[derive(Default)]
struct Deferred {
    jobs: SyncMutex<Vec<Job>>,
}

impl Executor for Deferred {
    fn execute(&self, job: Job) {
        self.jobs.lock().push(job);
    }
}

/// Test that redirected callbacks run on the executor.
#[tokio::test]
async fn test_redirected_callback_runs_on_executor() {
    let (invoker, server) = invoker_pair();
    let _server = serve(server, |seq, _| vec![result(seq, 0, b"done")]);
    let executor = Arc::new(Counting { runs: AtomicUsize::new(0) });
    let redirecting = RedirectingInvoker::new(Arc::new(invoker), executor.clone());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let callbacks = Callbacks::new().on_result(move |p| {
        let _ = tx.send(p);
    });
    redirecting.invoke_callback(Invocation::new("Job", "run"), callbacks).await.expect("sent");

    assert_eq!(tokio::time::timeout(WAIT, rx).await.expect("result").expect("sender"), b"done");
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
}

/// Test that a callback queued before cancellation is skipped when it runs.
#[tokio::test]
async fn test_redirected_callback_skipped_after_cancel() {
    let (invoker, server) = invoker_pair();
    let executor = Arc::new(Deferred::default());
    let redirecting = RedirectingInvoker::new(Arc::new(invoker), executor.clone());

    let delivered = Arc::new(AtomicBool::new(false));
    let callbacks = Callbacks::new().on_part(1, {
        let delivered = delivered.clone();
        move |_| delivered.store(true, Ordering::SeqCst)
    });
    let request = redirecting.invoke_future(Invocation::new("Job", "run"), callbacks).await.expect("sent");

    let call = server.recv().await.expect("recv").expect("frame");
    let seq = DataFrame::decode(&call).expect("decode").seq();
    server.send(&result(seq, 1, b"part").encode().expect("encode")).await.expect("send");
    tokio::time::timeout(WAIT, async {
        while executor.jobs.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job queued");

    request.cancel();
    let jobs = std::mem::take(&mut *executor.jobs.lock());
    for job in jobs {
        job();
    }
    assert!(!delivered.load(Ordering::SeqCst));
}

// ============================================================================
// Proxies
// ============================================================================

async fn single_node_source<F>(application: ApplicationId, reply: F) -> (Arc<Snapshot<RemoteInvoker>>, NodeId, Arc<RemoteInvoker>)
where
    F: Fn(u64, Invocation) -> Vec<DataFrame> + Send + 'static,
{
    let (invoker, server) = invoker_pair();
    let invoker = Arc::new(invoker);
    let _ = serve(server, reply);

    let snapshot = Arc::new(Snapshot::new());
    let target = node(1, application);
    let mut batch = snapshot.begin();
    let supplied = invoker.clone();
    batch.add(target, 1.0, move || async move { Ok::<_, ClusterError>(supplied) }.boxed());
    let _ = batch.commit(&NoCleanup).await;
    (snapshot, target, invoker)
}

/// Test that invalid descriptors are rejected when the proxy is built.
#[tokio::test]
async fn test_proxy_validation() {
    let source: Arc<dyn InvokerSource> = Arc::new(Snapshot::<RemoteInvoker>::new());
    let application = app(1);
    let build = |method: MethodDescriptor| {
        ProxyBuilder::new().build(ServiceDescriptor::new("Svc").method(method), source.clone())
    };

    let cases = [
        MethodDescriptor::remote("m", ReturnShape::Value, DispatchType::Callback, Routing::Application(application)),
        MethodDescriptor::remote("m", ReturnShape::Value, DispatchType::Synchronous, Routing::Application(application))
            .param("Handler", ParamRole::ResultHandler),
        MethodDescriptor::remote("m", ReturnShape::Void, DispatchType::Callback, Routing::Application(application))
            .param("E1", ParamRole::ErrorHandler)
            .param("E2", ParamRole::ErrorHandler),
        MethodDescriptor::remote("m", ReturnShape::Value, DispatchType::Synchronous, Routing::Node),
    ];
    for method in cases {
        assert!(matches!(build(method), Err(ClusterError::Config(_))));
    }

    let duplicate = ServiceDescriptor::new("Svc")
        .method(MethodDescriptor::local("m", |_| Ok(CallOutcome::Sent)))
        .method(MethodDescriptor::local("m", |_| Ok(CallOutcome::Sent)));
    assert!(matches!(ProxyBuilder::new().build(duplicate, source.clone()), Err(ClusterError::Config(_))));

    let hybrid = MethodDescriptor::remote("m", ReturnShape::Pending, DispatchType::Hybrid, Routing::Application(application))
        .param("Handler", ParamRole::ResultHandler);
    assert!(build(hybrid).is_ok());
}

/// Test that local methods answer without any invoker.
#[tokio::test]
async fn test_proxy_local_method() -> anyhow::Result<()> {
    let source: Arc<dyn InvokerSource> = Arc::new(Snapshot::<RemoteInvoker>::new());
    let service = ServiceDescriptor::new("Svc").method(
        MethodDescriptor::local("describe", |_| Ok(CallOutcome::Value(b"local".to_vec()))),
    );
    let proxy = ProxyBuilder::new().build(service, source)?;

    assert_eq!(proxy.call("describe", Vec::new()).await?.into_value()?, b"local");
    assert!(matches!(proxy.call("missing", Vec::new()).await, Err(ClusterError::NotFound(_))));
    Ok(())
}

/// Test that application routing reaches the best invoker and node routing
/// needs a known node.
#[tokio::test]
async fn test_proxy_routes_calls() -> anyhow::Result<()> {
    let application = app(1);
    let (snapshot, target, _invoker) = single_node_source(application, |seq, invocation| {
        let mut payload = invocation.method.into_bytes();
        payload.extend(invocation.arguments.concat());
        vec![result(seq, 0, &payload)]
    })
    .await;
    let service = ServiceDescriptor::new("Greeter")
        .method(
            MethodDescriptor::remote("hello", ReturnShape::Value, DispatchType::Synchronous, Routing::Application(application))
                .param("Name", ParamRole::Argument),
        )
        .method(
            MethodDescriptor::remote("at", ReturnShape::Value, DispatchType::Synchronous, Routing::Node)
                .param("Node", ParamRole::Address),
        );
    let proxy = ProxyBuilder::new().build(service, snapshot.clone())?;

    assert_eq!(proxy.call("hello", vec![Arg::value("bob")]).await?.into_value()?, b"hellobob");

    let mut expected = b"at".to_vec();
    expected.extend(target.to_bytes());
    assert_eq!(proxy.call("at", vec![Arg::Address(target)]).await?.into_value()?, expected);

    let elsewhere = proxy.call("at", vec![Arg::Address(node(9, application))]).await;
    assert!(matches!(elsewhere, Err(ClusterError::NotFound(_))));
    assert!(matches!(proxy.call("hello", Vec::new()).await, Err(ClusterError::IllegalState(_))));
    Ok(())
}

/// Test that result-handler parameters take parts in order and only the first
/// error reaches the error handler.
#[tokio::test]
async fn test_proxy_handlers() -> anyhow::Result<()> {
    let application = app(1);
    let (snapshot, _target, invoker) = single_node_source(application, |seq, invocation| match invocation.method.as_str() {
        "stream" => vec![result(seq, 0, b""), result(seq, 1, b"first"), result(seq, 2, b"second")],
        _ => vec![error(seq, 1, "bad part"), error(seq, 0, "bad call")],
    })
    .await;
    let service = ServiceDescriptor::new("Feed")
        .method(
            MethodDescriptor::remote("stream", ReturnShape::Void, DispatchType::Callback, Routing::Application(application))
                .param("First", ParamRole::ResultHandler)
                .param("Second", ParamRole::ResultHandler),
        )
        .method(
            MethodDescriptor::remote("fail", ReturnShape::Void, DispatchType::Callback, Routing::Application(application))
                .param("Errors", ParamRole::ErrorHandler),
        );
    let proxy = ProxyBuilder::new().build(service, snapshot)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (first, second) = (tx.clone(), tx);
    let outcome = proxy
        .call("stream", vec![
            Arg::on_result(move |p| {
                let _ = first.send(p);
            }),
            Arg::on_result(move |p| {
                let _ = second.send(p);
            }),
        ])
        .await?;
    assert!(matches!(outcome, CallOutcome::Sent));
    let mut parts = Vec::new();
    while let Some(part) = tokio::time::timeout(WAIT, rx.recv()).await? {
        parts.push(part);
    }
    assert_eq!(parts, vec![b"first".to_vec(), b"second".to_vec()]);

    let errors = Arc::new(AtomicUsize::new(0));
    proxy
        .call("fail", vec![Arg::on_error({
            let errors = errors.clone();
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        })])
        .await?;
    settle(&invoker).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    Ok(())
}

// ============================================================================
// Control service
// ============================================================================

struct Echo;

#[async_trait::async_trait]
impl InvocationDispatcher for Echo {
    async fn dispatch(&self, node: NodeId, invocation: Invocation, replies: ReplySink) {
        replies.result(0, format!("{}:{}", node, invocation.method).into_bytes());
    }
}

fn control_service() -> Arc<ControlService> {
    let local = Arc::new(LocalInstance::new(InstanceId::random(), ""));
    ControlService::start(local, Arc::new(Echo), Duration::from_secs(2))
}

/// Test that binding and unbinding nodes shows up in the status response.
#[tokio::test]
async fn test_control_bind_node_status() -> anyhow::Result<()> {
    let control = control_service();
    let application = app(3);

    let node = control.bind_node(application).await?;
    control.local().set_load(2.5);
    let status = control.status().await?;
    assert_eq!(status.instance_id, control.local().instance_id());
    assert_eq!(status.nodes, vec![node]);
    assert_eq!(status.load, 2.5);

    control.unbind_node(application).await?;
    assert!(control.status().await?.nodes.is_empty());
    assert!(matches!(control.unbind_node(application).await, Err(ClusterError::NotFound(_))));

    control.stop(WAIT).await?;
    assert!(matches!(control.stop(WAIT).await, Err(ClusterError::IllegalState(_))));
    Ok(())
}

/// Test that malformed commands and routes over unknown links are rejected.
#[tokio::test]
async fn test_control_rejects_bad_commands() -> anyhow::Result<()> {
    let control = control_service();

    let malformed = control.issue_command(CommandType::RoutingCommand, &[1, 2, 3]).await;
    assert!(matches!(malformed, Err(ClusterError::Protocol(_))));

    let node = NodeId::new(InstanceId::random(), app(1));
    let unknown = control.connect_node("tcp://127.0.0.1:9", &node).await;
    assert!(matches!(unknown, Err(ClusterError::NotFound(_))));
    assert!(matches!(control.disconnect_address("tcp://127.0.0.1:9").await, Err(ClusterError::NotFound(_))));

    assert_eq!(control.stats().await?, Default::default());
    control.stop(WAIT).await?;
    Ok(())
}

/// Test that calls travel over loopback TCP between two control loops.
#[tokio::test]
async fn test_control_loopback_call() -> anyhow::Result<()> {
    let host = control_service();
    let caller = control_service();
    let application = app(5);

    let address = host.bind_address("tcp://127.0.0.1:0").await?;
    assert!(address.starts_with("tcp://127.0.0.1:"));
    assert!(!address.ends_with(":0"));
    let target = host.bind_node(application).await?;

    caller.connect_address(&address).await?;
    let route = caller.connect_node(&address, &target).await?;
    let invoker = RemoteInvoker::start(caller.as_ref(), &route, WAIT).await?;
    let payload = invoker.invoke_sync(Invocation::new("Greeter", "hello")).await?;
    assert_eq!(payload, format!("{}:hello", target).into_bytes());

    let unbound = NodeId::new(host.local().instance_id(), app(6));
    let stray_route = caller.connect_node(&address, &unbound).await?;
    let stray = RemoteInvoker::start(caller.as_ref(), &stray_route, WAIT).await?;
    match stray.invoke_sync(Invocation::new("Greeter", "hello")).await {
        Err(ClusterError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::NoSuchRoute),
        other => panic!("expected no such route, got {:?}", other),
    }

    let stats = caller.stats().await?;
    assert_eq!((stats.addresses, stats.routes, stats.attached), (1, 2, 2));

    caller.disconnect_address(&address).await?;
    let after = invoker.invoke_sync(Invocation::new("Greeter", "hello")).await;
    assert!(after.is_err());
    assert_eq!(caller.stats().await?.routes, 0);

    caller.stop(WAIT).await?;
    host.stop(WAIT).await?;
    Ok(())
}

/// Test that a control client notices its connection closing.
#[tokio::test]
async fn test_control_client_sees_close() {
    let (client, server) = DuplexChannelTransport::pair();
    let control = ControlClient::new("mem://control", Box::new(client), WAIT);
    assert!(!control.is_closed());

    drop(server);
    tokio::time::timeout(WAIT, control.closed()).await.expect("closed");
    assert!(control.is_closed());
    assert!(control.status().await.is_err());
}
