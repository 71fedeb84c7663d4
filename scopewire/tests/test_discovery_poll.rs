use scopewire::discovery::EndpointManagerPoll;
use scopewire::endpoint::{Endpoint, EndpointIntrospect, EndpointProcessInfo};
use scopewire::transport::{Transport, TransportFactory, TransportLoopbackFactory, TransportUnixFactory};
use scopewire_common::{ENDPOINT_INTROSPECT, ENDPOINT_PROCESS_INFO};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < Duration::from_secs(3), "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_factory_only_runs_for_supported_endpoints() {
    let factory = TransportLoopbackFactory::new();
    let plain = factory.serve().unwrap();
    let informed = factory.serve().unwrap();
    informed.add_endpoint(EndpointProcessInfo::named("informed"));

    let built = Arc::new(AtomicUsize::new(0));
    let poller = EndpointManagerPoll::new(factory.clone());
    let counter = Arc::clone(&built);
    poller.add_endpoint_factory(
        ENDPOINT_PROCESS_INFO,
        Arc::new(move |_transport: &Arc<dyn Transport>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(EndpointProcessInfo::new() as Arc<dyn Endpoint>)
        }),
    );
    poller.manage().unwrap();

    assert_eq!(built.load(Ordering::SeqCst), 1);
    let peers = poller.endpoints();
    assert!(peers[&plain.address()].endpoint::<EndpointProcessInfo>(ENDPOINT_PROCESS_INFO).is_none());
    let info = peers[&informed.address()]
        .endpoint::<EndpointProcessInfo>(ENDPOINT_PROCESS_INFO)
        .unwrap()
        .process_info()
        .unwrap();
    assert_eq!(info.name, "informed");
    assert_eq!(info.pid.0, std::process::id());
}

#[test]
fn test_factory_returning_none_is_not_an_error() {
    let factory = TransportLoopbackFactory::new();
    let server = factory.serve().unwrap();
    server.add_endpoint(EndpointProcessInfo::new());

    let poller = EndpointManagerPoll::new(factory.clone());
    poller.add_endpoint_factory(ENDPOINT_PROCESS_INFO, Arc::new(|_transport: &Arc<dyn Transport>| None));
    poller.manage().unwrap();

    let peers = poller.endpoints();
    let peer = &peers[&server.address()];
    assert!(peer.endpoints.contains_key(ENDPOINT_INTROSPECT));
    assert!(!peer.endpoints.contains_key(ENDPOINT_PROCESS_INFO));
}

#[test]
fn test_manage_twice_keeps_connections() {
    let factory = TransportLoopbackFactory::new();
    let server = factory.serve().unwrap();
    let poller = EndpointManagerPoll::new(factory.clone());
    poller.manage().unwrap();
    let first = poller.endpoints()[&server.address()].transport.clone();
    poller.manage().unwrap();
    let second = poller.endpoints()[&server.address()].transport.clone();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_background_polling_tracks_unix_peers() {
    let factory = TransportUnixFactory::with_suffix("_swtest_poll");
    let poller = EndpointManagerPoll::new(Arc::new(factory.clone()));
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&log);
    poller.set_logger(Arc::new(move |msg| sink.lock().unwrap().push(msg.to_string())));
    poller.start_polling(Duration::from_millis(20)).unwrap();
    assert!(poller.is_polling());

    let server = factory.serve().unwrap();
    let address = server.address();
    wait_until("peer to be attached", || poller.endpoints().contains_key(&address));

    let introspect = poller.endpoints()[&address].endpoint::<EndpointIntrospect>(ENDPOINT_INTROSPECT).unwrap();
    assert_eq!(introspect.supported().unwrap(), vec![ENDPOINT_INTROSPECT.to_string()]);

    server.close();
    drop(server);
    wait_until("peer to be removed", || !poller.endpoints().contains_key(&address));

    poller.stop_polling();
    assert!(!poller.is_polling());
    let log = log.lock().unwrap();
    assert!(log.iter().any(|m| m.starts_with("Connected to")));
    assert!(log.iter().any(|m| m.starts_with("Removing peer")));
}

#[test]
fn test_drop_while_polling_does_not_hang() {
    let factory = TransportLoopbackFactory::new();
    let _server = factory.serve().unwrap();
    let poller = EndpointManagerPoll::new(factory);
    poller.start_polling(Duration::from_millis(5)).unwrap();
    thread::sleep(Duration::from_millis(30));
    drop(poller);
}
