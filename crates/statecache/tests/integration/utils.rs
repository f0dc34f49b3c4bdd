use std::sync::Arc;

use statecache::observer::MetricsCollector;
use statecache::{CacheBuilder, CallSite, Cached, DaprClient, DaprStateStore, SingleFlight};
use statecache_test as test;

pub use test::{DaprServer, FailingStore, RecordingStore, StateRequest, StatusCode, StoreOp};

/// Starts a fake sidecar and returns it together with a client for its `store`.
///
/// The client gives up after 250ms instead of the default 5s.
pub fn sidecar(store: &str) -> (DaprServer, DaprStateStore) {
    test::setup();

    let sidecar = DaprServer::new();
    let mut config = sidecar.config();
    config.timeout = std::time::Duration::from_millis(250);
    let store = DaprClient::new(&config).unwrap().store(store).unwrap();

    (sidecar, store)
}

/// A builder isolated from other tests, reporting to `collector`.
pub fn builder(call_site: CallSite, collector: &Arc<MetricsCollector>) -> CacheBuilder {
    Cached::builder(call_site)
        .observer(Arc::clone(collector))
        .single_flight(SingleFlight::new())
}
