use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use statecache::executor::Executor;
use statecache::observer::MetricsCollector;
use statecache::{Args, BlockingCached, SingleFlight, call_site};

use crate::{RecordingStore, StoreOp, sidecar};

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_read_through_dapr() {
    let (sidecar, store) = sidecar("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = BlockingCached::builder(call_site!("double"))
        .ttl_seconds(60)
        .observer(Arc::clone(&collector))
        .single_flight(SingleFlight::new())
        .executor(Executor::new(1))
        .build_blocking(store)
        .unwrap();

    // blocking callers must stay off the async workers
    let calls = tokio::task::spawn_blocking(move || {
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = cached.call(Args::new().arg(&21), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42u64)
            });
            assert_eq!(result, Ok(42));
        }
        assert!(cached.invalidate(&Args::new().arg(&21)));
        calls.into_inner()
    })
    .await
    .unwrap();

    assert_eq!(calls, 1);
    let stats = collector.overall();
    assert_eq!((stats.hits, stats.misses, stats.writes), (2, 1, 1));

    let methods: Vec<_> = sidecar.requests().iter().map(|r| r.method).collect();
    assert_eq!(methods, ["GET", "POST", "GET", "GET", "DELETE"]);
}

#[test]
fn test_blocking_and_async_callers_share_entries() {
    statecache_test::setup();
    let store = RecordingStore::new("s");
    let flights = SingleFlight::new();

    let blocking = BlockingCached::builder(call_site!("shared"))
        .single_flight(flights.clone())
        .build_blocking(store.clone())
        .unwrap();
    let result = blocking.call(Args::new().arg("x"), || Ok::<_, String>("blocking".to_owned()));
    assert_eq!(result.as_deref(), Ok("blocking"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let suspending = statecache::Cached::builder(call_site!("shared"))
        .single_flight(flights)
        .build(store.clone())
        .unwrap();
    let result: Result<String, String> = runtime.block_on(
        suspending.call(Args::new().arg("x"), || async { Ok("async".to_owned()) }),
    );
    assert_eq!(result.as_deref(), Ok("blocking"));

    let puts = store
        .ops()
        .into_iter()
        .filter(|op| matches!(op, StoreOp::Put { .. }))
        .count();
    assert_eq!(puts, 1);
}
