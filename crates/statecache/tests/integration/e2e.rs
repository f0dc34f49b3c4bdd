use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use statecache::observer::{CompositeObserver, LoggingObserver, MetricsCollector};
use statecache::{Args, Cached, ConfigError, SingleFlight, Ttl, call_site};

use crate::{FailingStore, RecordingStore, StateRequest, StatusCode, StoreOp, builder, sidecar};

async fn double(cached: &Cached, calls: &Arc<AtomicUsize>, n: u64) -> Result<u64, String> {
    let calls = Arc::clone(calls);
    cached
        .call(Args::new().arg(&n), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(n * 2)
        })
        .await
}

fn request(method: &'static str, key: &str, ttl: Option<u64>) -> StateRequest {
    StateRequest {
        method,
        store: "s".to_owned(),
        key: key.to_owned(),
        ttl,
    }
}

#[tokio::test]
async fn test_read_through_dapr() {
    let (sidecar, store) = sidecar("s");
    let collector = Arc::new(MetricsCollector::default());
    let observer = CompositeObserver::new()
        .with(LoggingObserver)
        .with(Arc::clone(&collector));
    let cached = Cached::builder(call_site!("double"))
        .ttl_seconds(300)
        .observer(observer)
        .single_flight(SingleFlight::new())
        .build(store)
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(double(&cached, &calls, 21).await, Ok(42));

    let key = cached.key(&Args::new().arg(&21)).unwrap();
    let digest = key
        .strip_prefix("s:integration::e2e::double:")
        .expect("key is namespaced by store and call site");
    assert_eq!(digest.len(), 16);
    assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));

    assert_eq!(
        sidecar.requests(),
        [request("GET", &key, None), request("POST", &key, Some(300))]
    );
    assert!(sidecar.value("s", &key).is_some());

    // served from the sidecar without computing
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sidecar.requests(), [request("GET", &key, None)]);

    let stats = collector.overall();
    assert_eq!((stats.hits, stats.misses, stats.writes, stats.errors), (1, 1, 1, 0));

    assert!(cached.invalidate(&Args::new().arg(&21)).await);
    assert_eq!(sidecar.requests(), [request("DELETE", &key, None)]);
    assert!(sidecar.keys("s").is_empty());
}

#[tokio::test]
async fn test_failing_sidecar_degrades_to_computing() {
    let (sidecar, store) = sidecar("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("double"), &collector)
        .build(store)
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    sidecar.fail_with(Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(collector.overall().errors, 4);
    assert!(!cached.invalidate(&Args::new().arg(&21)).await);

    // recovered sidecars are used again right away
    sidecar.fail_with(None);
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stalled_sidecar_times_out() {
    let (sidecar, store) = sidecar("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("double"), &collector)
        .build(store)
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    sidecar.set_delay(Some(Duration::from_secs(2)));
    assert_eq!(double(&cached, &calls, 21).await, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(collector.overall().errors, 2);
}

#[tokio::test]
async fn test_unreachable_store() {
    statecache_test::setup();
    let store = FailingStore::timing_out();
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("double"), &collector)
        .build(store.clone())
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(double(&cached, &calls, 1).await, Ok(2));
    assert_eq!(store.attempts(), 2);
    assert_eq!(collector.top_keys(statecache::observer::StatKind::Errors, 1).len(), 1);
}

#[tokio::test]
async fn test_errors_are_returned_and_not_cached() {
    statecache_test::setup();
    let store = RecordingStore::new("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("lookup"), &collector)
        .build(store.clone())
        .unwrap();

    #[derive(Debug, Clone, PartialEq)]
    struct NotFound(u32);

    for _ in 0..2 {
        let result: Result<String, NotFound> = cached
            .call(Args::new().arg(&7), || async { Err(NotFound(7)) })
            .await;
        assert_eq!(result, Err(NotFound(7)));
    }

    let ops = store.ops();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| matches!(op, StoreOp::Get(_))));
}

#[tokio::test]
async fn test_retry_after_failure_is_persisted() {
    statecache_test::setup();
    let store = RecordingStore::new("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("flaky"), &collector)
        .ttl_seconds(30)
        .build(store.clone())
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = || {
        let calls = Arc::clone(&calls);
        move || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err("first attempt fails".to_owned()),
                n => Ok(n),
            }
        }
    };

    let first: Result<usize, String> = cached.call(Args::new().arg("x"), flaky()).await;
    assert_eq!(first, Err("first attempt fails".to_owned()));
    let second: Result<usize, String> = cached.call(Args::new().arg("x"), flaky()).await;
    assert_eq!(second, Ok(1));
    let third: Result<usize, String> = cached.call(Args::new().arg("x"), flaky()).await;
    assert_eq!(third, Ok(1));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let key = cached.key(&Args::new().arg("x")).unwrap();
    assert_eq!(store.memory().keys(), [key]);
    assert_eq!(collector.overall().writes, 1);
}

#[tokio::test]
async fn test_default_ttl() {
    statecache_test::setup();
    let store = RecordingStore::new("s");
    let cached = Cached::builder(call_site!("answer"))
        .single_flight(SingleFlight::new())
        .build(store.clone())
        .unwrap();
    assert_eq!(cached.ttl(), Ttl::DEFAULT);

    let value: Result<u32, String> = cached.call(Args::new(), || async { Ok(42) }).await;
    assert_eq!(value, Ok(42));

    let key = cached.key(&Args::new()).unwrap();
    assert_eq!(
        store.ops(),
        [
            StoreOp::Get(key.clone()),
            StoreOp::Put {
                key,
                ttl: 3600,
                size: 1,
            },
        ]
    );

    let err = Cached::builder(call_site!("answer"))
        .ttl_seconds(0)
        .build(store)
        .unwrap_err();
    assert_eq!(err, ConfigError::InvalidTtl(0));
}

#[tokio::test]
async fn test_methods_share_entries_across_receivers() {
    statecache_test::setup();
    let store = RecordingStore::new("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("Repo::load"), &collector)
        .build(store.clone())
        .unwrap();

    struct Repo {
        id: u32,
    }

    let calls = Arc::new(AtomicUsize::new(0));
    for repo in [Repo { id: 1 }, Repo { id: 2 }] {
        let calls = Arc::clone(&calls);
        let id = repo.id;
        let args = Args::new().receiver(&repo).arg("user-1");
        let result: Result<String, String> = cached
            .call(args, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("loaded by {id}"))
            })
            .await;
        assert_eq!(result.as_deref(), Ok("loaded by 1"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_compute_once() {
    let (sidecar, store) = sidecar("s");
    let collector = Arc::new(MetricsCollector::default());
    let cached = builder(call_site!("slow"), &collector)
        .build(store)
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let cached = cached.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cached
                    .call(Args::new().arg("report"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(vec![1u32, 2, 3])
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(vec![1, 2, 3]));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let posts = sidecar
        .requests()
        .into_iter()
        .filter(|request| request.method == "POST")
        .count();
    assert_eq!(posts, 1);
}
