use std::time::Duration;

use serde_json::json;
use statecache::config::DaprConfig;
use statecache::{DaprClient, StateStore, StoreError, Ttl};

use crate::{StateRequest, StatusCode, sidecar};

fn ttl(secs: u64) -> Ttl {
    Ttl::from_secs(secs).unwrap()
}

#[tokio::test]
async fn test_put_get_delete() {
    let (sidecar, store) = sidecar("users");

    assert_eq!(store.get("missing").await.unwrap(), None);

    store.put("user:1", b"\x00binary\xff".to_vec(), ttl(60)).await.unwrap();
    assert_eq!(
        store.get("user:1").await.unwrap().as_deref(),
        Some(&b"\x00binary\xff"[..])
    );
    assert_eq!(sidecar.value("users", "user:1").as_deref(), Some(&b"\x00binary\xff"[..]));

    store.delete("user:1").await.unwrap();
    assert_eq!(store.get("user:1").await.unwrap(), None);
    // deleting twice is fine
    store.delete("user:1").await.unwrap();

    let requests = sidecar.requests();
    let methods: Vec<_> = requests.iter().map(|r| r.method).collect();
    assert_eq!(methods, ["GET", "POST", "GET", "DELETE", "GET", "DELETE"]);
    assert_eq!(
        requests[1],
        StateRequest {
            method: "POST",
            store: "users".to_owned(),
            key: "user:1".to_owned(),
            ttl: Some(60),
        }
    );
}

#[tokio::test]
async fn test_keys_are_single_segments() {
    let (sidecar, store) = sidecar("users");

    store.put("a/b c", b"v".to_vec(), ttl(60)).await.unwrap();
    assert_eq!(sidecar.keys("users"), ["a/b c"]);
    assert_eq!(store.get("a/b c").await.unwrap().as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn test_entries_expire() {
    let (sidecar, store) = sidecar("s");

    store.put("short", b"v".to_vec(), ttl(1)).await.unwrap();
    assert!(store.get("short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.get("short").await.unwrap(), None);
    assert!(sidecar.keys("s").is_empty());
}

#[tokio::test]
async fn test_error_responses() {
    let (sidecar, store) = sidecar("s");

    sidecar.fail_with(Some(StatusCode::INTERNAL_SERVER_ERROR));
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, StoreError::BadResponse(_)), "{err:?}");
    let err = store.put("k", vec![1], ttl(5)).await.unwrap_err();
    assert!(matches!(err, StoreError::BadResponse(_)), "{err:?}");
    let err = store.delete("k").await.unwrap_err();
    assert!(matches!(err, StoreError::BadResponse(_)), "{err:?}");
}

#[tokio::test]
async fn test_malformed_values() {
    let (sidecar, store) = sidecar("s");

    sidecar.insert("s", "number", json!(17));
    let err = store.get("number").await.unwrap_err();
    assert!(matches!(err, StoreError::BadResponse(_)), "{err:?}");

    sidecar.insert("s", "text", json!("not base64!"));
    let err = store.get("text").await.unwrap_err();
    assert!(matches!(err, StoreError::BadResponse(_)), "{err:?}");
}

#[tokio::test]
async fn test_timeout() {
    let (sidecar, store) = sidecar("s");

    sidecar.set_delay(Some(Duration::from_secs(2)));
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout(_)), "{err:?}");
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_connection_refused() {
    statecache_test::setup();

    // grab a free port and release it again
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = DaprConfig {
        endpoint: Some(format!("http://127.0.0.1:{port}").parse().unwrap()),
        ..Default::default()
    };
    let store = DaprClient::new(&config).unwrap().store("s").unwrap();

    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)), "{err:?}");
}
