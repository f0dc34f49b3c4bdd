//! Helpers for testing cached functions and state stores.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`DaprServer`], make sure that the server is held until all requests to it have
//!    been made. If the server is dropped, connections to it are refused. To avoid this, assign it
//!    to a variable: `let sidecar = DaprServer::new();`.
//!
//!  - [`RecordingStore`] and [`FailingStore`] test the cache without HTTP connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use statecache::config::DaprConfig;
use statecache::{MemoryStateStore, StateStore, StoreError, Ttl};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use axum::http::StatusCode;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `statecache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("statecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A request the fake sidecar received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRequest {
    pub method: &'static str,
    pub store: String,
    pub key: String,
    /// The `ttlInSeconds` metadata of a save.
    pub ttl: Option<u64>,
}

#[derive(Debug)]
struct StoredState {
    value: Value,
    expires: Option<Instant>,
}

impl StoredState {
    fn is_live(&self) -> bool {
        self.expires.is_none_or(|expires| expires > Instant::now())
    }
}

#[derive(Debug, Default)]
struct Sidecar {
    entries: HashMap<(String, String), StoredState>,
    requests: Vec<StateRequest>,
    failure: Option<StatusCode>,
    delay: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
struct SharedSidecar(Arc<Mutex<Sidecar>>);

impl SharedSidecar {
    fn lock(&self) -> MutexGuard<'_, Sidecar> {
        self.0.lock().unwrap()
    }

    /// Records `requests`, then applies the configured delay and failure.
    async fn admit(&self, requests: Vec<StateRequest>) -> Result<(), StatusCode> {
        let (delay, failure) = {
            let mut sidecar = self.lock();
            sidecar.requests.extend(requests);
            (sidecar.delay, sidecar.failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct SaveItem {
    key: String,
    value: Value,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

async fn get_state(
    State(sidecar): State<SharedSidecar>,
    Path((store, key)): Path<(String, String)>,
) -> Response {
    let request = StateRequest {
        method: "GET",
        store: store.clone(),
        key: key.clone(),
        ttl: None,
    };
    if let Err(status) = sidecar.admit(vec![request]).await {
        return status.into_response();
    }

    match sidecar.lock().entries.get(&(store, key)) {
        Some(state) if state.is_live() => Json(state.value.clone()).into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn delete_state(
    State(sidecar): State<SharedSidecar>,
    Path((store, key)): Path<(String, String)>,
) -> StatusCode {
    let request = StateRequest {
        method: "DELETE",
        store: store.clone(),
        key: key.clone(),
        ttl: None,
    };
    if let Err(status) = sidecar.admit(vec![request]).await {
        return status;
    }

    sidecar.lock().entries.remove(&(store, key));
    StatusCode::NO_CONTENT
}

async fn save_state(
    State(sidecar): State<SharedSidecar>,
    Path(store): Path<String>,
    Json(items): Json<Vec<SaveItem>>,
) -> Response {
    let mut ttls = Vec::with_capacity(items.len());
    for item in &items {
        let ttl = match item.metadata.get("ttlInSeconds") {
            Some(ttl) => match ttl.parse::<u64>() {
                Ok(ttl) => Some(ttl),
                Err(_) => return (StatusCode::BAD_REQUEST, "invalid ttlInSeconds").into_response(),
            },
            None => None,
        };
        ttls.push(ttl);
    }

    let requests = items
        .iter()
        .zip(&ttls)
        .map(|(item, ttl)| StateRequest {
            method: "POST",
            store: store.clone(),
            key: item.key.clone(),
            ttl: *ttl,
        })
        .collect();
    if let Err(status) = sidecar.admit(requests).await {
        return status.into_response();
    }

    let mut sidecar = sidecar.lock();
    for (item, ttl) in items.into_iter().zip(ttls) {
        let state = StoredState {
            value: item.value,
            // a deadline beyond what `Instant` can hold never expires
            expires: ttl.and_then(|ttl| Instant::now().checked_add(Duration::from_secs(ttl))),
        };
        sidecar.entries.insert((store.clone(), item.key), state);
    }
    StatusCode::NO_CONTENT.into_response()
}

/// An in-process stand-in for the state API of a Dapr sidecar.
///
/// Honors `ttlInSeconds`, records every request and can be told to fail or stall.
pub struct DaprServer {
    server: Server,
    sidecar: SharedSidecar,
}

impl DaprServer {
    pub fn new() -> Self {
        let sidecar = SharedSidecar::default();

        let router = Router::new()
            .route("/v1.0/state/:store", post(save_state))
            .route("/v1.0/state/:store/:key", get(get_state).delete(delete_state))
            .with_state(sidecar.clone());

        let server = Server::with_router(router);

        Self { server, sidecar }
    }

    /// The base URL to configure clients with.
    pub fn endpoint(&self) -> Url {
        format!("http://{}/", self.server.addr()).parse().unwrap()
    }

    /// A client configuration pointing at this sidecar.
    pub fn config(&self) -> DaprConfig {
        DaprConfig {
            endpoint: Some(self.endpoint()),
            ..Default::default()
        }
    }

    /// Returns and clears the requests received so far.
    pub fn requests(&self) -> Vec<StateRequest> {
        std::mem::take(&mut self.sidecar.lock().requests)
    }

    /// Answers every following request with `status`, or normally again with `None`.
    pub fn fail_with(&self, status: Option<StatusCode>) {
        self.sidecar.lock().failure = status;
    }

    /// Delays every following request by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.sidecar.lock().delay = delay;
    }

    /// The decoded bytes of a live entry.
    pub fn value(&self, store: &str, key: &str) -> Option<Vec<u8>> {
        let sidecar = self.sidecar.lock();
        let state = sidecar.entries.get(&(store.to_owned(), key.to_owned()))?;
        if !state.is_live() {
            return None;
        }
        STANDARD.decode(state.value.as_str()?).ok()
    }

    /// Stores a raw JSON value as if a client had saved it.
    pub fn insert(&self, store: &str, key: &str, value: Value) {
        let state = StoredState {
            value,
            expires: None,
        };
        self.sidecar
            .lock()
            .entries
            .insert((store.to_owned(), key.to_owned()), state);
    }

    /// Keys of the live entries of `store`, sorted.
    pub fn keys(&self, store: &str) -> Vec<String> {
        let sidecar = self.sidecar.lock();
        let mut keys: Vec<_> = sidecar
            .entries
            .iter()
            .filter(|((s, _), state)| s == store && state.is_live())
            .map(|((_, key), _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for DaprServer {
    fn default() -> Self {
        Self::new()
    }
}

/// An operation a [`RecordingStore`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Get(String),
    Put { key: String, ttl: u64, size: usize },
    Delete(String),
}

/// A [`MemoryStateStore`] that records every operation.
#[derive(Clone, Debug)]
pub struct RecordingStore {
    inner: MemoryStateStore,
    ops: Arc<Mutex<Vec<StoreOp>>>,
}

impl RecordingStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryStateStore::new(name),
            ops: Arc::default(),
        }
    }

    /// The wrapped store, sharing its contents.
    pub fn memory(&self) -> &MemoryStateStore {
        &self.inner
    }

    /// Returns and clears the operations recorded so far.
    pub fn ops(&self) -> Vec<StoreOp> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().unwrap().push(op);
    }
}

impl StateStore for RecordingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        self.record(StoreOp::Get(key.to_owned()));
        self.inner.get(key)
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.record(StoreOp::Put {
            key: key.to_owned(),
            ttl: ttl.as_secs(),
            size: value.len(),
        });
        self.inner.put(key, value, ttl)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.record(StoreOp::Delete(key.to_owned()));
        self.inner.delete(key)
    }
}

/// A store whose every operation fails.
#[derive(Clone, Debug, Default)]
pub struct FailingStore {
    attempts: Arc<Mutex<usize>>,
    /// Fail with a timeout instead of a connection error.
    pub timeout: bool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timing_out() -> Self {
        Self {
            timeout: true,
            ..Self::default()
        }
    }

    /// How many operations were attempted.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    fn fail<T: Send + 'static>(&self) -> BoxFuture<'static, Result<T, StoreError>> {
        *self.attempts.lock().unwrap() += 1;
        let err = if self.timeout {
            StoreError::Timeout(Duration::from_secs(5))
        } else {
            StoreError::Connection(anyhow::anyhow!("connection refused"))
        };
        futures::future::ready(Err(err)).boxed()
    }
}

impl StateStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        self.fail()
    }

    fn put<'a>(
        &'a self,
        _key: &'a str,
        _value: Vec<u8>,
        _ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.fail()
    }

    fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.fail()
    }
}
