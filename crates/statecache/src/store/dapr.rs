//! Client for the state management API of a Dapr sidecar.
//!
//! Values travel as base64 inside JSON strings:
//!
//! - `GET /v1.0/state/{store}/{key}` returns the stored string, `204` when there is none.
//! - `POST /v1.0/state/{store}` takes a list of `{key, value, metadata}` items, the ttl goes into
//!   the `ttlInSeconds` metadata entry.
//! - `DELETE /v1.0/state/{store}/{key}`.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use url::Url;

use crate::config::{Config, DaprConfig, validate_store_name};
use crate::error::ConfigError;

use super::{StateStore, StoreError, Ttl};

/// A connection to the sidecar, shared by all stores created from it.
#[derive(Clone)]
pub struct DaprClient {
    client: Client,
    endpoint: Url,
    timeout: Duration,
    connect_timeout: Duration,
}

impl fmt::Debug for DaprClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaprClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl DaprClient {
    pub fn new(config: &DaprConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;
        if endpoint.cannot_be_a_base() {
            return Err(ConfigError::InvalidEndpoint(endpoint.into()));
        }
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            timeout: config.timeout,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_error(&self, err: reqwest::Error) -> StoreError {
        // reqwest only times out on connect, the overall timeout is ours
        if err.is_timeout() {
            return StoreError::Timeout(self.connect_timeout);
        }
        if err.is_connect() {
            return StoreError::Connection(anyhow::Error::new(err));
        }
        StoreError::BadResponse(anyhow::Error::new(err))
    }

    /// Returns a handle to the state store component called `name`.
    pub fn store(&self, name: impl Into<String>) -> Result<DaprStateStore, ConfigError> {
        let name = name.into();
        validate_store_name(&name)?;
        Ok(DaprStateStore {
            client: self.clone(),
            name,
        })
    }
}

#[derive(Serialize)]
struct StateItem<'a> {
    key: &'a str,
    value: String,
    metadata: StateMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateMetadata {
    ttl_in_seconds: String,
}

/// A single Dapr state store component.
#[derive(Clone, Debug)]
pub struct DaprStateStore {
    client: DaprClient,
    name: String,
}

impl DaprStateStore {
    /// Connects to the store named by `config`, through the sidecar configured there.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        DaprClient::new(&config.dapr)?.store(config.store_name()?)
    }

    fn state_url(&self, key: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.client.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                StoreError::Connection(anyhow!("sidecar endpoint cannot carry a path"))
            })?;
            segments
                .pop_if_empty()
                .extend(["v1.0", "state", self.name.as_str()]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    /// Bounds `future` by the configured timeout and records how it went.
    async fn timed<T, F>(&self, op: &'static str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(self.client.timeout, future)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.client.timeout)));

        let status = match result {
            Ok(_) => "ok",
            Err(ref err) => err.kind(),
        };
        metric!(
            timer("store.dapr.duration") = start.elapsed(),
            "op" => op,
            "status" => status,
        );
        result
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.state_url(Some(key))?;
        let response = self
            .client
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.client.request_error(err))?;

        let status = response.status();
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            _ if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| self.client.request_error(err))?;
                if body.is_empty() {
                    return Ok(None);
                }
                let encoded: String = serde_json::from_slice(&body)
                    .context("state value is not a JSON string")
                    .map_err(StoreError::BadResponse)?;
                let bytes = STANDARD
                    .decode(encoded)
                    .context("state value is not valid base64")
                    .map_err(StoreError::BadResponse)?;
                tracing::trace!("Found {} bytes for {} in {}", bytes.len(), key, self.name);
                Ok(Some(bytes))
            }
            _ => Err(error_response(response).await),
        }
    }

    async fn save(&self, key: &str, value: Vec<u8>, ttl: Ttl) -> Result<(), StoreError> {
        let url = self.state_url(None)?;
        let items = [StateItem {
            key,
            value: STANDARD.encode(value),
            metadata: StateMetadata {
                ttl_in_seconds: ttl.as_secs().to_string(),
            },
        }];
        let response = self
            .client
            .client
            .post(url)
            .json(&items)
            .send()
            .await
            .map_err(|err| self.client.request_error(err))?;

        if !response.status().is_success() {
            return Err(error_response(response).await);
        }
        tracing::trace!("Saved {} in {} for {}", key, self.name, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let url = self.state_url(Some(key))?;
        let response = self
            .client
            .client
            .delete(url)
            .send()
            .await
            .map_err(|err| self.client.request_error(err))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::trace!("Deleted {} from {}", key, self.name);
            return Ok(());
        }
        Err(error_response(response).await)
    }
}

impl StateStore for DaprStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        self.timed("get", self.fetch(key)).boxed()
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.timed("put", self.save(key, value, ttl)).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.timed("delete", self.remove(key)).boxed()
    }
}

async fn error_response(response: reqwest::Response) -> StoreError {
    let status = response.status();
    // the sidecar explains errors in a small JSON body
    let body = response.text().await.unwrap_or_default();
    StoreError::BadResponse(anyhow!("error response from sidecar: {status}: {body}"))
}
