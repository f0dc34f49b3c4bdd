use crate::codec::CodecError;
use crate::keys::KeyError;
use crate::store::StoreError;

/// Invalid configuration of a cached function or of the process-wide defaults.
///
/// These are programmer errors. They are returned from builders and constructors and are never
/// absorbed by the cache layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ttl must be at least 1 second, got {0}")]
    InvalidTtl(u64),
    #[error("key prefix must not be empty")]
    EmptyKeyPrefix,
    #[error("store name must not be empty")]
    EmptyStoreName,
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid sidecar endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// A failure on the cache path.
///
/// None of these ever reach the caller of a cached function. They are logged, handed to the
/// [`CacheObserver`](crate::CacheObserver) and the call degrades to a plain computation.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("failed to derive cache key")]
    KeyDerivation(#[from] KeyError),
    #[error("state store operation failed")]
    Store(#[from] StoreError),
    #[error("failed to encode value for the cache")]
    Encode(#[source] CodecError),
    #[error("failed to decode cached value")]
    Decode(#[source] CodecError),
}

impl CacheError {
    /// A short, stable name of the error kind, used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::KeyDerivation(_) => "key",
            CacheError::Store(StoreError::Timeout(_)) => "timeout",
            CacheError::Store(_) => "store",
            CacheError::Encode(_) => "encode",
            CacheError::Decode(_) => "decode",
        }
    }
}
