//! Read-through memoization of function calls backed by a remote state store.
//!
//! A [`Cached`] (or [`BlockingCached`]) wraps a single callable. For every call it derives a
//! stable key from the call site and the arguments, tries the remote store, and on a miss runs
//! the computation exactly once per key within the process, writing the encoded result back with
//! a time-to-live.
//!
//! Everything on the cache path is best-effort: an unreachable store, a corrupt entry or an
//! argument that cannot be hashed only ever costs a recomputation, never a failed call.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use statecache::{Args, Cached, DaprClient, call_site};
//! use statecache::config::Config;
//!
//! let config = Config::get(None)?;
//! let store = DaprClient::new(&config.dapr)?.store("users")?;
//! let cached = Cached::builder(call_site!("load_user"))
//!     .ttl_seconds(300)
//!     .build(store)?;
//!
//! let user_id = 42u64;
//! let name: Result<String, std::sync::Arc<std::io::Error>> = cached
//!     .call(Args::new().arg(&user_id), move || async move {
//!         Ok(format!("user-{user_id}"))
//!     })
//!     .await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod keys;
pub mod logging;
pub mod observer;
pub mod orchestrator;
pub mod singleflight;
pub mod store;
pub mod utils;

pub use codec::{Codec, JsonCodec, MsgpackCodec};
pub use error::{CacheError, ConfigError};
pub use keys::{Args, Argument, CallSite, DefaultKeyStrategy, KeyError, KeyStrategy};
pub use observer::CacheObserver;
pub use orchestrator::{BlockingCached, CacheBuilder, Cached};
pub use singleflight::SingleFlight;
pub use store::dapr::{DaprClient, DaprStateStore};
pub use store::memory::MemoryStateStore;
pub use store::{StateStore, StoreError, Ttl};
