use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::error::ConfigError;
use crate::store::Ttl;

/// The store cached functions use when none is configured.
pub const DEFAULT_STORE_NAME: &str = "cache";
/// The port of the Dapr sidecar's HTTP API when `DAPR_HTTP_PORT` is not set.
pub const DEFAULT_DAPR_HTTP_PORT: u16 = 3500;

const ENV_STORE_NAME: &str = "DAPR_CACHE_DEFAULT_STORE_NAME";
const ENV_DEFAULT_TTL: &str = "DAPR_CACHE_DEFAULT_TTL";
const ENV_DAPR_ENDPOINT: &str = "DAPR_HTTP_ENDPOINT";
const ENV_DAPR_HOST: &str = "DAPR_HTTP_HOST";
const ENV_DAPR_PORT: &str = "DAPR_HTTP_PORT";
const ENV_STATSD: &str = "STATSD_SERVER";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// Tags appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env_var(ENV_STATSD),
            prefix: "statecache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection to the Dapr sidecar.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaprConfig {
    /// Base URL of the sidecar's HTTP API.
    ///
    /// Falls back to `DAPR_HTTP_ENDPOINT`, then to `DAPR_HTTP_HOST` and `DAPR_HTTP_PORT`.
    pub endpoint: Option<Url>,
    /// Upper bound for a whole state operation, including reading the response.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound for establishing a connection to the sidecar.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DaprConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl DaprConfig {
    /// Resolves the sidecar base URL.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        if let Some(ref endpoint) = self.endpoint {
            return Ok(endpoint.clone());
        }
        let raw = match env_var(ENV_DAPR_ENDPOINT) {
            Some(endpoint) => endpoint,
            None => {
                let host = env_var(ENV_DAPR_HOST).unwrap_or_else(|| "127.0.0.1".into());
                let port = match env_var(ENV_DAPR_PORT) {
                    Some(port) => port.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                        name: ENV_DAPR_PORT,
                        value: port,
                    })?,
                    None => DEFAULT_DAPR_HTTP_PORT,
                };
                format!("http://{host}:{port}")
            }
        };
        Url::parse(&raw).map_err(|_| ConfigError::InvalidEndpoint(raw))
    }
}

/// Process-wide settings.
///
/// Values set here apply to every cached function that does not override them.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The state store of cached functions, see [`Config::store_name`].
    pub store_name: Option<String>,

    /// Namespace of generated keys. When unset, keys are prefixed with the store name.
    pub key_prefix: Option<String>,

    /// Time-to-live in seconds, see [`Config::default_ttl`].
    pub default_ttl: Option<u64>,

    pub dapr: DaprConfig,

    pub logging: Logging,

    pub metrics: Metrics,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The store name: configured value, else `DAPR_CACHE_DEFAULT_STORE_NAME`, else `"cache"`.
    pub fn store_name(&self) -> Result<String, ConfigError> {
        let name = match self.store_name {
            Some(ref name) => name.clone(),
            None => env_var(ENV_STORE_NAME).unwrap_or_else(|| DEFAULT_STORE_NAME.into()),
        };
        validate_store_name(&name)?;
        Ok(name)
    }

    /// The explicitly configured key prefix, validated.
    pub fn key_prefix(&self) -> Result<Option<&str>, ConfigError> {
        match self.key_prefix.as_deref() {
            Some(prefix) => validate_key_prefix(prefix).map(Some),
            None => Ok(None),
        }
    }

    /// The default ttl: configured value, else `DAPR_CACHE_DEFAULT_TTL`, else one hour.
    pub fn default_ttl(&self) -> Result<Ttl, ConfigError> {
        if let Some(secs) = self.default_ttl {
            return Ttl::from_secs(secs);
        }
        match env_var(ENV_DEFAULT_TTL) {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_DEFAULT_TTL,
                    value: raw,
                })?;
                Ttl::from_secs(secs)
            }
            None => Ok(Ttl::DEFAULT),
        }
    }
}

pub(crate) fn validate_store_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyStoreName);
    }
    Ok(())
}

pub(crate) fn validate_key_prefix(prefix: &str) -> Result<&str, ConfigError> {
    if prefix.trim().is_empty() {
        return Err(ConfigError::EmptyKeyPrefix);
    }
    Ok(prefix)
}

/// Reads an environment variable, treating blank values as unset.
fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
