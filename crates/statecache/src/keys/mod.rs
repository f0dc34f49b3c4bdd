//! Cache key derivation.
//!
//! A key is made of three `:` separated segments: a namespace prefix, the [`CallSite`] of the
//! cached function and a truncated SHA-256 digest of its normalized arguments:
//!
//! ```text
//! users:my_service::accounts::load_user:5f0a3c9e1d2b7a64
//! ```
//!
//! Arguments are normalized through [`serde`] into JSON values when they are added to [`Args`].
//! Maps are emitted with sorted keys and named arguments are sorted by name, so the digest only
//! depends on argument *values*. Floats without a JSON representation are written as tagged
//! objects such as `{"$float":"NaN"}`, and `-0.0` stays distinct from `0.0`. Types with an
//! unstable iteration order (such as `HashSet`) should be converted to ordered collections before
//! being passed in.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

mod canonical;

/// Number of digest bytes that end up in a key, rendered as twice as many hex digits.
const DIGEST_BYTES: usize = 8;

/// Errors deriving a cache key.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("argument {position} cannot be normalized: {reason}")]
    UnserializableArgument { position: String, reason: String },
    #[error("key strategy produced an empty key")]
    EmptyKey,
    #[error("{0}")]
    Custom(String),
}

/// The stable identity of a cached callable.
///
/// Use the [`call_site!`](crate::call_site) macro, which qualifies the name with the module path
/// of the invocation so that two functions can never share a call site by accident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite(Cow<'static, str>);

impl CallSite {
    pub const fn from_static(path: &'static str) -> Self {
        Self(Cow::Borrowed(path))
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self(Cow::Owned(path.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates a [`CallSite`] for `name` qualified with the current module path.
///
/// ```
/// let site = statecache::call_site!("load_user");
/// assert!(site.as_str().ends_with("::load_user"));
/// ```
#[macro_export]
macro_rules! call_site {
    ($name:literal) => {
        $crate::CallSite::from_static(concat!(module_path!(), "::", $name))
    };
}

/// A single normalized argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Value(Value),
    /// The argument could not be normalized, `reason` holds the serializer error.
    Unserializable { reason: Arc<str> },
}

impl Argument {
    fn normalize<T: Serialize + ?Sized>(value: &T) -> Self {
        match canonical::to_value(value) {
            Ok(value) => Argument::Value(sorted(value)),
            Err(err) => Argument::Unserializable {
                reason: err.to_string().into(),
            },
        }
    }

    /// Returns the normalized value, if normalization succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Argument::Value(value) => Some(value),
            Argument::Unserializable { .. } => None,
        }
    }
}

/// The arguments of a single call, as seen by a [`KeyStrategy`].
///
/// Normalization happens eagerly and only reads the passed values. Failures are recorded and
/// reported by the strategy, so a custom strategy that ignores an argument can still key on the
/// others.
#[derive(Debug, Clone, Default)]
pub struct Args {
    receiver: Option<&'static str>,
    positional: Vec<Argument>,
    named: BTreeMap<String, Argument>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the call as bound to a receiver, such as `&self` of a method.
    ///
    /// The [`DefaultKeyStrategy`] leaves the receiver out of the key, so all receivers share the
    /// cache entries of a method for equal remaining arguments. Only the receiver's type name is
    /// kept, for strategies that want to key per type.
    pub fn receiver<R: ?Sized>(mut self, _receiver: &R) -> Self {
        self.receiver = Some(std::any::type_name::<R>());
        self
    }

    /// Appends a positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.positional.push(Argument::normalize(value));
        self
    }

    /// Adds a named argument. A later value for the same name replaces the earlier one.
    pub fn named<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.named.insert(name.into(), Argument::normalize(value));
        self
    }

    /// The type name of the receiver, if the call is bound.
    pub fn receiver_type(&self) -> Option<&'static str> {
        self.receiver
    }

    pub fn is_bound(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn positional(&self) -> &[Argument] {
        &self.positional
    }

    /// Named arguments, sorted by name.
    pub fn named_args(&self) -> impl Iterator<Item = (&str, &Argument)> {
        self.named.iter().map(|(name, arg)| (name.as_str(), arg))
    }

    /// Renders the canonical `{"args":[..],"kwargs":{..}}` document that is hashed into keys.
    ///
    /// The receiver of a bound call is not part of the document.
    pub fn canonical_json(&self) -> Result<String, KeyError> {
        let mut args = Vec::with_capacity(self.positional.len());
        for (idx, arg) in self.positional.iter().enumerate() {
            args.push(checked(arg, || idx.to_string())?);
        }
        let mut kwargs = serde_json::Map::new();
        for (name, arg) in &self.named {
            kwargs.insert(name.clone(), checked(arg, || name.clone())?);
        }

        let mut document = serde_json::Map::new();
        document.insert("args".into(), Value::Array(args));
        document.insert("kwargs".into(), Value::Object(kwargs));
        Ok(Value::Object(document).to_string())
    }
}

/// Rebuilds all objects in `value` with their keys in sorted order.
///
/// The default `serde_json` map is already ordered, this keeps keys stable even when another
/// crate in the build enables `preserve_order`.
fn sorted(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sorted(v)))
                    .collect(),
            )
        }
        other => other,
    }
}

fn checked(arg: &Argument, position: impl FnOnce() -> String) -> Result<Value, KeyError> {
    match arg {
        Argument::Value(value) => Ok(value.clone()),
        Argument::Unserializable { reason } => Err(KeyError::UnserializableArgument {
            position: position(),
            reason: reason.to_string(),
        }),
    }
}

/// Turns a call into the key its result is stored under.
pub trait KeyStrategy: Send + Sync + 'static {
    /// Builds the full key, including any namespace.
    ///
    /// The only requirement on the output is that it is not empty.
    fn build_key(&self, call_site: &CallSite, args: &Args) -> Result<String, KeyError>;
}

impl<F> KeyStrategy for F
where
    F: Fn(&CallSite, &Args) -> Result<String, KeyError> + Send + Sync + 'static,
{
    fn build_key(&self, call_site: &CallSite, args: &Args) -> Result<String, KeyError> {
        self(call_site, args)
    }
}

/// Builds `{prefix}:{call_site}:{digest}` keys.
#[derive(Debug, Clone)]
pub struct DefaultKeyStrategy {
    prefix: Arc<str>,
}

impl DefaultKeyStrategy {
    pub fn new(prefix: impl Into<Arc<str>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl KeyStrategy for DefaultKeyStrategy {
    fn build_key(&self, call_site: &CallSite, args: &Args) -> Result<String, KeyError> {
        let document = args.canonical_json()?;
        let digest = Sha256::digest(document.as_bytes());

        let mut key = format!("{}:{}:", self.prefix, call_site);
        for b in &digest[..DIGEST_BYTES] {
            key.write_fmt(format_args!("{b:02x}"))
                .map_err(|err| KeyError::Custom(err.to_string()))?;
        }
        Ok(key)
    }
}

/// Runs `strategy` and enforces a non-empty result.
pub(crate) fn derive_key(
    strategy: &dyn KeyStrategy,
    call_site: &CallSite,
    args: &Args,
) -> Result<String, KeyError> {
    let key = strategy.build_key(call_site, args)?;
    if key.trim().is_empty() {
        return Err(KeyError::EmptyKey);
    }
    Ok(key)
}
