//! Query keys and key filters.
//!
//! A [`QueryKey`] is an ordered tuple of JSON segments, e.g.
//! `["queue", {"status": "active", "page": 2}]`. Keys compare structurally:
//! object segments are equal regardless of field order. Every key carries a
//! canonical string form (objects with sorted fields) which backs `Eq`,
//! `Hash`, and `Ord`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Build a [`QueryKey`] from JSON literals.
///
/// ```
/// use curio_sync::query_key;
///
/// let key = query_key!["queue", { "status": "active" }];
/// assert_eq!(key.root(), Some("queue"));
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::key::QueryKey::new(vec![$($crate::__serde_json::json!($segment)),*])
    };
}

/// Identifier of a cached result set.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Value>", into = "Vec<Value>")]
pub struct QueryKey {
    segments: Vec<Value>,
    canonical: String,
}

impl QueryKey {
    pub fn new(segments: Vec<Value>) -> Self {
        let mut canonical = String::new();
        write_canonical(&Value::Array(segments.clone()), &mut canonical);
        Self {
            segments,
            canonical,
        }
    }

    /// A single-segment key such as `["queue"]`.
    pub fn root_only(name: &str) -> Self {
        Self::new(vec![Value::String(name.to_string())])
    }

    /// Return a new key with `segment` appended.
    pub fn with(&self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// The first segment, when it is a string.
    pub fn root(&self) -> Option<&str> {
        self.segments.first().and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `prefix` is a structural prefix of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| segment_eq(a, b))
    }

    /// Canonical textual form; equal keys have equal canonical forms.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self::new(segments)
    }
}

impl From<QueryKey> for Vec<Value> {
    fn from(key: QueryKey) -> Self {
        key.segments
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn segment_eq(a: &Value, b: &Value) -> bool {
    let mut left = String::new();
    let mut right = String::new();
    write_canonical(a, &mut left);
    write_canonical(b, &mut right);
    left == right
}

/// Serialize `value` with object fields in sorted order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Predicate selecting a set of cache entries by key.
#[derive(Clone)]
pub enum KeyFilter {
    /// Every key.
    All,
    /// Exactly this key.
    Exact(QueryKey),
    /// Every key that starts with this key.
    Prefix(QueryKey),
    /// Every key whose first segment is this string.
    Root(String),
    /// Arbitrary predicate.
    Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl KeyFilter {
    pub fn exact(key: QueryKey) -> Self {
        Self::Exact(key)
    }

    pub fn prefix(key: QueryKey) -> Self {
        Self::Prefix(key)
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self::Root(name.into())
    }

    pub fn predicate(f: impl Fn(&QueryKey) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::Root(name) => key.root() == Some(name.as_str()),
            Self::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Exact(key) => write!(f, "Exact({})", key),
            Self::Prefix(key) => write!(f, "Prefix({})", key),
            Self::Root(name) => write!(f, "Root({:?})", name),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
