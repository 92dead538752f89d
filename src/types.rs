//! Core types: keys, key paths, and store/index options.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A record key.
///
/// Keys of different kinds order as Number < String < Binary < Array.
/// Numbers are always finite; `-0.0` is stored as `0.0`.
#[derive(Clone, Serialize, Deserialize)]
pub enum Key {
    Number(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    /// Build a numeric key, rejecting NaN and infinities.
    pub fn number(n: f64) -> Result<Self> {
        if !n.is_finite() {
            return Err(StoreError::Data(format!("{} is not a valid key", n)));
        }
        // Normalizes -0.0.
        Ok(Key::Number(n + 0.0))
    }

    /// Convert a JSON value into a key.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) => Key::number(f),
                None => Err(StoreError::Data(format!("{} is not a valid key", n))),
            },
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            other => Err(StoreError::Data(format!("{} is not a valid key", other))),
        }
    }

    /// Convert the key back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Binary(_) => 2,
            Key::Array(_) => 3,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::String(s) => write!(f, "{:?}", s),
            Key::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Binary(bytes)
    }
}

/// The attribute (or attributes) a key is read from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Dotted path such as `"profile.email"`. The empty path is the record itself.
    Path(String),
    /// Several paths combined into an array key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Evaluate the path against a record.
    ///
    /// Returns `Ok(None)` when the record has no value at the path and a
    /// `Data` error when the value there is not a valid key.
    pub fn evaluate(&self, record: &Value) -> Result<Option<Key>> {
        match self {
            KeyPath::Path(path) => match lookup(record, path) {
                Some(value) => Key::from_value(value).map(Some),
                None => Ok(None),
            },
            KeyPath::Compound(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for path in paths {
                    match lookup(record, path) {
                        Some(value) => parts.push(Key::from_value(value)?),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Key::Array(parts)))
            }
        }
    }

    /// Write a generated key into the record at this path, creating
    /// intermediate objects as needed.
    pub fn inject(&self, record: &mut Value, key: &Key) -> Result<()> {
        let path = match self {
            KeyPath::Path(path) if !path.is_empty() => path,
            _ => {
                return Err(StoreError::Data(format!(
                    "cannot inject a key at {}",
                    self
                )))
            }
        };

        let mut segments = path.split('.').peekable();
        let mut current = record;
        while let Some(segment) = segments.next() {
            let object = current.as_object_mut().ok_or_else(|| {
                StoreError::Data(format!("cannot inject a key at {}: not an object", path))
            })?;
            if segments.peek().is_none() {
                object.insert(segment.to_string(), key.to_value());
                return Ok(());
            }
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(())
    }

    /// Whether a generated key can be written back through this path.
    pub(crate) fn supports_injection(&self) -> bool {
        matches!(self, KeyPath::Path(path) if !path.is_empty())
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(record);
    }
    path.split('.')
        .try_fold(record, |value, segment| value.as_object()?.get(segment))
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Path(path) => write!(f, "{:?}", path),
            KeyPath::Compound(paths) => write!(f, "{:?}", paths),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Path(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Path(path)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Compound(paths.into_iter().map(String::from).collect())
    }
}

/// Options for a new object store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// In-line key path; `None` means keys are supplied out of line.
    pub key_path: Option<KeyPath>,

    /// Generate keys for records that don't carry one.
    pub auto_increment: bool,
}

impl StoreOptions {
    /// Store whose records carry their key at `path`.
    pub fn with_key_path(path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: Some(path.into()),
            auto_increment: false,
        }
    }

    /// Enable the key generator.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.auto_increment {
            if let Some(path) = &self.key_path {
                if !path.supports_injection() {
                    return Err(StoreError::InvalidOperation(format!(
                        "auto-increment requires a non-empty single key path, got {}",
                        path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Declaration of a secondary index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub index_name: String,
    pub attribute: KeyPath,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(index_name: impl Into<String>, attribute: impl Into<KeyPath>) -> Self {
        Self {
            index_name: index_name.into(),
            attribute: attribute.into(),
            unique: false,
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// Transaction mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Schema changes; only the engine opens these.
    VersionChange,
}

impl TransactionMode {
    pub fn is_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering_across_kinds() {
        let mut keys = vec![
            Key::Array(vec![Key::from(1)]),
            Key::from("b"),
            Key::from(vec![0u8]),
            Key::from(10),
            Key::from("a"),
            Key::from(-3),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::from(-3),
                Key::from(10),
                Key::from("a"),
                Key::from("b"),
                Key::from(vec![0u8]),
                Key::Array(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        assert_eq!(Key::number(-0.0).unwrap(), Key::from(0));
        assert!(Key::number(f64::NAN).is_err());
    }

    #[test]
    fn test_key_from_value() {
        assert_eq!(Key::from_value(&json!(5)).unwrap(), Key::from(5));
        assert_eq!(
            Key::from_value(&json!(["a", 1])).unwrap(),
            Key::Array(vec![Key::from("a"), Key::from(1)])
        );
        assert!(matches!(
            Key::from_value(&json!(null)),
            Err(StoreError::Data(_))
        ));
        assert!(Key::from_value(&json!({"a": 1})).is_err());
        assert!(Key::from_value(&json!(true)).is_err());
    }

    #[test]
    fn test_key_to_value() {
        assert_eq!(Key::from(7).to_value(), json!(7));
        assert_eq!(Key::number(1.5).unwrap().to_value(), json!(1.5));
        assert_eq!(Key::from("x").to_value(), json!("x"));
    }

    #[test]
    fn test_key_path_evaluate() {
        let record = json!({"id": 3, "profile": {"email": "a@b.c"}, "flag": true});

        assert_eq!(
            KeyPath::from("id").evaluate(&record).unwrap(),
            Some(Key::from(3))
        );
        assert_eq!(
            KeyPath::from("profile.email").evaluate(&record).unwrap(),
            Some(Key::from("a@b.c"))
        );
        assert_eq!(KeyPath::from("missing").evaluate(&record).unwrap(), None);
        assert!(KeyPath::from("flag").evaluate(&record).is_err());

        let compound = KeyPath::from(vec!["id", "profile.email"]);
        assert_eq!(
            compound.evaluate(&record).unwrap(),
            Some(Key::Array(vec![Key::from(3), Key::from("a@b.c")]))
        );
    }

    #[test]
    fn test_key_path_inject() {
        let mut record = json!({"name": "x"});
        KeyPath::from("meta.id")
            .inject(&mut record, &Key::from(4))
            .unwrap();
        assert_eq!(record, json!({"name": "x", "meta": {"id": 4}}));

        let mut scalar = json!(12);
        assert!(KeyPath::from("id").inject(&mut scalar, &Key::from(1)).is_err());
    }

    #[test]
    fn test_store_options_validation() {
        assert!(StoreOptions::with_key_path("id")
            .auto_increment()
            .validate()
            .is_ok());
        assert!(StoreOptions::default().auto_increment().validate().is_ok());
        assert!(StoreOptions::with_key_path("")
            .auto_increment()
            .validate()
            .is_err());
        assert!(StoreOptions::with_key_path(vec!["a", "b"])
            .auto_increment()
            .validate()
            .is_err());
    }
}
