//! Dispatch facade: one tagged request type routed to the store operations.

use crate::error::{Result, StoreError};
use crate::range::{Endpoint, RangeSpec};
use crate::types::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A store operation, as accepted by [`Store::dispatch`](super::Store::dispatch).
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Add { data: Value, key: Option<Key> },
    Put { data: Value, key: Option<Key> },
    Get { key: Key, index: Option<String> },
    GetAll,
    GetRange { range: RangeSpec, index: Option<String> },
    Delete { key: Key },
    Count,
    Clear,
}

/// What a dispatched operation produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Key assigned by `add`/`put`.
    Key(Key),
    /// Result of `get`; `None` when nothing matched.
    Record(Option<Value>),
    /// Result of `getAll`/`getRange`, in key order.
    Records(Vec<Value>),
    Count(u64),
    /// `delete`/`clear` finished.
    Done,
}

/// One end of a range in a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundRequest {
    pub value: Value,
    #[serde(default)]
    pub open: bool,
}

/// Loosely-typed operation request, e.g. parsed from JSON:
///
/// ```json
/// {"type": "getRange", "lower": {"value": 5}, "upper": {"value": 10, "open": true}}
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub lower: Option<BoundRequest>,
    #[serde(default)]
    pub upper: Option<BoundRequest>,
}

impl OperationRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn required_key(&self) -> Result<Key> {
        match &self.key {
            Some(value) => Key::from_value(value),
            None => Err(StoreError::Data(format!("{} requires a key", self.kind))),
        }
    }

    fn optional_key(&self) -> Result<Option<Key>> {
        self.key.as_ref().map(Key::from_value).transpose()
    }

    fn required_data(&self) -> Result<Value> {
        self.data
            .clone()
            .ok_or_else(|| StoreError::Data(format!("{} requires data", self.kind)))
    }

    fn range(&self) -> Result<RangeSpec> {
        let endpoint = |bound: &BoundRequest| -> Result<Endpoint> {
            Ok(Endpoint {
                value: Key::from_value(&bound.value)?,
                open: bound.open,
            })
        };
        Ok(RangeSpec {
            lower: self.lower.as_ref().map(endpoint).transpose()?,
            upper: self.upper.as_ref().map(endpoint).transpose()?,
        })
    }
}

impl TryFrom<OperationRequest> for Operation {
    type Error = StoreError;

    fn try_from(request: OperationRequest) -> Result<Self> {
        match request.kind.as_str() {
            "add" => Ok(Operation::Add {
                data: request.required_data()?,
                key: request.optional_key()?,
            }),
            "put" => Ok(Operation::Put {
                data: request.required_data()?,
                key: request.optional_key()?,
            }),
            "get" => Ok(Operation::Get {
                key: request.required_key()?,
                index: request.index.clone(),
            }),
            "getAll" => Ok(Operation::GetAll),
            "getRange" => Ok(Operation::GetRange {
                range: request.range()?,
                index: request.index.clone(),
            }),
            "delete" => Ok(Operation::Delete {
                key: request.required_key()?,
            }),
            "count" => Ok(Operation::Count),
            "clear" => Ok(Operation::Clear),
            other => Err(StoreError::UnsupportedOperation(other.to_string())),
        }
    }
}
