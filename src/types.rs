use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Values that can be stored in a database row or bound as query parameters
///
/// This enum provides a unified representation of database values across
/// different drivers, and is serializable so cached query results can be
/// stored as bytes in an external cache store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValues::Bool(value) => Some(*value),
            RowValues::Int(1) => Some(true),
            RowValues::Int(0) => Some(false),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            RowValues::Timestamp(value) => Some(*value),
            RowValues::Text(s) => {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                    return Some(dt);
                }
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S.%3f").ok()
            }
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }
}

/// Transaction isolation levels understood by `Connection::begin_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL fragment for `SET TRANSACTION ISOLATION LEVEL ...`.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// How a read command shapes its result; participates in the cache key so
/// differently-shaped fetches of the same SQL never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    All,
    One,
    Scalar,
    Column,
}

impl FetchMethod {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            FetchMethod::All => "all",
            FetchMethod::One => "one",
            FetchMethod::Scalar => "scalar",
            FetchMethod::Column => "column",
        }
    }
}

/// Address of a bound parameter: a `:name` placeholder or a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamIndex {
    Named(String),
    Positional(u16),
}

impl From<&str> for ParamIndex {
    fn from(name: &str) -> Self {
        if name.starts_with(':') {
            ParamIndex::Named(name.to_string())
        } else {
            ParamIndex::Named(format!(":{name}"))
        }
    }
}

impl From<u16> for ParamIndex {
    fn from(position: u16) -> Self {
        ParamIndex::Positional(position)
    }
}

impl std::fmt::Display for ParamIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamIndex::Named(name) => write!(f, "{name}"),
            ParamIndex::Positional(position) => write!(f, "?{position}"),
        }
    }
}

/// Wire type of a bound parameter, inferred from the value unless given
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
    Json,
    Blob,
    Null,
}

impl ParamType {
    #[must_use]
    pub fn infer(value: &RowValues) -> Self {
        match value {
            RowValues::Int(_) => ParamType::Int,
            RowValues::Float(_) => ParamType::Float,
            RowValues::Text(_) => ParamType::Text,
            RowValues::Bool(_) => ParamType::Bool,
            RowValues::Timestamp(_) => ParamType::Timestamp,
            RowValues::JSON(_) => ParamType::Json,
            RowValues::Blob(_) => ParamType::Blob,
            RowValues::Null => ParamType::Null,
        }
    }
}

/// A parameter value plus its resolved wire type.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub value: RowValues,
    pub ty: ParamType,
}

impl BoundParam {
    pub fn new(value: RowValues) -> Self {
        let ty = ParamType::infer(&value);
        Self { value, ty }
    }

    pub fn with_type(value: RowValues, ty: ParamType) -> Self {
        Self { value, ty }
    }
}
