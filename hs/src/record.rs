//! Record trait and query filters

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A persistable record
///
/// Implementors are serialized to JSON as a whole; `indexed_fields` lists the
/// values that can be used in [`Filter`]s.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last modification time (unix ms)
    fn updated_at(&self) -> i64;

    /// Collection (table namespace) this record type lives in
    fn collection_name() -> &'static str;

    /// Fields to index for filtered queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Value of an indexed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A condition on one indexed field
///
/// Only records that carry the field can match, whatever the operator.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Shorthand for an equality filter
    pub fn eq(field: &str, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Shorthand for an inequality filter
    pub fn ne(field: &str, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }
}
