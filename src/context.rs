use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::Serialize;

/// Evaluation context describing who the flags are being resolved for.
///
/// The targeting key is mandatory for any operation that touches the resolution cache; contexts
/// without one are rejected with [`Error::TargetingKeyMissing`](crate::Error::TargetingKeyMissing).
///
/// # Examples
/// ```
/// # use beacon_core::EvaluationContext;
/// let context = EvaluationContext::new("user-42")
///     .with_attribute("age", 30)
///     .with_attribute("is_premium_member", true)
///     .with_attribute("username", "john_doe");
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    targeting_key: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, ContextValue>,
}

impl EvaluationContext {
    /// Create a context for the given targeting key.
    pub fn new(targeting_key: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            targeting_key: Some(targeting_key.into()),
            attributes: BTreeMap::new(),
        }
    }

    /// Create a context without a targeting key.
    ///
    /// Such a context can be serialized into a resolve request but is rejected by the resolution
    /// cache.
    pub fn anonymous() -> EvaluationContext {
        EvaluationContext::default()
    }

    /// Add an attribute, replacing any previous value under the same key.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<ContextValue>,
    ) -> EvaluationContext {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The targeting key, if the context carries one.
    pub fn targeting_key(&self) -> Option<&str> {
        self.targeting_key.as_deref()
    }

    /// Context attributes, sorted by key.
    pub fn attributes(&self) -> &BTreeMap<String, ContextValue> {
        &self.attributes
    }
}

/// Enum representing possible values of an evaluation context attribute.
///
/// Conveniently implements `From` conversions for primitive types:
/// ```
/// # use beacon_core::ContextValue;
/// let string_attr: ContextValue = "example".into();
/// let int_attr: ContextValue = 42.into();
/// let bool_attr: ContextValue = true.into();
/// ```
#[derive(Debug, Clone, PartialEq, From, Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Double(f64),
    /// A string value.
    String(String),
    /// A point in time. Serialized in the fixed wire encoding (RFC 3339, milliseconds, UTC).
    Timestamp(#[serde(with = "crate::timestamp")] DateTime<Utc>),
    /// An ordered list of values.
    List(Vec<ContextValue>),
    /// A nested structure, keyed by field name.
    Struct(BTreeMap<String, ContextValue>),
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}
