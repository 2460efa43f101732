#![forbid(unsafe_code)]

//! Errors returned by [`PropertyStream`](crate::PropertyStream) operations.
//!
//! Subscriber panics are not represented here: they unwind through the
//! write that triggered them.

use serde_json::Value;

/// Errors from stream operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A bulk update was given something other than a key/value mapping.
    InvalidArgument {
        /// What the operation accepts.
        expected: &'static str,
        /// JSON kind of the rejected argument.
        found: &'static str,
    },
    /// A strict update named a key the container does not hold.
    UnknownKey(String),
    /// A typed read targeted a key with no value.
    MissingKey(String),
    /// A value could not be converted to or from the requested type.
    TypeMismatch {
        /// Key whose value failed to convert.
        key: String,
        /// Message from the serde conversion.
        message: String,
    },
    /// A typed bulk update could not be turned into a JSON value.
    Serialize(String),
    /// A configuration source was malformed.
    Config(String),
}

impl StreamError {
    pub(crate) fn not_a_mapping(value: &Value) -> Self {
        Self::InvalidArgument {
            expected: "object",
            found: json_kind(value),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument { expected, found } => {
                write!(f, "invalid argument: expected {expected}, found {found}")
            }
            Self::UnknownKey(key) => write!(f, "unknown key '{key}'"),
            Self::MissingKey(key) => write!(f, "missing key '{key}'"),
            Self::TypeMismatch { key, message } => {
                write!(f, "type mismatch for '{key}': {message}")
            }
            Self::Serialize(msg) => write!(f, "serialization failed: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Short name of a JSON value's kind, used in error messages.
#[must_use]
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
