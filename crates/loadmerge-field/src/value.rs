//! Distinguishing field values and the `$in` condition built from them.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Name of the set-membership operator in merged runner arguments.
pub const IN_OPERATOR: &str = "$in";

/// A value of the distinguishing field: a string or a JSON number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(FieldNumber),
    Str(String),
}

/// A JSON number that compares and hashes by numeric value.
///
/// `1000`, `1000.0` and `1e3` are the same field value; the number itself is
/// kept as written and is what goes into the `$in` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Number", into = "Number")]
pub struct FieldNumber {
    number: Number,
    key: String,
}

impl FieldNumber {
    pub fn as_number(&self) -> &Number {
        &self.number
    }
}

/// Integral values print as integers, whatever their JSON spelling.
fn number_key(number: &Number) -> String {
    if let Some(n) = number.as_i64() {
        return n.to_string();
    }
    if let Some(n) = number.as_u64() {
        return n.to_string();
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => number.to_string(),
    }
}

impl From<Number> for FieldNumber {
    fn from(number: Number) -> Self {
        let key = number_key(&number);
        Self { number, key }
    }
}

impl From<FieldNumber> for Number {
    fn from(n: FieldNumber) -> Self {
        n.number
    }
}

impl PartialEq for FieldNumber {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FieldNumber {}

impl Hash for FieldNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Display for FieldNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number)
    }
}

impl FieldValue {
    /// Read a field value from JSON. Only numbers and strings are field
    /// values.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n.clone().into())),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => Value::Number(n.number.clone()),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Number(Number::from(n).into())
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        Self::Number(Number::from(n).into())
    }
}

impl From<Number> for FieldValue {
    fn from(n: Number) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Typed form of the merged condition, `{ "$in": [...] }`.
///
/// Use it as the field's type in a runner argument struct:
///
/// ```rust
/// use loadmerge_field::FieldIn;
///
/// #[derive(serde::Deserialize)]
/// struct UserQuery {
///     id: FieldIn,
///     deleted_at: Option<u64>,
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIn {
    #[serde(rename = "$in")]
    pub values: Vec<FieldValue>,
}

impl FieldIn {
    pub fn contains(&self, value: &FieldValue) -> bool {
        self.values.contains(value)
    }
}

/// Result items that expose the distinguishing field, so each item can be
/// routed back to the requests that asked for its value.
pub trait FieldSource {
    fn field_value(&self, field: &str) -> Option<FieldValue>;
}

impl FieldSource for Value {
    fn field_value(&self, field: &str) -> Option<FieldValue> {
        self.get(field).and_then(FieldValue::from_json)
    }
}

impl FieldSource for Map<String, Value> {
    fn field_value(&self, field: &str) -> Option<FieldValue> {
        self.get(field).and_then(FieldValue::from_json)
    }
}

/// JSON type name, for error messages.
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
