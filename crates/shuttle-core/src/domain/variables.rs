//! Typed process variables.
//!
//! The engine attaches variables to every external task with an explicit type
//! tag. They are modelled as a closed enum so handlers read them through
//! [`FromVariable`] instead of guessing from raw JSON.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Variables by name.
pub type Variables = HashMap<String, VariableValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum VariableValue {
    Null,
    String(String),
    Integer(i32),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// A serialized engine-side object (e.g. a Java class) we only carry around.
    Object {
        value: serde_json::Value,
        object_type_name: Option<String>,
        serialization_format: Option<String>,
    },
}

impl VariableValue {
    /// Engine type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::Null => "Null",
            VariableValue::String(_) => "String",
            VariableValue::Integer(_) => "Integer",
            VariableValue::Long(_) => "Long",
            VariableValue::Double(_) => "Double",
            VariableValue::Boolean(_) => "Boolean",
            VariableValue::Date(_) => "Date",
            VariableValue::Bytes(_) => "Bytes",
            VariableValue::Json(_) => "Json",
            VariableValue::Object { .. } => "Object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, VariableValue::Null)
    }

    /// Untyped JSON view, used to decode variables into a typed input struct.
    ///
    /// Dates become RFC 3339 strings and bytes become base64.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            VariableValue::Null => Value::Null,
            VariableValue::String(s) => Value::String(s.clone()),
            VariableValue::Integer(i) => Value::from(*i),
            VariableValue::Long(l) => Value::from(*l),
            VariableValue::Double(d) => Value::from(*d),
            VariableValue::Boolean(b) => Value::Bool(*b),
            VariableValue::Date(d) => {
                Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            VariableValue::Bytes(b) => Value::String(BASE64.encode(b)),
            VariableValue::Json(v) => v.clone(),
            VariableValue::Object { value, .. } => value.clone(),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::String(value)
    }
}

impl From<i32> for VariableValue {
    fn from(value: i32) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Long(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Double(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for VariableValue {
    fn from(value: DateTime<Utc>) -> Self {
        VariableValue::Date(value)
    }
}

impl From<Vec<u8>> for VariableValue {
    fn from(value: Vec<u8>) -> Self {
        VariableValue::Bytes(value)
    }
}

impl From<serde_json::Value> for VariableValue {
    fn from(value: serde_json::Value) -> Self {
        VariableValue::Json(value)
    }
}

/// Build a variable map from `(name, value)` pairs.
pub fn variables<I, K, V>(pairs: I) -> Variables
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<VariableValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// JSON object of all variables, keyed by name.
pub fn variables_to_json(vars: &Variables) -> serde_json::Value {
    let map = vars
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect::<serde_json::Map<_, _>>();
    serde_json::Value::Object(map)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VariableError {
    #[error("variable '{0}' is missing")]
    Missing(String),

    #[error("variable '{name}' has type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("variables do not match the expected input: {0}")]
    Decode(String),
}

/// Conversion from a typed variable into a Rust value.
pub trait FromVariable: Sized {
    /// Type name shown in mismatch errors.
    const EXPECTED: &'static str;

    fn from_variable(value: &VariableValue) -> Option<Self>;
}

impl FromVariable for String {
    const EXPECTED: &'static str = "String";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromVariable for i64 {
    const EXPECTED: &'static str = "Long";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Integer(i) => Some(i64::from(*i)),
            VariableValue::Long(l) => Some(*l),
            _ => None,
        }
    }
}

impl FromVariable for i32 {
    const EXPECTED: &'static str = "Integer";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Integer(i) => Some(*i),
            VariableValue::Long(l) => i32::try_from(*l).ok(),
            _ => None,
        }
    }
}

impl FromVariable for f64 {
    const EXPECTED: &'static str = "Double";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Double(d) => Some(*d),
            VariableValue::Integer(i) => Some(f64::from(*i)),
            VariableValue::Long(l) => Some(*l as f64),
            _ => None,
        }
    }
}

impl FromVariable for bool {
    const EXPECTED: &'static str = "Boolean";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromVariable for DateTime<Utc> {
    const EXPECTED: &'static str = "Date";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromVariable for Vec<u8> {
    const EXPECTED: &'static str = "Bytes";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromVariable for serde_json::Value {
    const EXPECTED: &'static str = "Json";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Json(v) => Some(v.clone()),
            VariableValue::Object { value, .. } => Some(value.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(VariableValue::Integer(7), Some(7.0))]
    #[case(VariableValue::Long(7), Some(7.0))]
    #[case(VariableValue::Double(7.5), Some(7.5))]
    #[case(VariableValue::String("7".into()), None)]
    fn numbers_widen_to_double(#[case] value: VariableValue, #[case] expected: Option<f64>) {
        assert_eq!(f64::from_variable(&value), expected);
    }

    #[test]
    fn long_out_of_range_is_not_an_integer() {
        assert_eq!(i32::from_variable(&VariableValue::Long(i64::MAX)), None);
        assert_eq!(i32::from_variable(&VariableValue::Long(12)), Some(12));
    }

    #[test]
    fn json_view_flattens_dates_and_bytes() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let vars = variables([
            ("when", VariableValue::from(at)),
            ("blob", VariableValue::from(vec![1u8, 2, 3])),
            ("amount", VariableValue::from(12.5)),
        ]);

        let json = variables_to_json(&vars);
        assert_eq!(json["when"], "2024-01-01T12:00:00.000Z");
        assert_eq!(json["blob"], "AQID");
        assert_eq!(json["amount"], 12.5);
    }

    #[test]
    fn type_names_match_engine_tags() {
        assert_eq!(VariableValue::from("x").type_name(), "String");
        assert_eq!(VariableValue::from(true).type_name(), "Boolean");
        assert_eq!(VariableValue::Null.type_name(), "Null");
    }
}
