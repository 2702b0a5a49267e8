//! Datatypes and scalar values.
//!
//! Every sub-expression the compiler touches has exactly one [`Datatype`].
//! [`StorageType`] is what a selectable reports for its columns;
//! [`Value`] is the scalar type that flows through filters, lookups,
//! formatters, and result rows.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// The closed set of expression datatypes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Str,
    Num,
    Bool,
    Date,
    Datetime,
    /// Recognized storage type that expressions can not use.
    Unusable,
}

impl Datatype {
    /// The name this datatype carries in grammar rules and diagnostics.
    /// Diagnostics say "string" and "boolean" where rule prefixes say
    /// "str" and "bool".
    pub fn grammar_name(&self) -> &'static str {
        match self {
            Datatype::Str => "string",
            Datatype::Num => "num",
            Datatype::Bool => "boolean",
            Datatype::Date => "date",
            Datatype::Datetime => "datetime",
            Datatype::Unusable => "unusable",
        }
    }
}

/// Storage types a selectable can report for its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Text,
    Varchar,
    Char,
    Integer,
    Smallint,
    Bigint,
    Decimal,
    Float,
    Double,
    Boolean,
    Date,
    Timestamp,
    Json,
    Blob,
}

impl StorageType {
    /// Map a storage type to its expression datatype.
    pub fn datatype(&self) -> Datatype {
        match self {
            StorageType::Text | StorageType::Varchar | StorageType::Char => Datatype::Str,
            StorageType::Integer
            | StorageType::Smallint
            | StorageType::Bigint
            | StorageType::Decimal
            | StorageType::Float
            | StorageType::Double => Datatype::Num,
            StorageType::Boolean => Datatype::Bool,
            StorageType::Date => Datatype::Date,
            StorageType::Timestamp => Datatype::Datetime,
            StorageType::Json | StorageType::Blob => Datatype::Unusable,
        }
    }
}

/// A scalar value: literals in expressions, filter operands, lookup
/// keys, formatter inputs, and result cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
}

impl Value {
    pub fn datatype(&self) -> Option<Datatype> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(Datatype::Bool),
            Value::Num(_) => Some(Datatype::Num),
            Value::Str(_) => Some(Datatype::Str),
            Value::Date(_) => Some(Datatype::Date),
            Value::Datetime(_) => Some(Datatype::Datetime),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a JSON scalar into a value. Arrays and objects have no
    /// scalar meaning and map to `None`.
    pub fn from_json(v: &serde_json::Value) -> Option<Value> {
        match v {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Num),
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Render as a SQL literal.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Num(n) => format_num(*n),
            Value::Str(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
            Value::Datetime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Integral floats render without a trailing `.0` so generated SQL is
/// stable across literal sources (`5`, `5.0`).
fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{}", format_num(*n)),
            Value::Str(s) => write!(f, "{s}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Datetime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::Datetime(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_mapping() {
        assert_eq!(StorageType::Varchar.datatype(), Datatype::Str);
        assert_eq!(StorageType::Decimal.datatype(), Datatype::Num);
        assert_eq!(StorageType::Boolean.datatype(), Datatype::Bool);
        assert_eq!(StorageType::Date.datatype(), Datatype::Date);
        assert_eq!(StorageType::Timestamp.datatype(), Datatype::Datetime);
        assert_eq!(StorageType::Json.datatype(), Datatype::Unusable);
    }

    #[test]
    fn test_datatype_display_is_rule_prefix() {
        assert_eq!(Datatype::Str.to_string(), "str");
        assert_eq!(Datatype::Datetime.to_string(), "datetime");
    }

    #[test]
    fn test_grammar_names() {
        assert_eq!(Datatype::Str.grammar_name(), "string");
        assert_eq!(Datatype::Bool.grammar_name(), "boolean");
        assert_eq!(Datatype::Num.grammar_name(), "num");
    }

    #[test]
    fn test_sql_literals() {
        assert_eq!(Value::Str("O'Neil".into()).to_sql_literal(), "'O''Neil'");
        assert_eq!(Value::Num(5.0).to_sql_literal(), "5");
        assert_eq!(Value::Num(2.5).to_sql_literal(), "2.5");
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
        let d = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        assert_eq!(Value::Date(d).to_sql_literal(), "'2020-01-02'");
    }

    #[test]
    fn test_from_json_scalars_only() {
        assert_eq!(
            Value::from_json(&serde_json::json!("x")),
            Some(Value::Str("x".into()))
        );
        assert_eq!(Value::from_json(&serde_json::json!(2)), Some(Value::Num(2.0)));
        assert_eq!(Value::from_json(&serde_json::json!([1, 2])), None);
    }
}
