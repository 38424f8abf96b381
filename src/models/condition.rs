// Condition domain models - boolean expression trees gating transitions

//! # Condition Models
//!
//! A `Condition` is one node of a boolean expression tree:
//! - **Logical** conditions compare up to three typed operands
//! - **Composition** conditions combine child conditions (linked through
//!   `parent_condition_id`) with And / Or / Xor
//!
//! Operands are stored as loosely typed JSON and parsed into a [`TypedValue`]
//! according to their declared [`DataType`] right before evaluation. Parsing
//! never guesses silently: malformed input becomes a [`ParseError`].
//!
//! ## Rust Learning Notes:
//!
//! ### `serde(from = ..., into = ...)`
//! `LogicalOperator` round-trips through a plain `String`. Unknown operator
//! names land in the `Unsupported` variant instead of failing to
//! deserialize, so the evaluator can report them as unsupported operations.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;
use uuid::Uuid;

/// Declared type of an operand, action parameter or context parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Text,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Phonenumber,
    Location,
    Date,
    DateTime,
}

/// Where an operand or parameter gets its value when no literal is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSource {
    /// The literal `value` field
    Literal,
    /// The schema instance's almanac, looked up by `key`
    Almanac,
    /// The triggering event's context (message fields and payload)
    Event,
}

impl Default for ValueSource {
    fn default() -> Self {
        ValueSource::Literal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorType {
    Logical,
    Mathematical,
    Composition,
    Iterate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Between,
    In,
    IsTrue,
    IsFalse,
    Contains,
    DoesNotContain,
    Exists,
    HasConsecutiveOccurrences,
    RangesOverlap,
    None,
    /// Operator name not known to this engine
    Unsupported(String),
}

impl Default for LogicalOperator {
    fn default() -> Self {
        LogicalOperator::None
    }
}

impl From<String> for LogicalOperator {
    fn from(name: String) -> Self {
        match name.as_str() {
            "Equal" => LogicalOperator::Equal,
            "NotEqual" => LogicalOperator::NotEqual,
            "GreaterThan" => LogicalOperator::GreaterThan,
            "GreaterThanOrEqual" => LogicalOperator::GreaterThanOrEqual,
            "LessThan" => LogicalOperator::LessThan,
            "LessThanOrEqual" => LogicalOperator::LessThanOrEqual,
            "Between" => LogicalOperator::Between,
            "In" => LogicalOperator::In,
            "IsTrue" => LogicalOperator::IsTrue,
            "IsFalse" => LogicalOperator::IsFalse,
            "Contains" => LogicalOperator::Contains,
            "DoesNotContain" => LogicalOperator::DoesNotContain,
            "Exists" => LogicalOperator::Exists,
            "HasConsecutiveOccurrences" => LogicalOperator::HasConsecutiveOccurrences,
            "RangesOverlap" => LogicalOperator::RangesOverlap,
            "None" => LogicalOperator::None,
            _ => LogicalOperator::Unsupported(name),
        }
    }
}

impl From<LogicalOperator> for String {
    fn from(op: LogicalOperator) -> Self {
        match op {
            LogicalOperator::Unsupported(name) => name,
            other => format!("{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionOperator {
    And,
    Or,
    Xor,
    None,
}

impl Default for CompositionOperator {
    fn default() -> Self {
        CompositionOperator::None
    }
}

/// One operand of a logical condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub data_type: DataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Literal value; empty means "resolve from `source`"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default)]
    pub source: ValueSource,

    /// Lookup key for almanac or event sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Operand {
    pub fn literal(data_type: DataType, value: Value) -> Self {
        Self {
            data_type,
            name: None,
            value: Some(value),
            source: ValueSource::Literal,
            key: None,
        }
    }

    pub fn almanac<K: Into<String>>(data_type: DataType, key: K) -> Self {
        Self {
            data_type,
            name: None,
            value: None,
            source: ValueSource::Almanac,
            key: Some(key.into()),
        }
    }

    pub fn event<K: Into<String>>(data_type: DataType, key: K) -> Self {
        Self {
            data_type,
            name: None,
            value: None,
            source: ValueSource::Event,
            key: Some(key.into()),
        }
    }

    /// Operand whose value is expected to come from the evaluation argument
    pub fn named<N: Into<String>>(name: N, data_type: DataType) -> Self {
        Self {
            data_type,
            name: Some(name.into()),
            value: None,
            source: ValueSource::Literal,
            key: None,
        }
    }

    /// True when the literal value is absent, null or an empty string
    pub fn has_empty_value(&self) -> bool {
        match &self.value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        }
    }

    /// Key used for almanac/event lookups, falling back to the operand name
    pub fn lookup_key(&self) -> Option<&str> {
        self.key.as_deref().or(self.name.as_deref())
    }
}

/// A node of a condition tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub operator_type: OperatorType,

    #[serde(default)]
    pub logical_operator: LogicalOperator,

    #[serde(default)]
    pub composition_operator: CompositionOperator,

    #[serde(default)]
    pub first_operand: Option<Operand>,

    #[serde(default)]
    pub second_operand: Option<Operand>,

    #[serde(default)]
    pub third_operand: Option<Operand>,

    /// Composite parent, if this condition is a child
    #[serde(default)]
    pub parent_condition_id: Option<Uuid>,

    /// Ordering among siblings
    #[serde(default)]
    pub sequence: u32,

    pub created_at: DateTime<Utc>,
}

impl Condition {
    pub fn logical(operator: LogicalOperator, first: Operand, second: Option<Operand>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            operator_type: OperatorType::Logical,
            logical_operator: operator,
            composition_operator: CompositionOperator::None,
            first_operand: Some(first),
            second_operand: second,
            third_operand: None,
            parent_condition_id: None,
            sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn composition(operator: CompositionOperator) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            operator_type: OperatorType::Composition,
            logical_operator: LogicalOperator::None,
            composition_operator: operator,
            first_operand: None,
            second_operand: None,
            third_operand: None,
            parent_condition_id: None,
            sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_third(mut self, third: Operand) -> Self {
        self.third_operand = Some(third);
        self
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn child_of(mut self, parent_id: Uuid, sequence: u32) -> Self {
        self.parent_condition_id = Some(parent_id);
        self.sequence = sequence;
        self
    }
}

/// Errors produced while parsing raw operand values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("cannot read {found} as {expected:?}")]
    TypeMismatch { expected: DataType, found: String },

    #[error("invalid {expected:?} literal '{raw}'")]
    InvalidLiteral { expected: DataType, raw: String },
}

/// Operand value after parsing against its declared data type
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Array(Vec<Value>),
    Object(serde_json::Map<String, Value>),
    DateTime(DateTime<Utc>),
}

impl TypedValue {
    /// Parse a raw JSON value according to `data_type`
    pub fn parse(data_type: DataType, raw: &Value) -> Result<TypedValue, ParseError> {
        if raw.is_null() {
            return Ok(TypedValue::Null);
        }

        let mismatch = || ParseError::TypeMismatch {
            expected: data_type,
            found: describe(raw),
        };
        let invalid = |s: &str| ParseError::InvalidLiteral {
            expected: data_type,
            raw: s.to_string(),
        };

        match data_type {
            DataType::Text | DataType::Phonenumber => match raw {
                Value::String(s) => Ok(TypedValue::Text(s.clone())),
                Value::Number(n) => Ok(TypedValue::Text(n.to_string())),
                Value::Bool(b) => Ok(TypedValue::Text(b.to_string())),
                _ => Err(mismatch()),
            },
            DataType::Integer => match raw {
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => Ok(TypedValue::Integer(i)),
                    (None, Some(f)) if f.fract() == 0.0 => Ok(TypedValue::Integer(f as i64)),
                    _ => Err(invalid(&n.to_string())),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(TypedValue::Integer)
                    .map_err(|_| invalid(s)),
                _ => Err(mismatch()),
            },
            DataType::Float => match raw {
                Value::Number(n) => n
                    .as_f64()
                    .map(TypedValue::Float)
                    .ok_or_else(|| invalid(&n.to_string())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(TypedValue::Float)
                    .map_err(|_| invalid(s)),
                _ => Err(mismatch()),
            },
            DataType::Boolean => match raw {
                Value::Bool(b) => Ok(TypedValue::Boolean(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(TypedValue::Boolean(true)),
                    "false" | "0" => Ok(TypedValue::Boolean(false)),
                    _ => Err(invalid(s)),
                },
                Value::Number(n) => match n.as_i64() {
                    Some(1) => Ok(TypedValue::Boolean(true)),
                    Some(0) => Ok(TypedValue::Boolean(false)),
                    _ => Err(invalid(&n.to_string())),
                },
                _ => Err(mismatch()),
            },
            DataType::Array => match raw {
                Value::Array(items) => Ok(TypedValue::Array(items.clone())),
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.starts_with('[') {
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(Value::Array(items)) => Ok(TypedValue::Array(items)),
                            _ => Err(invalid(s)),
                        }
                    } else if trimmed.is_empty() {
                        Ok(TypedValue::Array(Vec::new()))
                    } else {
                        Ok(TypedValue::Array(
                            trimmed
                                .split(',')
                                .map(|part| Value::String(part.trim().to_string()))
                                .collect(),
                        ))
                    }
                }
                _ => Err(mismatch()),
            },
            DataType::Object | DataType::Location => match raw {
                Value::Object(map) => Ok(TypedValue::Object(map.clone())),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Object(map)) => Ok(TypedValue::Object(map)),
                    _ => Err(invalid(s)),
                },
                _ => Err(mismatch()),
            },
            DataType::Date | DataType::DateTime => match raw {
                Value::String(s) => parse_datetime(s)
                    .map(TypedValue::DateTime)
                    .ok_or_else(|| invalid(s)),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .map(TypedValue::DateTime)
                    .ok_or_else(|| invalid(&n.to_string())),
                _ => Err(mismatch()),
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// Loose JavaScript-style truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            TypedValue::Null => false,
            TypedValue::Text(s) => !s.is_empty(),
            TypedValue::Integer(i) => *i != 0,
            TypedValue::Float(f) => *f != 0.0 && !f.is_nan(),
            TypedValue::Boolean(b) => *b,
            TypedValue::Array(_) | TypedValue::Object(_) | TypedValue::DateTime(_) => true,
        }
    }

    /// Ordering used by the comparison operators.
    /// Integers and floats compare by value; anything else must share a variant.
    pub fn compare(&self, other: &TypedValue) -> Option<Ordering> {
        match (self, other) {
            (TypedValue::Integer(a), TypedValue::Integer(b)) => Some(a.cmp(b)),
            (TypedValue::Text(a), TypedValue::Text(b)) => Some(a.cmp(b)),
            (TypedValue::Boolean(a), TypedValue::Boolean(b)) => Some(a.cmp(b)),
            (TypedValue::DateTime(a), TypedValue::DateTime(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Integer(i) => Some(*i as f64),
            TypedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            TypedValue::Null => Value::Null,
            TypedValue::Text(s) => Value::String(s.clone()),
            TypedValue::Integer(i) => Value::from(*i),
            TypedValue::Float(f) => Value::from(*f),
            TypedValue::Boolean(b) => Value::Bool(*b),
            TypedValue::Array(items) => Value::Array(items.clone()),
            TypedValue::Object(map) => Value::Object(map.clone()),
            TypedValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
        }
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (midnight UTC)
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Element equality used for membership checks: numbers by value
/// (numeric strings included), text case-insensitively.
pub fn loose_json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => match (json_number(a), json_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_numbers_from_strings() {
        assert_eq!(
            TypedValue::parse(DataType::Integer, &json!(" 42 ")),
            Ok(TypedValue::Integer(42))
        );
        assert_eq!(
            TypedValue::parse(DataType::Float, &json!("2.5")),
            Ok(TypedValue::Float(2.5))
        );
        assert!(matches!(
            TypedValue::parse(DataType::Integer, &json!("forty")),
            Err(ParseError::InvalidLiteral { .. })
        ));
    }

    #[test]
    fn test_parse_boolean_and_array() {
        assert_eq!(
            TypedValue::parse(DataType::Boolean, &json!("TRUE")),
            Ok(TypedValue::Boolean(true))
        );
        assert_eq!(
            TypedValue::parse(DataType::Array, &json!("a, b")),
            Ok(TypedValue::Array(vec![json!("a"), json!("b")]))
        );
        assert_eq!(
            TypedValue::parse(DataType::Array, &json!("[1,2]")),
            Ok(TypedValue::Array(vec![json!(1), json!(2)]))
        );
        assert!(matches!(
            TypedValue::parse(DataType::Boolean, &json!({"a": 1})),
            Err(ParseError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_dates() {
        let date = TypedValue::parse(DataType::Date, &json!("2024-03-01")).unwrap();
        let stamp = TypedValue::parse(DataType::DateTime, &json!("2024-03-01T12:00:00Z")).unwrap();
        assert_eq!(date.compare(&stamp), Some(Ordering::Less));
    }

    #[test]
    fn test_mixed_numeric_ordering() {
        let a = TypedValue::Integer(3);
        let b = TypedValue::Float(3.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&TypedValue::Text("3".into())), None);
    }

    #[test]
    fn test_unknown_operator_round_trip() {
        let op: LogicalOperator = serde_json::from_value(json!("Matches")).unwrap();
        assert_eq!(op, LogicalOperator::Unsupported("Matches".to_string()));
        assert_eq!(serde_json::to_value(&op).unwrap(), json!("Matches"));
        assert_eq!(
            serde_json::to_value(LogicalOperator::GreaterThan).unwrap(),
            json!("GreaterThan")
        );
    }

    #[test]
    fn test_loose_equality() {
        assert!(loose_json_eq(&json!("YES"), &json!("yes")));
        assert!(loose_json_eq(&json!(2), &json!("2")));
        assert!(!loose_json_eq(&json!(true), &json!("true")));
    }
}
