use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat name -> value map shared by supplied, CRM-resolved and computed variables.
pub type VariableMap = BTreeMap<String, VariableValue>;

const DATE_FORMAT: &str = "%B %-d, %Y";
const MAX_FRACTION_DIGITS: usize = 3;

/// A single template variable value.
///
/// Values arrive as JSON (request bodies, CRM responses, the `documents.variables`
/// column) and are converted into this union so formatting is exhaustive.
/// Objects and arrays are kept as raw JSON and rendered as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum VariableValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
    Json(Value),
}

impl VariableValue {
    /// Text substituted into the template for this value.
    pub fn display(&self) -> String {
        match self {
            VariableValue::Null => String::new(),
            VariableValue::Bool(true) => "yes".to_string(),
            VariableValue::Bool(false) => "no".to_string(),
            VariableValue::Number(number) => format_number(*number),
            VariableValue::Text(text) => text.clone(),
            VariableValue::Date(date) => date.format(DATE_FORMAT).to_string(),
            VariableValue::Json(value) => value.to_string(),
        }
    }

    /// True for values a CRM lookup should treat as missing.
    pub fn is_blank(&self) -> bool {
        match self {
            VariableValue::Null => true,
            VariableValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }
}

impl From<Value> for VariableValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => VariableValue::Null,
            Value::Bool(flag) => VariableValue::Bool(flag),
            Value::Number(number) => number
                .as_f64()
                .map(VariableValue::Number)
                .unwrap_or(VariableValue::Json(Value::Number(number))),
            Value::String(text) => VariableValue::Text(text),
            other => VariableValue::Json(other),
        }
    }
}

impl From<VariableValue> for Value {
    fn from(value: VariableValue) -> Self {
        match value {
            VariableValue::Null => Value::Null,
            VariableValue::Bool(flag) => Value::Bool(flag),
            VariableValue::Number(number) => serde_json::Number::from_f64(number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            VariableValue::Text(text) => Value::String(text),
            VariableValue::Date(date) => Value::String(date.to_rfc3339()),
            VariableValue::Json(raw) => raw,
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Text(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Text(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Number(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Number(value as f64)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for VariableValue {
    fn from(value: DateTime<Utc>) -> Self {
        VariableValue::Date(value)
    }
}

/// Converts a JSON object into a variable map. Non-object input yields an empty map.
pub fn map_from_json(value: &Value) -> VariableMap {
    match value {
        Value::Object(entries) => entries
            .iter()
            .map(|(key, value)| (key.clone(), VariableValue::from(value.clone())))
            .collect(),
        _ => VariableMap::new(),
    }
}

pub fn map_to_json(map: &VariableMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), Value::from(value.clone())))
            .collect(),
    )
}

/// en-US style number: thousands separators, at most three fraction digits.
fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "∞" } else { "-∞" }.to_string();
    }

    let fixed = format!("{:.*}", MAX_FRACTION_DIGITS, number.abs());
    let (integer, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let fraction = fraction.trim_end_matches('0');
    let negative = number < 0.0 && (integer != "0" || !fraction.is_empty());

    let mut out = String::with_capacity(fixed.len() + fixed.len() / 3 + 1);
    if negative {
        out.push('-');
    }
    out.push_str(&group_thousands(integer));
    if !fraction.is_empty() {
        out.push('.');
        out.push_str(fraction);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (len - index) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
