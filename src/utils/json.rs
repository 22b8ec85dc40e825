use serde_json::Value;

/// A PATCH field that may be absent, explicitly `null`, or a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

impl NullableValue {
    /// Changeset form: `None` leaves the column alone, `Some(None)` clears it.
    pub fn into_change(self) -> Option<Option<String>> {
        match self {
            NullableValue::Omitted => None,
            NullableValue::Null => Some(None),
            NullableValue::String(value) => Some(Some(value)),
        }
    }
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

/// A PATCH field that may be absent but never `null`.
pub fn optional_field<T: serde::de::DeserializeOwned>(
    body: &Value,
    key: &str,
) -> Result<Option<T>, String> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Null) => Err(format!("{key} must not be null")),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| format!("invalid {key}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn distinguishes_missing_null_and_value() {
        let body = json!({"description": null, "name": "Quote"});
        assert_eq!(
            classify_nullable(body.get("description")).unwrap(),
            NullableValue::Null
        );
        assert_eq!(
            classify_nullable(body.get("missing")).unwrap().into_change(),
            None
        );
        assert_eq!(
            classify_nullable(body.get("name")).unwrap().into_change(),
            Some(Some("Quote".to_string()))
        );
        assert!(classify_nullable(Some(&json!(3))).is_err());
    }

    #[test]
    fn optional_fields_reject_null() {
        let body = json!({"is_active": false, "content": null});
        assert_eq!(optional_field::<bool>(&body, "is_active"), Ok(Some(false)));
        assert_eq!(optional_field::<bool>(&body, "absent"), Ok(None));
        assert!(optional_field::<String>(&body, "content").is_err());
    }
}
