//! Alert events and their normalization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::config::AlertConfig;

const DEFAULT_VERB: &str = "raised";
const UNKNOWN: &str = "unknown";

/// An alert: a flat JSON object.
///
/// Well-known fields are `category`, `severity`, `msg`, `host`, `time` (epoch
/// seconds) and `verb`. All other fields are passed through to templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Alert {
    fields: Map<String, Value>,
}

impl Alert {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(crate::Error::validation(format!(
                "alert must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String value of a field; numbers and booleans are stringified.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Routing key: `category/severity`, each defaulting to `unknown`.
    pub fn condition(&self) -> String {
        format!(
            "{}/{}",
            self.get_str("category").unwrap_or_else(|| UNKNOWN.to_string()),
            self.get_str("severity").unwrap_or_else(|| UNKNOWN.to_string())
        )
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Prepares raw alerts for rendering.
#[derive(Debug, Clone)]
pub struct AlertNormalizer {
    time_format: String,
    timezone: Tz,
    verbs: BTreeMap<String, String>,
}

impl AlertNormalizer {
    pub fn new(time_format: impl Into<String>, timezone: Tz, verbs: BTreeMap<String, String>) -> Self {
        let mut merged = default_verbs();
        merged.extend(verbs.into_iter().filter(|(_, v)| !v.is_empty()));
        Self {
            time_format: time_format.into(),
            timezone,
            verbs: merged,
        }
    }

    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        Ok(Self::new(
            config.time.format.clone(),
            config.timezone()?,
            config.verbs.clone(),
        ))
    }

    /// Normalize `alert` in place:
    /// - `severity` is lowercased and an uppercase `SEVERITY` is added
    /// - `time` (epoch seconds, default now) is formatted in the configured timezone
    /// - `verb` (default `raised`) is replaced by its display name
    pub fn normalize(&self, alert: &mut Alert, now: DateTime<Utc>) {
        if let Some(severity) = alert.get_str("severity") {
            alert.set("severity", severity.to_lowercase());
            alert.set("SEVERITY", severity.to_uppercase());
        }

        let when = alert
            .get("time")
            .and_then(Value::as_f64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp_millis((secs * 1000.0) as i64))
            .unwrap_or(now);
        let local = when.with_timezone(&self.timezone);
        alert.set("time", local.format(&self.time_format).to_string());

        let verb = alert
            .get_str("verb")
            .unwrap_or_else(|| DEFAULT_VERB.to_string());
        let display = self.verbs.get(&verb).cloned().unwrap_or(verb);
        alert.set("verb", display);
    }
}

fn default_verbs() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("raised".to_string(), "occurred".to_string()),
        ("cleared".to_string(), "resolved".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> AlertNormalizer {
        AlertNormalizer::new("%Y-%m-%d %H:%M %Z", chrono_tz::UTC, BTreeMap::new())
    }

    fn alert(value: Value) -> Alert {
        Alert::from_value(value).unwrap()
    }

    #[test]
    fn test_condition_defaults() {
        assert_eq!(alert(json!({})).condition(), "unknown/unknown");
        assert_eq!(
            alert(json!({"category": "disk", "severity": "error"})).condition(),
            "disk/error"
        );
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(matches!(
            Alert::from_value(json!([1, 2])),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn test_severity_casing() {
        let mut a = alert(json!({"severity": "Critical", "time": 0}));
        normalizer().normalize(&mut a, Utc::now());
        assert_eq!(a.get_str("severity").as_deref(), Some("critical"));
        assert_eq!(a.get_str("SEVERITY").as_deref(), Some("CRITICAL"));
    }

    #[test]
    fn test_time_in_timezone() {
        let n = AlertNormalizer::new("%Y-%m-%d %H:%M %Z", chrono_tz::Asia::Tokyo, BTreeMap::new());
        let mut a = alert(json!({"time": 1_700_000_000}));
        n.normalize(&mut a, Utc::now());
        assert_eq!(a.get_str("time").as_deref(), Some("2023-11-15 07:13 JST"));
    }

    #[test]
    fn test_missing_time_uses_now() {
        let now = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let mut a = alert(json!({}));
        normalizer().normalize(&mut a, now);
        assert_eq!(a.get_str("time").as_deref(), Some("1970-01-01 00:00 UTC"));
    }

    #[test]
    fn test_verbs() {
        let verbs = BTreeMap::from([("cleared".to_string(), "fixed".to_string())]);
        let n = AlertNormalizer::new("%s", chrono_tz::UTC, verbs);

        let mut a = alert(json!({}));
        n.normalize(&mut a, Utc::now());
        assert_eq!(a.get_str("verb").as_deref(), Some("occurred"));

        let mut a = alert(json!({"verb": "cleared"}));
        n.normalize(&mut a, Utc::now());
        assert_eq!(a.get_str("verb").as_deref(), Some("fixed"));

        let mut a = alert(json!({"verb": "escalated"}));
        n.normalize(&mut a, Utc::now());
        assert_eq!(a.get_str("verb").as_deref(), Some("escalated"));
    }
}
