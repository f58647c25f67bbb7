//! `$var` / `${var}` message templates.
//!
//! Substitution is "safe": placeholders without a value are left in the
//! output untouched, and `$$` renders a literal `$`.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::alert::Alert;
use crate::transport::OutboundMessage;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(\$)|([_A-Za-z][_A-Za-z0-9]*)|\{([_A-Za-z][_A-Za-z0-9]*)\})")
        .expect("placeholder regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn safe_substitute(&self, vars: &Map<String, Value>) -> String {
        PLACEHOLDER
            .replace_all(&self.source, |caps: &Captures<'_>| {
                if caps.get(1).is_some() {
                    return "$".to_string();
                }
                let name = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
                match vars.get(name) {
                    Some(value) => render_value(value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turns an alert into the message one channel sends.
#[derive(Debug, Clone)]
pub struct MessageRenderer {
    subject: Option<Template>,
    body: Template,
}

impl MessageRenderer {
    pub fn new(body: Template) -> Self {
        Self {
            subject: None,
            body,
        }
    }

    pub fn with_subject(mut self, subject: Template) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn render(&self, alert: &Alert) -> OutboundMessage {
        let vars = alert.fields();
        OutboundMessage {
            subject: self.subject.as_ref().map(|t| t.safe_substitute(vars)),
            body: self.body.safe_substitute(vars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        match json!({"host": "web1", "msg": "disk full", "count": 3, "gone": null}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[rstest]
    #[case("$host: $msg", "web1: disk full")]
    #[case("${host}s", "web1s")]
    #[case("cost $$5", "cost $5")]
    #[case("$count disks", "3 disks")]
    #[case("[$gone]", "[]")]
    #[case("$missing and ${missing}", "$missing and ${missing}")]
    #[case("trailing $", "trailing $")]
    #[case("$1 and ${bad-name}", "$1 and ${bad-name}")]
    fn test_safe_substitute(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(Template::new(template).safe_substitute(&vars()), expected);
    }

    #[test]
    fn test_renderer() {
        let alert = Alert::from_value(json!({"host": "web1", "msg": "down"})).unwrap();
        let renderer = MessageRenderer::new(Template::new("${msg}"))
            .with_subject(Template::new("$host"));
        let msg = renderer.render(&alert);
        assert_eq!(msg.subject.as_deref(), Some("web1"));
        assert_eq!(msg.body, "down");

        let plain = MessageRenderer::new(Template::new("$msg")).render(&alert);
        assert!(plain.subject.is_none());
    }
}
