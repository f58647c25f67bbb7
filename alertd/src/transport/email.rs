//! Email transport using SMTP.
//!
//! Connects with opportunistic STARTTLS and logs in only when both a user and
//! a password are configured. Mail peers need no authorization, so every
//! recipient of this channel is ready from the start.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{ChannelTransport, OutboundMessage, TransportError};
use crate::Result;
use crate::config::QueueSettings;

const DEFAULT_SMTP_PORT: u16 = 25;

/// SMTP connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Upgrade with STARTTLS when the server offers it.
    #[serde(default = "default_true")]
    pub starttls: bool,
}

/// Email channel configuration (`[email]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Missing settings are reported when the transport is built.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default = "default_sender")]
    pub from: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub max_msgs: Option<i64>,
    #[serde(default)]
    pub max_age_secs: Option<i64>,
    #[serde(default)]
    pub msgs_per_sec: Option<f64>,
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_true() -> bool {
    true
}

fn default_sender() -> String {
    "alertd <alertd@localhost>".to_string()
}

fn default_subject() -> String {
    "${SEVERITY} ${host} ${msg}".to_string()
}

fn default_body() -> String {
    "${msg}\n\nseverity: ${severity}\ncategory: ${category}\nhost:     ${host}\ntime:     ${time}"
        .to_string()
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("X-Priority".to_string(), "1".to_string())])
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp: None,
            from: default_sender(),
            subject: default_subject(),
            body: default_body(),
            headers: default_headers(),
            max_msgs: None,
            max_age_secs: None,
            msgs_per_sec: None,
        }
    }
}

impl EmailConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_msgs: self.max_msgs,
            max_age_secs: self.max_age_secs,
            msgs_per_sec: self.msgs_per_sec,
        }
    }
}

/// SMTP email transport.
pub struct EmailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    headers: Vec<(HeaderName, String)>,
}

impl EmailTransport {
    /// Build the transport. Fails on missing SMTP host or malformed addresses.
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let smtp = config
            .smtp
            .as_ref()
            .ok_or_else(|| crate::Error::config("email config missing \"smtp\" options"))?;
        let host = smtp.host.trim();
        if host.is_empty() {
            return Err(crate::Error::config(
                "email.smtp config missing or blank \"host\" option",
            ));
        }

        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| crate::Error::config(format!("invalid email sender {:?}: {}", config.from, e)))?;

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                HeaderName::new_from_ascii(name.clone())
                    .map(|n| (n, value.clone()))
                    .map_err(|_| crate::Error::config(format!("invalid email header name {:?}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        crate::install_rustls_provider();
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(smtp.port);
        if smtp.starttls {
            let params = TlsParameters::new(host.to_string())
                .map_err(|e| crate::Error::config(format!("email TLS setup failed: {}", e)))?;
            builder = builder.tls(Tls::Opportunistic(params));
        }
        if let (Some(user), Some(password)) = (
            smtp.user.as_deref().filter(|u| !u.is_empty()),
            smtp.password.as_deref().filter(|p| !p.is_empty()),
        ) {
            trace!("email: login as {}", user);
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }

        debug!("email transport: server {} port {}", host, smtp.port);
        Ok(Self {
            transport: builder.build(),
            from,
            headers,
        })
    }

    fn build_message(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<Message, TransportError> {
        let to: Mailbox = address
            .parse()
            .map_err(|e| TransportError::Rejected(format!("invalid address {:?}: {}", address, e)))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone().unwrap_or_default())
            .header(ContentType::TEXT_PLAIN);
        for (name, value) in &self.headers {
            builder = builder.raw_header(HeaderValue::new(name.clone(), value.clone()));
        }

        builder
            .body(message.body.clone())
            .map_err(|e| TransportError::Rejected(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl ChannelTransport for EmailTransport {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        let email = self.build_message(address, message)?;
        trace!("email: send message to {}", address);

        match self.transport.send(email).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(TransportError::Rejected(e.to_string())),
            Err(e) => Err(TransportError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp(host: &str) -> SmtpConfig {
        SmtpConfig {
            host: host.to_string(),
            port: DEFAULT_SMTP_PORT,
            user: None,
            password: None,
            starttls: false,
        }
    }

    #[test]
    fn test_email_config_default() {
        let config = EmailConfig::default();
        assert!(config.smtp.is_none());
        assert_eq!(config.subject, "${SEVERITY} ${host} ${msg}");
        assert!(config.body.starts_with("${msg}\n\nseverity: ${severity}"));
        assert_eq!(config.headers.get("X-Priority").map(String::as_str), Some("1"));
        assert!(config.max_msgs.is_none());
    }

    #[test]
    fn test_missing_smtp_is_config_error() {
        let err = EmailTransport::new(&EmailConfig::default()).err();
        assert!(matches!(err, Some(crate::Error::Configuration(_))));
    }

    #[test]
    fn test_blank_host_is_config_error() {
        let config = EmailConfig {
            smtp: Some(smtp("  ")),
            ..Default::default()
        };
        let err = EmailTransport::new(&config).err();
        assert!(matches!(err, Some(crate::Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_header_name_is_config_error() {
        let mut config = EmailConfig {
            smtp: Some(smtp("mail.example.com")),
            ..Default::default()
        };
        config
            .headers
            .insert("Bad Header".to_string(), "x".to_string());
        assert!(EmailTransport::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_build_message() {
        let config = EmailConfig {
            smtp: Some(smtp("mail.example.com")),
            ..Default::default()
        };
        let transport = EmailTransport::new(&config).unwrap();

        let message = OutboundMessage::new("disk full").with_subject("CRITICAL web1 disk full");
        let email = transport
            .build_message("Ops Team <ops@example.com>", &message)
            .unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("Subject: CRITICAL web1 disk full"));
        assert!(raw.contains("X-Priority: 1"));
        assert!(raw.contains("ops@example.com"));

        let err = transport.build_message("not an address", &message).unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }
}
