//! Daemon configuration.
//!
//! Loaded from a TOML file. Every section is optional; a missing channel
//! section means that channel is not started.
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4507"
//!
//! [time]
//! format = "%c %Z"
//! timezone = "Europe/Berlin"
//!
//! [[subscriptions]]
//! pattern = "disk/(error|critical)"
//! recipients = ["ops@example.com", "telegram:123456"]
//!
//! [email.smtp]
//! host = "mail.example.com"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use chrono::format::{Item, StrftimeItems};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::transport::{EmailConfig, TelegramConfig};

/// Environment variable overriding the HTTP listen address.
pub const LISTEN_ENV: &str = "ALERTD_LISTEN";

const DEFAULT_LISTEN: &str = "127.0.0.1:4507";
const DEFAULT_TIME_FORMAT: &str = "%c %Z";
const DEFAULT_TIMEZONE: &str = "UTC";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub server: ServerConfig,
    pub time: TimeConfig,
    /// Verb display names, merged over the built-in `raised`/`cleared` names.
    pub verbs: BTreeMap<String, String>,
    pub subscriptions: Vec<SubscriptionConfig>,
    pub delivery: DeliveryConfig,
    pub email: Option<EmailConfig>,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

/// How the `time` field of an alert is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// strftime format.
    pub format: String,
    /// IANA timezone name.
    pub timezone: String,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_TIME_FORMAT.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// One subscription rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Regex matched against `category/severity`, anchored at the start.
    pub pattern: String,
    pub recipients: SubscriberList,
}

/// Subscribers given either as a list or as one comma/space separated string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriberList {
    One(String),
    Many(Vec<String>),
}

impl SubscriberList {
    pub fn to_vec(&self) -> Vec<String> {
        let items: Vec<&str> = match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        };
        items
            .into_iter()
            .flat_map(split_subscribers)
            .collect()
    }
}

/// Split on commas, and on whitespace outside of `Name <addr>` display forms.
fn split_subscribers(s: &str) -> Vec<String> {
    s.split(',')
        .flat_map(|part| {
            let part = part.trim();
            if part.contains('<') {
                vec![part.to_string()]
            } else {
                part.split_whitespace().map(str::to_string).collect()
            }
        })
        .filter(|p| !p.is_empty())
        .collect()
}

/// Retry policy for transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// How often queues are swept for expired messages.
    pub expire_interval_secs: u64,
    /// How often peers that have not authorized us yet are checked and,
    /// when a request went unanswered that long, asked again.
    pub reauthorize_interval_secs: u64,
    /// Mailbox capacity of each delivery agent.
    pub mailbox_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            expire_interval_secs: 60,
            reauthorize_interval_secs: 300,
            mailbox_capacity: 256,
        }
    }
}

/// Queue limits of one channel, as configured.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueSettings {
    /// Zero or negative means unbounded.
    pub max_msgs: Option<i64>,
    /// Zero or negative means no expiry.
    pub max_age_secs: Option<i64>,
    /// Zero or negative means no rate limit.
    pub msgs_per_sec: Option<f64>,
}

impl AlertConfig {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var(LISTEN_ENV)
            && !listen.trim().is_empty()
        {
            self.server.listen = listen.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.timezone()?;

        if StrftimeItems::new(&self.time.format).any(|item| matches!(item, Item::Error)) {
            return Err(crate::Error::config(format!(
                "invalid time format {:?}",
                self.time.format
            )));
        }

        for sub in &self.subscriptions {
            if sub.recipients.to_vec().is_empty() {
                return Err(crate::Error::config(format!(
                    "subscription {:?} has no recipients",
                    sub.pattern
                )));
            }
        }

        if self.delivery.mailbox_capacity == 0 {
            return Err(crate::Error::config("delivery.mailbox_capacity must be positive"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            crate::Error::config(format!("invalid listen address {:?}: {}", self.server.listen, e))
        })
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.time.timezone.parse().map_err(|_| {
            crate::Error::config(format!("unknown timezone {:?}", self.time.timezone))
        })
    }
}
