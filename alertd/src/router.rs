//! Subscription routing.
//!
//! Subscriptions are evaluated in file order against the alert's
//! `category/severity` key. Patterns are anchored at the start of the key
//! only, so `disk/` matches every disk alert.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tracing::{error, trace};

use crate::Result;
use crate::alert::Alert;
use crate::config::SubscriptionConfig;

/// Protocol used for subscribers given without a `protocol:` prefix.
pub const DEFAULT_PROTOCOL: &str = "email";

/// A `protocol:address` subscriber.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscriber {
    pub channel: String,
    pub address: String,
}

impl Subscriber {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((channel, address)) if !channel.contains('<') => Self {
                channel: channel.to_string(),
                address: address.to_string(),
            },
            _ => Self {
                channel: DEFAULT_PROTOCOL.to_string(),
                address: s.to_string(),
            },
        }
    }
}

/// One compiled subscription rule.
#[derive(Debug, Clone)]
pub struct Subscription {
    pattern: String,
    regex: Regex,
    subscribers: Vec<Subscriber>,
}

impl Subscription {
    pub fn new(pattern: &str, subscribers: Vec<Subscriber>) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            subscribers,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    pub fn matches(&self, condition: &str) -> bool {
        self.regex.is_match(condition)
    }
}

/// Recipients of one alert: channel -> addresses, both sorted.
pub type Targets = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionRouter {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRouter {
    /// Compile the subscription table.
    ///
    /// Subscribers of channels not in `channels` are logged and dropped.
    pub fn from_config(configs: &[SubscriptionConfig], channels: &[&str]) -> Result<Self> {
        let mut subscriptions = Vec::with_capacity(configs.len());

        for config in configs {
            let subscribers = config
                .recipients
                .to_vec()
                .into_iter()
                .filter_map(|raw| {
                    let subscriber = Subscriber::parse(&raw);
                    if channels.contains(&subscriber.channel.as_str()) {
                        Some(subscriber)
                    } else {
                        error!(
                            "ignore subscriber \"{}\": unknown protocol \"{}\"",
                            raw, subscriber.channel
                        );
                        None
                    }
                })
                .collect();

            subscriptions.push(Subscription::new(&config.pattern, subscribers)?);
        }

        Ok(Self { subscriptions })
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Every address subscribed on `channel`, under any pattern.
    pub fn addresses(&self, channel: &str) -> BTreeSet<String> {
        self.subscriptions
            .iter()
            .flat_map(|s| s.subscribers.iter())
            .filter(|s| s.channel == channel)
            .map(|s| s.address.clone())
            .collect()
    }

    /// Resolve the recipients of `alert` on every channel.
    pub fn resolve(&self, alert: &Alert) -> Targets {
        let condition = alert.condition();
        let mut targets = Targets::new();

        for subscription in &self.subscriptions {
            if !subscription.matches(&condition) {
                continue;
            }
            trace!("{} matches subscription {:?}", condition, subscription.pattern);
            for subscriber in &subscription.subscribers {
                targets
                    .entry(subscriber.channel.clone())
                    .or_default()
                    .insert(subscriber.address.clone());
            }
        }

        targets
    }
}
