//! # alertd
//!
//! Fans alerts out to subscribed recipients over email and chat channels.
//!
//! An alert posted to the HTTP API is normalized, matched against the
//! subscription table and handed to one [`agent::DeliveryAgent`] per channel.
//! Each agent queues a rendered message per recipient and drains the queues
//! through its [`transport::ChannelTransport`] at a bounded rate, only to
//! recipients that have authorized the channel.

pub mod agent;
pub mod alert;
pub mod alerter;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod template;
pub mod transport;

pub use error::{Error, Result};

use std::sync::OnceLock;

use tracing::debug;

/// Install the process-wide rustls crypto provider used by the HTTP and SMTP clients.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}
