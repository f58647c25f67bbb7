//! Channel transports.
//!
//! A transport is the I/O half of a delivery channel:
//! - Email (SMTP via lettre), always authorized
//! - Telegram Bot API, authorized once the chat has started the bot
//! - In-memory recording transport for embedding and tests
//!
//! Transports never touch queue state. Everything they learn in the
//! background is reported to the owning agent as a [`TransportEvent`].

mod email;
pub mod memory;
mod telegram;

pub use email::{EmailConfig, EmailTransport, SmtpConfig};
pub use memory::MemoryTransport;
pub use telegram::{TelegramConfig, TelegramTransport};

use std::fmt;
use std::time::Duration;

use alert_queue::AuthorizationStatus;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A rendered message ready to be handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: Option<String>,
    pub body: String,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{}", subject),
            None => write!(f, "{}", self.body),
        }
    }
}

/// Why a send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer no longer authorizes us; a fresh authorization cycle is needed.
    #[error("authorization lost: {0}")]
    AuthorizationLost(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The message was refused and retrying it will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn is_authorization_lost(&self) -> bool {
        matches!(self, Self::AuthorizationLost(_))
    }

    /// Whether the message should be put back into the queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Asynchronous notifications from a transport to its agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is connected; authorization of unknown peers can be queried.
    SessionStarted,
    AuthorizationGranted(String),
    AuthorizationRevoked(String),
    /// A send that was accepted earlier bounced.
    DeliveryFailed {
        address: String,
        message: OutboundMessage,
        error: TransportError,
    },
}

/// I/O side of a delivery channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Whether peers must authorize us before messages are delivered.
    fn requires_authorization(&self) -> bool {
        false
    }

    /// Start background activity. Must emit [`TransportEvent::SessionStarted`]
    /// once the transport can answer authorization queries.
    async fn start(
        &self,
        events: mpsc::Sender<TransportEvent>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        let _ = events.send(TransportEvent::SessionStarted).await;
        Ok(())
    }

    /// Deliver one message to one peer.
    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<(), TransportError>;

    /// Ask what the transport currently knows about `address`.
    async fn query_authorization(&self, _address: &str) -> AuthorizationStatus {
        AuthorizationStatus::Granted
    }

    /// Ask the peer to authorize us. The answer arrives as a [`TransportEvent`].
    async fn request_authorization(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

/// Truncate text to at most `limit` characters, marking the cut.
pub(crate) fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit.saturating_sub(suffix.len());
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}
