//! In-process transport that records deliveries.
//!
//! Used to embed the daemon's delivery machinery in other programs and to
//! script transport behavior in tests: authorization answers, queued send
//! failures and peer events can all be injected.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use alert_queue::AuthorizationStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ChannelTransport, OutboundMessage, TransportError, TransportEvent};
use crate::Result;

#[derive(Default)]
struct MemoryState {
    sent: Vec<(String, OutboundMessage)>,
    sent_at: Vec<Instant>,
    authorization: HashMap<String, AuthorizationStatus>,
    failures: HashMap<String, VecDeque<TransportError>>,
    authorization_requests: Vec<String>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Recording transport. Cloning shares the recorded state.
#[derive(Clone)]
pub struct MemoryTransport {
    channel: &'static str,
    requires_authorization: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// A transport whose peers must authorize it, like a chat channel.
    pub fn with_authorization(channel: &'static str) -> Self {
        Self {
            channel,
            requires_authorization: true,
            state: Arc::default(),
        }
    }

    /// A transport that can always deliver, like email.
    pub fn open(channel: &'static str) -> Self {
        Self {
            channel,
            requires_authorization: false,
            state: Arc::default(),
        }
    }

    /// Answer future authorization queries for `address` with `status`.
    pub fn set_authorization(&self, address: &str, status: AuthorizationStatus) {
        self.state
            .lock()
            .authorization
            .insert(address.to_string(), status);
    }

    /// Fail the next send to `address` with `error`.
    pub fn fail_next(&self, address: &str, error: TransportError) {
        self.state
            .lock()
            .failures
            .entry(address.to_string())
            .or_default()
            .push_back(error);
    }

    /// Deliver a peer event to the agent, as a real transport's background task would.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.state.lock().events.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.state.lock().sent.clone()
    }

    /// Bodies of messages sent to `address`, oldest first.
    pub fn sent_to(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, m)| m.body.clone())
            .collect()
    }

    /// When each recorded send happened, on the tokio clock.
    pub fn send_times(&self) -> Vec<Instant> {
        self.state.lock().sent_at.clone()
    }

    pub fn authorization_requests(&self) -> Vec<String> {
        self.state.lock().authorization_requests.clone()
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn channel_type(&self) -> &'static str {
        self.channel
    }

    fn requires_authorization(&self) -> bool {
        self.requires_authorization
    }

    async fn start(
        &self,
        events: mpsc::Sender<TransportEvent>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        self.state.lock().events = Some(events.clone());
        let _ = events.send(TransportEvent::SessionStarted).await;
        Ok(())
    }

    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.get_mut(address).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        state.sent.push((address.to_string(), message.clone()));
        state.sent_at.push(Instant::now());
        Ok(())
    }

    async fn query_authorization(&self, address: &str) -> AuthorizationStatus {
        if !self.requires_authorization {
            return AuthorizationStatus::Granted;
        }
        self.state
            .lock()
            .authorization
            .get(address)
            .copied()
            .unwrap_or(AuthorizationStatus::Unknown)
    }

    async fn request_authorization(&self, address: &str) -> Result<()> {
        self.state
            .lock()
            .authorization_requests
            .push(address.to_string());
        Ok(())
    }
}
