//! Delivery agent message types.

use std::time::Duration;

use alert_queue::QueueLimits;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::alert::Alert;
use crate::config::{DeliveryConfig, QueueSettings};

/// Messages that can be sent to a DeliveryAgent.
#[derive(Debug)]
pub enum AgentMessage {
    /// Queue an alert for the given addresses.
    Deliver { alert: Alert, addresses: Vec<String> },
    /// Request graceful shutdown.
    Stop,
    /// Query current state (response sent via oneshot channel).
    GetState(oneshot::Sender<AgentState>),
}

/// Runtime configuration of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub limits: QueueLimits,
    /// Global send rate of the channel; `None` means unlimited.
    pub max_send_rate: Option<f64>,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub expire_interval: Duration,
    /// How often waiting peers are asked about their authorization again.
    pub reauthorize_interval: Duration,
    pub mailbox_capacity: usize,
}

impl AgentConfig {
    pub fn new(queue: QueueSettings, delivery: &DeliveryConfig) -> Self {
        Self {
            limits: QueueLimits::from_config(queue.max_msgs, queue.max_age_secs),
            max_send_rate: queue.msgs_per_sec,
            initial_retry_delay: Duration::from_millis(delivery.initial_retry_delay_ms),
            max_retry_delay: Duration::from_millis(delivery.max_retry_delay_ms),
            expire_interval: Duration::from_secs(delivery.expire_interval_secs.max(1)),
            reauthorize_interval: Duration::from_secs(delivery.reauthorize_interval_secs.max(1)),
            mailbox_capacity: delivery.mailbox_capacity.max(1),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(QueueSettings::default(), &DeliveryConfig::default())
    }
}

/// Snapshot of one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerState {
    pub address: String,
    pub state: String,
    pub queued: usize,
    pub ready: bool,
}

/// Snapshot of an agent, for health reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentState {
    pub channel: String,
    pub session_started: bool,
    pub queued: usize,
    pub ready: usize,
    pub awaiting_authorization: usize,
    pub consecutive_failures: u32,
    pub peers: Vec<PeerState>,
}

impl AgentState {
    pub fn peer(&self, address: &str) -> Option<&PeerState> {
        self.peers.iter().find(|p| p.address == address)
    }
}
