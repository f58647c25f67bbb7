//! Per-channel delivery agents.
//!
//! Each channel runs as one actor task:
//! - `DeliveryAgent`: owns queues, throttle and transport of one channel
//! - `AgentHandle`: backpressure-aware sender for its mailbox
//! - `AgentMessage`: alerts, state queries, shutdown

mod actor;
mod handle;
mod messages;

pub use actor::{AgentOutcome, DeliveryAgent};
pub use handle::{AgentHandle, DEFAULT_SEND_TIMEOUT, SendError};
pub use messages::{AgentConfig, AgentMessage, AgentState, PeerState};
