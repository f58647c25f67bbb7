//! Handle for sending messages to a delivery agent.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::messages::{AgentMessage, AgentState};
use crate::alert::Alert;

/// How long a delivery waits for mailbox space before giving up.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Agent has stopped")]
    AgentStopped,
    #[error("Send operation timed out")]
    Timeout,
}

/// A handle to a delivery agent. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    channel: String,
    sender: mpsc::Sender<AgentMessage>,
    cancellation_token: CancellationToken,
}

impl AgentHandle {
    pub(crate) fn new(
        channel: String,
        sender: mpsc::Sender<AgentMessage>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            sender,
            cancellation_token,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Queue `alert` for `addresses`.
    pub async fn deliver(&self, alert: Alert, addresses: Vec<String>) -> Result<(), SendError> {
        self.send_with_timeout(AgentMessage::Deliver { alert, addresses }, DEFAULT_SEND_TIMEOUT)
            .await
    }

    /// Send a message, waiting up to `timeout` when the mailbox is full.
    pub async fn send_with_timeout(
        &self,
        msg: AgentMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        // Fast path: try non-blocking send first
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(timeout, self.sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::AgentStopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::AgentStopped),
        }
    }

    /// Query the agent's current state. `None` if it has stopped.
    pub async fn state(&self) -> Option<AgentState> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(AgentMessage::GetState(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Ask the agent to stop after the messages already queued.
    pub async fn stop(&self) -> Result<(), SendError> {
        self.sender
            .send(AgentMessage::Stop)
            .await
            .map_err(|_| SendError::AgentStopped)
    }

    /// Stop the agent immediately.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}
