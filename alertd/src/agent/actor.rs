//! DeliveryAgent implementation.
//!
//! One agent per channel. The agent owns the channel's recipients, throttle
//! and transport, and processes alerts, transport events and timers one at a
//! time, so queue state needs no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alert_queue::{
    AuthAction, Authorization, AuthorizationStatus, Delivery, MAX_INTERVAL, Recipients, Throttle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::handle::AgentHandle;
use super::messages::{AgentConfig, AgentMessage, AgentState, PeerState};
use crate::alert::Alert;
use crate::template::MessageRenderer;
use crate::transport::{ChannelTransport, OutboundMessage, TransportError, TransportEvent};

/// Outcome of an agent's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Agent stopped gracefully.
    Stopped,
    /// Agent was cancelled.
    Cancelled,
}

/// Delivers alerts to the recipients of one channel.
pub struct DeliveryAgent {
    channel: String,
    transport: Arc<dyn ChannelTransport>,
    renderer: MessageRenderer,
    config: AgentConfig,
    recipients: Recipients<OutboundMessage>,
    throttle: Throttle,
    session_started: bool,
    /// Failed sends since the last success; drives the retry backoff.
    consecutive_failures: u32,
    start_failures: u32,
    restart_at: Option<Instant>,
    /// When the outstanding authorization request of each waiting peer was sent.
    requested_at: HashMap<String, Instant>,
    mailbox: mpsc::Receiver<AgentMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    cancellation_token: CancellationToken,
}

impl DeliveryAgent {
    /// Create an agent for `transport` with the given subscribed addresses.
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        renderer: MessageRenderer,
        config: AgentConfig,
        addresses: impl IntoIterator<Item = String>,
        cancellation_token: CancellationToken,
    ) -> (Self, AgentHandle) {
        let channel = transport.channel_type().to_string();
        let initial = if transport.requires_authorization() {
            Authorization::new()
        } else {
            Authorization::ready()
        };

        let mut recipients = Recipients::new(config.limits, initial);
        for address in addresses {
            recipients.register(&address);
        }

        let (tx, mailbox) = mpsc::channel(config.mailbox_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.mailbox_capacity);
        let handle = AgentHandle::new(channel.clone(), tx, cancellation_token.clone());

        let agent = Self {
            channel,
            transport,
            renderer,
            throttle: Throttle::new(config.max_send_rate),
            config,
            recipients,
            session_started: false,
            consecutive_failures: 0,
            start_failures: 0,
            restart_at: None,
            requested_at: HashMap::new(),
            mailbox,
            events_tx,
            events_rx,
            cancellation_token,
        };
        (agent, handle)
    }

    pub fn spawn(self) -> JoinHandle<AgentOutcome> {
        tokio::spawn(self.run())
    }

    /// Run the agent until it is stopped or cancelled.
    pub async fn run(mut self) -> AgentOutcome {
        info!(
            "{} agent starting with {} recipient(s)",
            self.channel,
            self.recipients.len()
        );

        self.start_transport().await;

        let mut expire_timer = ticker(self.config.expire_interval);
        let mut reauthorize_timer = ticker(self.config.reauthorize_interval);

        loop {
            let wake_at = self.throttle.wake_at().map(Instant::from_std);
            let restart_at = self.restart_at;

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("{} agent cancelled", self.channel);
                    return AgentOutcome::Cancelled;
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("{} agent: all handles dropped", self.channel);
                        break;
                    };
                    if self.handle_message(msg).await {
                        break;
                    }
                }

                _ = sleep_until(wake_at) => {
                    trace!("{} agent: throttle wake-up", self.channel);
                    self.throttle.on_wake();
                    self.drain().await;
                }

                _ = sleep_until(restart_at) => {
                    self.restart_at = None;
                    self.start_transport().await;
                }

                _ = expire_timer.tick() => {
                    self.expire();
                }

                _ = reauthorize_timer.tick() => {
                    if self.reauthorize().await {
                        self.drain().await;
                    }
                }
            }
        }

        info!("{} agent stopped gracefully", self.channel);
        AgentOutcome::Stopped
    }

    /// Returns `true` if the agent should stop.
    async fn handle_message(&mut self, msg: AgentMessage) -> bool {
        match msg {
            AgentMessage::Deliver { alert, addresses } => {
                self.handle_deliver(alert, addresses).await;
                false
            }
            AgentMessage::Stop => {
                debug!("{} agent received stop signal", self.channel);
                true
            }
            AgentMessage::GetState(reply) => {
                let _ = reply.send(self.snapshot());
                false
            }
        }
    }

    async fn handle_deliver(&mut self, alert: Alert, addresses: Vec<String>) {
        let message = self.renderer.render(&alert);
        for address in addresses {
            self.recipients.add_msg(&address, message.clone(), None);
        }

        // recipients first seen here need an authorization check
        if self.session_started {
            self.check_unknown_recipients().await;
        }
        self.drain().await;
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        let drain = match event {
            TransportEvent::SessionStarted => {
                info!("{} session started", self.channel);
                self.session_started = true;
                self.check_unknown_recipients().await
            }
            TransportEvent::AuthorizationGranted(address) => {
                debug!("{}: {} granted authorization", self.channel, address);
                let action = self.recipients.on_granted(&address);
                self.apply(&address, action).await
            }
            TransportEvent::AuthorizationRevoked(address) => {
                debug!("{}: {} revoked authorization", self.channel, address);
                let action = self.recipients.on_revoked(&address);
                self.apply(&address, action).await
            }
            TransportEvent::DeliveryFailed {
                address,
                message,
                error,
            } => {
                self.handle_failure(address, message, error).await;
                false
            }
        };
        if drain {
            self.drain().await;
        }
    }

    async fn start_transport(&mut self) {
        let result = self
            .transport
            .start(self.events_tx.clone(), self.cancellation_token.child_token())
            .await;

        match result {
            Ok(()) => {
                self.start_failures = 0;
                debug!("{} transport started", self.channel);
            }
            Err(e) => {
                let delay = retry_delay(
                    self.config.initial_retry_delay,
                    self.config.max_retry_delay,
                    self.start_failures,
                );
                self.start_failures = self.start_failures.saturating_add(1);
                warn!(
                    "{} transport failed to start: {}; retrying in {:?}",
                    self.channel, e, delay
                );
                self.restart_at = Some(Instant::now() + delay.min(MAX_INTERVAL));
            }
        }
    }

    /// Returns `true` if a recipient became ready.
    async fn check_unknown_recipients(&mut self) -> bool {
        let mut drain = false;
        for address in self.recipients.unknown_recipients() {
            let status = self.transport.query_authorization(&address).await;
            trace!("{}: {} authorization is {:?}", self.channel, address, status);
            let action = self.recipients.on_capability(&address, status);
            drain |= self.apply(&address, action).await;
        }
        drain
    }

    /// Ask the transport again about every peer still waiting for
    /// authorization, and repeat requests that went unanswered for a whole
    /// re-authorization interval. Returns `true` if a recipient became ready.
    async fn reauthorize(&mut self) -> bool {
        if !self.session_started {
            return false;
        }

        let mut drain = false;
        for address in self.recipients.awaiting_recipients() {
            let status = self.transport.query_authorization(&address).await;
            let action = if status == AuthorizationStatus::Granted {
                self.recipients.on_capability(&address, status)
            } else if self.request_is_stale(&address) {
                debug!("{}: no authorization answer from {}; asking again", self.channel, address);
                self.recipients.on_request_expired(&address)
            } else {
                AuthAction::None
            };
            drain |= self.apply(&address, action).await;
        }
        drain
    }

    fn request_is_stale(&self, address: &str) -> bool {
        self.requested_at
            .get(address)
            .is_none_or(|at| at.elapsed() >= self.config.reauthorize_interval)
    }

    /// Carry out an authorization action. Returns `true` if the caller
    /// should drain.
    async fn apply(&mut self, address: &str, action: AuthAction) -> bool {
        match action {
            AuthAction::RequestAuthorization => {
                self.requested_at.insert(address.to_string(), Instant::now());
                if let Err(e) = self.transport.request_authorization(address).await {
                    warn!(
                        "{}: authorization request to {} failed: {}",
                        self.channel, address, e
                    );
                }
                false
            }
            AuthAction::Drain => {
                self.requested_at.remove(address);
                true
            }
            AuthAction::None => false,
        }
    }

    /// Send until nothing is ready, the rate limit is hit or sending is paused.
    async fn drain(&mut self) {
        loop {
            let now = Instant::now().into_std();
            match self.recipients.next_delivery(&mut self.throttle, now) {
                Delivery::Send { address, message } => self.send(address, message).await,
                Delivery::Throttled(wait) => {
                    trace!("{}: delay sending for {:?}", self.channel, wait);
                    break;
                }
                Delivery::Deferred | Delivery::Idle => break,
            }
        }
    }

    async fn send(&mut self, address: String, message: OutboundMessage) {
        match self.transport.send(&address, &message).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!("{}: sent to {}: {}", self.channel, address, message);
            }
            Err(error) => self.handle_failure(address, message, error).await,
        }
    }

    async fn handle_failure(
        &mut self,
        address: String,
        message: OutboundMessage,
        error: TransportError,
    ) {
        if error.is_authorization_lost() {
            warn!(
                "{}: {} no longer accepts messages ({}); requesting authorization",
                self.channel, address, error
            );
            let action = self.recipients.on_authorization_lost(&address, message);
            self.apply(&address, action).await;
            return;
        }

        if !error.is_retryable() {
            warn!("{}: dropping message to {}: {}", self.channel, address, error);
            return;
        }

        self.recipients.readd_msg(&address, message, None);

        let delay = match error {
            TransportError::RateLimited {
                retry_after: Some(retry_after),
            } => retry_after,
            _ => retry_delay(
                self.config.initial_retry_delay,
                self.config.max_retry_delay,
                self.consecutive_failures,
            ),
        };
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.throttle.defer(Instant::now().into_std(), delay);

        warn!(
            "{}: delivery to {} failed: {}; retrying in {:?}",
            self.channel, address, error, delay
        );
    }

    fn expire(&mut self) {
        let expired = self.recipients.expire_msgs(None);
        if expired > 0 {
            debug!("{}: expired {} message(s)", self.channel, expired);
        }
    }

    fn snapshot(&self) -> AgentState {
        let stats = self.recipients.stats();
        let mut peers: Vec<PeerState> = self
            .recipients
            .iter()
            .map(|r| PeerState {
                address: r.address().to_string(),
                state: r.state().to_string(),
                queued: r.queue().len(),
                ready: self.recipients.ready_set().contains(r.address()),
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));

        AgentState {
            channel: self.channel.clone(),
            session_started: self.session_started,
            queued: stats.queued,
            ready: stats.ready,
            awaiting_authorization: stats.awaiting_authorization,
            consecutive_failures: self.consecutive_failures,
            peers,
        }
    }
}

/// Periodic timer whose first tick is one `period` from now.
fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.clamp(Duration::from_millis(1), MAX_INTERVAL);
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Sleep until `deadline`, or forever if there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Exponential backoff with ±25% jitter, never longer than [`MAX_INTERVAL`].
fn retry_delay(initial: Duration, max: Duration, attempts: u32) -> Duration {
    let base_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.min(MAX_INTERVAL).as_millis()).unwrap_or(u64::MAX);

    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempts))
        .min(max_ms);

    let jitter_range = delay_ms / 4;
    let delay_ms = if jitter_range > 0 {
        let offset = rand::random::<u64>() % (jitter_range * 2);
        delay_ms - jitter_range + offset
    } else {
        delay_ms
    };

    Duration::from_millis(delay_ms)
}
