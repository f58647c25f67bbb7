//! Alert intake: normalization, routing and hand-off to delivery agents.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::agent::{AgentConfig, AgentHandle, AgentOutcome, AgentState, DeliveryAgent};
use crate::alert::{Alert, AlertNormalizer};
use crate::config::{AlertConfig, QueueSettings};
use crate::router::SubscriptionRouter;
use crate::template::{MessageRenderer, Template};
use crate::transport::{ChannelTransport, EmailTransport, TelegramTransport};

/// Everything needed to run one channel.
pub struct ChannelSetup {
    pub transport: Arc<dyn ChannelTransport>,
    pub renderer: MessageRenderer,
    pub queue: QueueSettings,
}

impl ChannelSetup {
    pub fn name(&self) -> &'static str {
        self.transport.channel_type()
    }
}

/// Build the channels configured in `config`.
///
/// A channel whose configuration is broken is logged and left out.
pub fn configured_channels(config: &AlertConfig) -> Vec<ChannelSetup> {
    let mut channels = Vec::new();

    if let Some(email) = &config.email {
        match EmailTransport::new(email) {
            Ok(transport) => channels.push(ChannelSetup {
                transport: Arc::new(transport),
                renderer: MessageRenderer::new(Template::new(&email.body))
                    .with_subject(Template::new(&email.subject)),
                queue: email.queue_settings(),
            }),
            Err(e) => error!("email agent disabled: {}", e),
        }
    }

    if let Some(telegram) = &config.telegram {
        match TelegramTransport::new(telegram.clone()) {
            Ok(transport) => channels.push(ChannelSetup {
                transport: Arc::new(transport),
                renderer: MessageRenderer::new(Template::new(&telegram.message)),
                queue: telegram.queue_settings(),
            }),
            Err(e) => error!("telegram agent disabled: {}", e),
        }
    }

    channels
}

/// Entry point for alerts.
pub struct Alerter {
    normalizer: AlertNormalizer,
    router: SubscriptionRouter,
    agents: BTreeMap<String, AgentHandle>,
}

impl Alerter {
    pub fn new(normalizer: AlertNormalizer, router: SubscriptionRouter) -> Self {
        Self {
            normalizer,
            router,
            agents: BTreeMap::new(),
        }
    }

    /// Compile subscriptions for `channels` and spawn one agent per channel
    /// that has subscribers.
    pub fn start(
        config: &AlertConfig,
        channels: Vec<ChannelSetup>,
        cancel: CancellationToken,
    ) -> Result<(Self, Vec<JoinHandle<AgentOutcome>>)> {
        let names: Vec<&str> = channels.iter().map(ChannelSetup::name).collect();
        let router = SubscriptionRouter::from_config(&config.subscriptions, &names)?;
        if router.subscriptions().is_empty() {
            error!("no subscriptions configured");
        }

        let mut alerter = Self::new(AlertNormalizer::from_config(config)?, router);
        let mut tasks = Vec::new();

        for channel in channels {
            let name = channel.name();
            let addresses = alerter.router.addresses(name);
            if addresses.is_empty() {
                trace!("remove {} agent: no subscribers defined", name);
                continue;
            }

            let (agent, handle) = DeliveryAgent::new(
                channel.transport,
                channel.renderer,
                AgentConfig::new(channel.queue, &config.delivery),
                addresses,
                cancel.child_token(),
            );
            tasks.push(agent.spawn());
            alerter.add_agent(handle);
        }

        info!("alerter started with channels: {:?}", alerter.channels());
        Ok((alerter, tasks))
    }

    pub fn add_agent(&mut self, handle: AgentHandle) {
        self.agents.insert(handle.channel().to_string(), handle);
    }

    pub fn channels(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    /// Normalize `alert` and queue it on every matching channel.
    ///
    /// Returns the number of recipients it was queued for.
    pub async fn deliver(&self, mut alert: Alert) -> usize {
        self.normalizer.normalize(&mut alert, Utc::now());
        debug!("deliver: {:?}", alert.fields());

        let mut queued = 0;
        for (channel, addresses) in self.router.resolve(&alert) {
            let Some(agent) = self.agents.get(&channel) else {
                continue;
            };
            let count = addresses.len();
            match agent.deliver(alert.clone(), addresses.into_iter().collect()).await {
                Ok(()) => queued += count,
                Err(e) => warn!("cannot hand alert to {} agent: {}", channel, e),
            }
        }
        queued
    }

    /// Current state of every agent that is still running.
    pub async fn states(&self) -> Vec<AgentState> {
        let mut states = Vec::with_capacity(self.agents.len());
        for agent in self.agents.values() {
            if let Some(state) = agent.state().await {
                states.push(state);
            }
        }
        states
    }

    /// Ask every agent to stop.
    pub async fn shutdown(&self) {
        for agent in self.agents.values() {
            if let Err(e) = agent.stop().await {
                debug!("{} agent already stopped: {}", agent.channel(), e);
            }
        }
    }
}
