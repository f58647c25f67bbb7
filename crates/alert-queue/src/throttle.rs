//! Global send-rate throttle with a deferred wake-up.
//!
//! The throttle never sleeps. When the rate would be exceeded it records when
//! sending may resume and the owner of the delivery loop arms a one-shot timer
//! for that instant, calling [`Throttle::on_wake`] when it fires.

use std::time::{Duration, Instant};

use tracing::trace;

/// Longest interval between sends and longest pause [`Throttle::defer`] applies.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of asking the throttle for permission to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Send now.
    Proceed,
    /// Rate exceeded; a wake-up was scheduled after this delay.
    Wait(Duration),
    /// A wake-up is already scheduled; do nothing.
    Deferred,
}

#[derive(Debug, Clone, Default)]
pub struct Throttle {
    min_interval: Option<Duration>,
    last_send: Option<Instant>,
    wake_at: Option<Instant>,
}

impl Throttle {
    /// Create a throttle allowing at most `max_rate` sends per second.
    ///
    /// `None`, zero, negative and non-finite rates disable the limit. Rates
    /// below one message per [`MAX_INTERVAL`] are raised to that.
    pub fn new(max_rate: Option<f64>) -> Self {
        let min_interval = max_rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(|r| {
                Duration::try_from_secs_f64(1.0 / r)
                    .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL))
            });
        Self {
            min_interval,
            last_send: None,
            wake_at: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Instant at which the owner must call [`Throttle::on_wake`].
    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    pub fn check(&mut self, now: Instant) -> ThrottleDecision {
        if self.wake_at.is_some() {
            return ThrottleDecision::Deferred;
        }

        if let (Some(interval), Some(last)) = (self.min_interval, self.last_send) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < interval {
                let wait = interval - elapsed;
                trace!("delay sending for {:.1} seconds", wait.as_secs_f64());
                self.wake_at = Some(now + wait);
                return ThrottleDecision::Wait(wait);
            }
        }

        ThrottleDecision::Proceed
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// The scheduled wake-up fired.
    pub fn on_wake(&mut self) {
        self.wake_at = None;
    }

    /// Hold all sending for at least `delay`, e.g. after a transport failure.
    /// The pause is capped at [`MAX_INTERVAL`].
    pub fn defer(&mut self, now: Instant, delay: Duration) {
        let until = now + delay.min(MAX_INTERVAL);
        self.wake_at = Some(match self.wake_at {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}
