//! The recipients of one delivery channel and their shared ready set.
//!
//! [`Recipients`] is the only place that mutates queues, authorization state
//! and ready-set membership. Every mutation settles membership before it
//! returns, so a recipient is in the ready set exactly when it is `Ready` and
//! has at least one queued message.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::authorization::{AuthAction, Authorization, AuthorizationState, AuthorizationStatus};
use crate::ready_set::ReadySet;
use crate::recipient::{QueueChange, RecipientQueue, Timestamp};
use crate::throttle::{Throttle, ThrottleDecision};

/// Queue limits applied to every recipient of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_msgs: Option<usize>,
    pub max_age: Option<chrono::Duration>,
}

impl QueueLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Build limits from raw configuration values; non-positive values mean
    /// "no limit".
    pub fn from_config(max_msgs: Option<i64>, max_age_secs: Option<i64>) -> Self {
        Self {
            max_msgs: max_msgs
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok()),
            max_age: max_age_secs
                .filter(|s| *s > 0)
                .and_then(chrono::Duration::try_seconds),
        }
    }
}

/// A single addressable destination on one channel.
#[derive(Debug, Clone)]
pub struct Recipient<M> {
    address: String,
    queue: RecipientQueue<M>,
    authorization: Authorization,
}

impl<M> Recipient<M> {
    fn new(address: String, limits: QueueLimits, authorization: Authorization) -> Self {
        Self {
            address,
            queue: RecipientQueue::new(limits.max_msgs, limits.max_age),
            authorization,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn queue(&self) -> &RecipientQueue<M> {
        &self.queue
    }

    pub fn state(&self) -> AuthorizationState {
        self.authorization.state()
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    fn is_eligible(&self) -> bool {
        self.authorization.is_ready() && !self.queue.is_empty()
    }
}

impl<M: fmt::Display> fmt::Display for Recipient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.address, self.state(), self.queue)
    }
}

/// One step of the throttled delivery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<M> {
    /// Send `message` to `address` now.
    Send { address: String, message: M },
    /// The rate limit was hit; resume after this delay.
    Throttled(Duration),
    /// A wake-up is already pending.
    Deferred,
    /// Nothing is ready to send.
    Idle,
}

/// Counters describing the current queue contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecipientsStats {
    pub recipients: usize,
    pub ready: usize,
    pub queued: usize,
    pub awaiting_authorization: usize,
}

/// All recipients of one channel.
#[derive(Debug, Clone)]
pub struct Recipients<M> {
    recipients: HashMap<String, Recipient<M>>,
    ready: ReadySet,
    limits: QueueLimits,
    initial: Authorization,
}

impl<M> Recipients<M> {
    /// Create an empty registry.
    ///
    /// `initial` is the authorization every new recipient starts with:
    /// [`Authorization::new`] for presence-gated channels,
    /// [`Authorization::ready`] for channels that need no authorization.
    pub fn new(limits: QueueLimits, initial: Authorization) -> Self {
        Self {
            recipients: HashMap::new(),
            ready: ReadySet::new(),
            limits,
            initial,
        }
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Register a recipient if it does not exist yet.
    ///
    /// Returns `true` when a new recipient was created.
    pub fn register(&mut self, address: &str) -> bool {
        if self.recipients.contains_key(address) {
            return false;
        }
        debug!("add recipient: {}", address);
        self.recipients.insert(
            address.to_string(),
            Recipient::new(address.to_string(), self.limits, self.initial.clone()),
        );
        true
    }

    pub fn get(&self, address: &str) -> Option<&Recipient<M>> {
        self.recipients.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.recipients.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipient<M>> {
        self.recipients.values()
    }

    pub fn ready_set(&self) -> &ReadySet {
        &self.ready
    }

    /// Addresses of recipients whose authorization is still unknown.
    pub fn unknown_recipients(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .recipients
            .values()
            .filter(|r| r.state() == AuthorizationState::Unknown)
            .map(|r| r.address.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Addresses of recipients waiting for an authorization answer.
    pub fn awaiting_recipients(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .recipients
            .values()
            .filter(|r| r.state() == AuthorizationState::AwaitingAuthorization)
            .map(|r| r.address.clone())
            .collect();
        addrs.sort();
        addrs
    }

    pub fn stats(&self) -> RecipientsStats {
        RecipientsStats {
            recipients: self.recipients.len(),
            ready: self.ready.len(),
            queued: self.recipients.values().map(|r| r.queue.len()).sum(),
            awaiting_authorization: self
                .recipients
                .values()
                .filter(|r| r.state() == AuthorizationState::AwaitingAuthorization)
                .count(),
        }
    }

    /// Queue a message, creating the recipient on first use.
    pub fn add_msg(&mut self, address: &str, msg: M, timestamp: Option<Timestamp>) {
        self.register(address);
        let change = match self.recipients.get_mut(address) {
            Some(r) => r.queue.add_msg(msg, timestamp),
            None => return,
        };
        trace!(
            "queue message to {}: {} message(s) pending",
            address,
            self.queued_len(address)
        );
        self.settle(address, Some(change));
    }

    /// Re-queue a message whose delivery failed.
    pub fn readd_msg(&mut self, address: &str, msg: M, timestamp: Option<Timestamp>) {
        let change = match self.recipients.get_mut(address) {
            Some(r) => r.queue.readd_msg(msg, timestamp),
            None => {
                debug!("cannot re-add message for unknown recipient {}", address);
                return;
            }
        };
        self.settle(address, Some(change));
    }

    /// Take the oldest message queued for `address`.
    pub fn get_msg(&mut self, address: &str, now: Option<Timestamp>) -> Option<M> {
        let (msg, change) = self.recipients.get_mut(address)?.queue.get_msg(now);
        self.settle(address, Some(change));
        msg
    }

    /// Expire old messages of every recipient.
    pub fn expire_msgs(&mut self, now: Option<Timestamp>) -> usize {
        let now = now.or_else(|| Some(chrono::Utc::now()));
        let mut expired = 0;
        let mut drained = Vec::new();
        for (address, recipient) in self.recipients.iter_mut() {
            let n = recipient.queue.expire_msgs(now);
            if n > 0 && recipient.queue.is_empty() {
                drained.push(address.clone());
            }
            expired += n;
        }
        for address in drained {
            self.settle(&address, None);
        }
        expired
    }

    pub fn on_capability(&mut self, address: &str, status: AuthorizationStatus) -> AuthAction {
        self.transition(address, |auth| auth.on_capability(status))
    }

    pub fn on_granted(&mut self, address: &str) -> AuthAction {
        self.transition(address, Authorization::on_granted)
    }

    pub fn on_revoked(&mut self, address: &str) -> AuthAction {
        self.transition(address, Authorization::on_revoked)
    }

    pub fn on_request_expired(&mut self, address: &str) -> AuthAction {
        self.transition(address, Authorization::on_request_expired)
    }

    /// A send to `address` failed because authorization was silently lost.
    ///
    /// The in-flight message is re-queued before the fresh authorization
    /// cycle starts.
    pub fn on_authorization_lost(&mut self, address: &str, msg: M) -> AuthAction {
        if !self.recipients.contains_key(address) {
            return AuthAction::None;
        }
        self.readd_msg(address, msg, None);
        self.transition(address, Authorization::on_authorization_lost)
    }

    /// Produce the next step of the throttled delivery loop.
    ///
    /// Recipients are served round-robin: the front of the ready set gets one
    /// message and, if it still has more, moves to the back.
    pub fn next_delivery(&mut self, throttle: &mut Throttle, now: Instant) -> Delivery<M> {
        loop {
            let Some(address) = self.ready.front().map(str::to_owned) else {
                return Delivery::Idle;
            };

            match throttle.check(now) {
                ThrottleDecision::Proceed => {}
                ThrottleDecision::Wait(wait) => return Delivery::Throttled(wait),
                ThrottleDecision::Deferred => return Delivery::Deferred,
            }

            let msg = self.get_msg(&address, None);
            self.ready.requeue(&address);

            if let Some(message) = msg {
                throttle.record_send(now);
                return Delivery::Send { address, message };
            }
            // everything queued for this recipient had expired
        }
    }

    fn transition(
        &mut self,
        address: &str,
        f: impl FnOnce(&mut Authorization) -> AuthAction,
    ) -> AuthAction {
        let Some(recipient) = self.recipients.get_mut(address) else {
            debug!("ignoring authorization change for unknown recipient {}", address);
            return AuthAction::None;
        };
        let action = f(&mut recipient.authorization);
        self.settle(address, None);
        action
    }

    fn queued_len(&self, address: &str) -> usize {
        self.recipients.get(address).map_or(0, |r| r.queue.len())
    }

    /// Bring ready-set membership of `address` in line with its state.
    fn settle(&mut self, address: &str, change: Option<QueueChange>) {
        let eligible = self
            .recipients
            .get(address)
            .is_some_and(Recipient::is_eligible);

        if eligible {
            if self.ready.insert(address) {
                trace!("add {} to pending", address);
            }
        } else if self.ready.remove(address) {
            trace!("remove {} from pending", address);
        }

        debug_assert!(
            change.is_none_or(|c| !c.is_empty || !self.ready.contains(address)),
            "empty recipient left in ready set"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn presence() -> Recipients<&'static str> {
        Recipients::new(QueueLimits::unbounded(), Authorization::new())
    }

    fn assert_consistent<M>(r: &Recipients<M>) {
        for recipient in r.iter() {
            assert_eq!(
                recipient.state() == AuthorizationState::Ready && !recipient.queue().is_empty(),
                r.ready_set().contains(recipient.address()),
                "ready set out of sync for {}",
                recipient.address()
            );
        }
    }

    fn drain_all(r: &mut Recipients<&'static str>) -> Vec<(String, &'static str)> {
        let mut throttle = Throttle::unlimited();
        let mut sent = Vec::new();
        while let Delivery::Send { address, message } =
            r.next_delivery(&mut throttle, Instant::now())
        {
            sent.push((address, message));
            assert_consistent(r);
        }
        sent
    }

    #[test]
    fn limits_from_config() {
        assert_eq!(QueueLimits::from_config(None, None), QueueLimits::unbounded());
        assert_eq!(
            QueueLimits::from_config(Some(0), Some(-1)),
            QueueLimits::unbounded()
        );
        let limits = QueueLimits::from_config(Some(50), Some(3600));
        assert_eq!(limits.max_msgs, Some(50));
        assert_eq!(limits.max_age, Some(chrono::Duration::hours(1)));
    }

    #[test]
    fn not_ready_recipient_never_enters_ready_set() {
        let mut r = presence();
        r.add_msg("a@example.com", "msg 1", None);
        assert_consistent(&r);
        assert!(r.ready_set().is_empty());

        r.on_granted("a@example.com");
        assert!(r.ready_set().contains("a@example.com"));

        assert_eq!(r.get_msg("a@example.com", None), Some("msg 1"));
        assert!(r.ready_set().is_empty());
        assert_consistent(&r);
    }

    #[test]
    fn ready_set_tracks_every_mutation() {
        let mut r = Recipients::new(QueueLimits::from_config(Some(2), None), Authorization::ready());
        let addr = "ops@example.com";

        r.add_msg(addr, "a", None);
        assert_consistent(&r);
        r.add_msg(addr, "b", None);
        r.add_msg(addr, "c", None);
        assert_consistent(&r);
        assert_eq!(r.get(addr).unwrap().queue().len(), 2);

        r.get_msg(addr, None);
        r.readd_msg(addr, "b", None);
        assert_consistent(&r);

        r.on_revoked(addr);
        assert_consistent(&r);
        assert!(r.ready_set().is_empty());

        r.on_granted(addr);
        assert_consistent(&r);
        assert!(r.ready_set().contains(addr));

        while r.get_msg(addr, None).is_some() {
            assert_consistent(&r);
        }
        assert!(r.ready_set().is_empty());
    }

    #[test]
    fn expiry_sweep_removes_drained_recipients() {
        let mut r = Recipients::new(
            QueueLimits::from_config(None, Some(60)),
            Authorization::ready(),
        );
        let t0 = Utc.timestamp_opt(0, 0).unwrap();
        r.add_msg("a", "old", Some(t0));
        r.add_msg("b", "new", Some(t0 + chrono::Duration::seconds(100)));
        assert_eq!(r.ready_set().len(), 2);

        let expired = r.expire_msgs(Some(t0 + chrono::Duration::seconds(120)));
        assert_eq!(expired, 1);
        assert!(!r.ready_set().contains("a"));
        assert!(r.ready_set().contains("b"));
        assert_consistent(&r);
    }

    #[test]
    fn readd_for_unknown_recipient_is_ignored() {
        let mut r = presence();
        r.readd_msg("nobody", "msg", None);
        assert!(r.is_empty());
        assert_eq!(r.on_granted("nobody"), AuthAction::None);
        assert_eq!(r.on_authorization_lost("nobody", "msg"), AuthAction::None);
    }

    #[test]
    fn unknown_recipients_are_listed_sorted() {
        let mut r = presence();
        r.register("b");
        r.register("a");
        r.register("c");
        r.on_capability("c", AuthorizationStatus::Granted);
        assert_eq!(r.unknown_recipients(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn waiting_recipients_can_be_asked_again() {
        let mut r = presence();
        r.register("b");
        r.register("a");
        r.on_capability("a", AuthorizationStatus::Unknown);
        r.on_capability("b", AuthorizationStatus::Granted);
        assert_eq!(r.awaiting_recipients(), vec!["a".to_string()]);

        assert_eq!(r.on_request_expired("a"), AuthAction::RequestAuthorization);
        assert_eq!(r.on_request_expired("b"), AuthAction::None);
        assert_eq!(r.on_request_expired("nobody"), AuthAction::None);
        assert_consistent(&r);
    }

    #[test]
    fn round_robin_across_recipients() {
        let mut r = Recipients::new(QueueLimits::unbounded(), Authorization::ready());
        r.add_msg("a", "a1", None);
        r.add_msg("a", "a2", None);
        r.add_msg("b", "b1", None);
        r.add_msg("c", "c1", None);
        r.add_msg("c", "c2", None);

        let order: Vec<&str> = drain_all(&mut r).into_iter().map(|(_, m)| m).collect();
        assert_eq!(order, vec!["a1", "b1", "c1", "a2", "c2"]);
        assert!(r.ready_set().is_empty());
    }

    #[test]
    fn retried_messages_are_delivered_first() {
        let mut r = Recipients::new(QueueLimits::unbounded(), Authorization::ready());
        r.add_msg("a", "A", None);
        r.add_msg("a", "B", None);
        r.add_msg("a", "C", None);

        let a = r.get_msg("a", None).unwrap();
        let b = r.get_msg("a", None).unwrap();
        r.readd_msg("a", a, None);
        r.readd_msg("a", b, None);

        let order: Vec<&str> = drain_all(&mut r).into_iter().map(|(_, m)| m).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn throttled_loop_stops_and_resumes() {
        let mut r = Recipients::new(QueueLimits::unbounded(), Authorization::ready());
        for addr in ["a", "b", "c"] {
            r.add_msg(addr, "hi", None);
        }
        let mut throttle = Throttle::new(Some(2.0));
        let t0 = Instant::now();

        assert!(matches!(
            r.next_delivery(&mut throttle, t0),
            Delivery::Send { .. }
        ));
        assert_eq!(
            r.next_delivery(&mut throttle, t0),
            Delivery::Throttled(Duration::from_millis(500))
        );
        assert_eq!(r.next_delivery(&mut throttle, t0), Delivery::Deferred);
        assert_eq!(r.ready_set().len(), 2);

        let mut sends = vec![t0];
        let mut now = t0;
        while !r.ready_set().is_empty() {
            now = throttle.wake_at().unwrap_or(now);
            throttle.on_wake();
            match r.next_delivery(&mut throttle, now) {
                Delivery::Send { .. } => sends.push(now),
                Delivery::Throttled(_) => {}
                other => panic!("unexpected step: {:?}", other),
            }
        }

        assert_eq!(sends.len(), 3);
        for pair in sends.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(500));
        }
        assert_eq!(r.next_delivery(&mut throttle, now), Delivery::Idle);
    }

    #[test]
    fn fully_expired_recipient_is_skipped() {
        let mut r = Recipients::new(
            QueueLimits::from_config(None, Some(1)),
            Authorization::ready(),
        );
        let old = Utc::now() - chrono::Duration::seconds(3600);
        r.add_msg("stale", "gone", Some(old));
        r.add_msg("fresh", "here", None);

        let sent = drain_all(&mut r);
        assert_eq!(sent, vec![("fresh".to_string(), "here")]);
        assert!(r.ready_set().is_empty());
    }

    #[test]
    fn display_shows_state_and_queue() {
        let mut r = presence();
        r.add_msg(
            "recipient@example.com",
            "msg 1",
            Some(Utc.timestamp_opt(0, 0).unwrap()),
        );
        assert_eq!(
            r.get("recipient@example.com").unwrap().to_string(),
            "recipient@example.com [UNKNOWN]: 0: msg 1"
        );
    }
}
