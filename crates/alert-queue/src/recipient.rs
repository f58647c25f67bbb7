//! Outbound message buffer for a single recipient.
//!
//! Messages leave from the front and enter at the back. Messages that were
//! taken for delivery but failed are re-added in front of every message that
//! was never attempted, so the queue is always two FIFO segments glued
//! together:
//!
//! ```text
//!              retry boundary (first never-attempted message)
//!                    |
//!                    v
//! get_msg() <-  A  B | C  D  E  F  <- add_msg()
//!              retried  fresh
//! ```

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

/// Wall-clock time attached to every queued message.
pub type Timestamp = DateTime<Utc>;

/// Emptiness of a queue before and after a mutation.
///
/// The coordinator uses this to keep ready-set membership in step with the
/// queue without the queue knowing about the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChange {
    pub was_empty: bool,
    pub is_empty: bool,
}

impl QueueChange {
    /// The mutation took the queue from empty to non-empty.
    pub fn became_non_empty(&self) -> bool {
        self.was_empty && !self.is_empty
    }

    /// The mutation drained the queue.
    pub fn became_empty(&self) -> bool {
        !self.was_empty && self.is_empty
    }
}

/// A bounded, age-expiring message queue with a retry segment at the front.
#[derive(Debug, Clone)]
pub struct RecipientQueue<M> {
    msgs: VecDeque<(Timestamp, M)>,
    capacity: Option<usize>,
    max_age: Option<Duration>,
    /// Index of the first message that has never been re-added.
    readd_idx: usize,
}

impl<M> RecipientQueue<M> {
    /// Create a queue.
    ///
    /// A capacity of zero and a non-positive `max_age` both mean "no limit".
    pub fn new(capacity: Option<usize>, max_age: Option<Duration>) -> Self {
        let capacity = capacity.filter(|c| *c > 0);
        let max_age = max_age.filter(|a| *a > Duration::zero());
        Self {
            msgs: match capacity {
                Some(c) => VecDeque::with_capacity(c),
                None => VecDeque::new(),
            },
            capacity,
            max_age,
            readd_idx: 0,
        }
    }

    /// Create a queue with no capacity or age limit.
    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Number of re-added messages at the front of the queue.
    pub fn retry_boundary(&self) -> usize {
        self.readd_idx
    }

    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|c| self.msgs.len() >= c)
    }

    /// Iterate over `(timestamp, message)` pairs, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (&Timestamp, &M)> {
        self.msgs.iter().map(|(t, m)| (t, m))
    }

    /// Append a message to the back of the queue.
    ///
    /// When the queue is full the oldest message is dropped to make room.
    /// Expired messages are removed relative to `timestamp` afterwards.
    pub fn add_msg(&mut self, msg: M, timestamp: Option<Timestamp>) -> QueueChange {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let was_empty = self.msgs.is_empty();

        if self.is_full() {
            self.msgs.pop_front();
            self.readd_idx = self.readd_idx.saturating_sub(1);
            trace!("queue full, dropped oldest message");
        }
        self.msgs.push_back((timestamp, msg));
        self.expire_msgs(Some(timestamp));

        QueueChange {
            was_empty,
            is_empty: self.msgs.is_empty(),
        }
    }

    /// Re-add a message whose delivery failed.
    ///
    /// The message is placed after every previously re-added message and in
    /// front of every message that was never taken. A full queue drops the
    /// re-added message instead of evicting a younger one.
    ///
    /// Without an explicit timestamp the message borrows the timestamp of the
    /// oldest never-taken message, or of the youngest re-added message when
    /// there are only re-added messages, or "now" when the queue is empty.
    pub fn readd_msg(&mut self, msg: M, timestamp: Option<Timestamp>) -> QueueChange {
        let was_empty = self.msgs.is_empty();

        if self.is_full() {
            trace!("queue full, dropped re-added message");
            return QueueChange {
                was_empty,
                is_empty: was_empty,
            };
        }

        let timestamp = timestamp.unwrap_or_else(|| {
            if self.msgs.is_empty() {
                Utc::now()
            } else if let Some((t, _)) = self.msgs.get(self.readd_idx) {
                *t
            } else {
                // only re-added messages are queued
                self.msgs.back().map(|(t, _)| *t).unwrap_or_else(Utc::now)
            }
        });

        self.msgs.insert(self.readd_idx, (timestamp, msg));
        self.readd_idx += 1;
        self.expire_msgs(Some(timestamp));

        QueueChange {
            was_empty,
            is_empty: self.msgs.is_empty(),
        }
    }

    /// Remove and return the oldest message, expiring stale ones first.
    pub fn get_msg(&mut self, now: Option<Timestamp>) -> (Option<M>, QueueChange) {
        let was_empty = self.msgs.is_empty();
        self.expire_msgs(now);

        let msg = self.msgs.pop_front().map(|(_, m)| m);
        if msg.is_some() {
            self.readd_idx = self.readd_idx.saturating_sub(1);
        }

        (
            msg,
            QueueChange {
                was_empty,
                is_empty: self.msgs.is_empty(),
            },
        )
    }

    /// Drop messages older than `max_age` relative to `now`.
    ///
    /// Returns the number of messages removed.
    pub fn expire_msgs(&mut self, now: Option<Timestamp>) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };
        let now = now.unwrap_or_else(Utc::now);

        let mut expired = 0;
        while let Some((t, _)) = self.msgs.front() {
            if now.signed_duration_since(*t) <= max_age {
                break;
            }
            self.msgs.pop_front();
            self.readd_idx = self.readd_idx.saturating_sub(1);
            expired += 1;
        }

        if expired > 0 {
            trace!(expired, "expired queued messages");
        }
        expired
    }
}

impl<M: fmt::Display> fmt::Display for RecipientQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msgs.len() {
            0 => write!(f, "<no-messages>"),
            1 => {
                let (t, m) = &self.msgs[0];
                write!(f, "{}: {}", t.timestamp(), m)
            }
            _ => {
                for (t, m) in &self.msgs {
                    write!(f, "\n    {}: {}", t.timestamp(), m)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> Option<Timestamp> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn drain(q: &mut RecipientQueue<&'static str>, now: Option<Timestamp>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let (Some(m), _) = q.get_msg(now) {
            out.push(m);
        }
        out
    }

    #[test]
    fn unbounded_queue_keeps_everything() {
        let mut q = RecipientQueue::unbounded();
        for (i, m) in ["msg 1", "msg 2", "msg 3", "msg 4"].into_iter().enumerate() {
            q.add_msg(m, at(i as i64));
            assert_eq!(q.len(), i + 1);
        }
        assert_eq!(drain(&mut q, None), vec!["msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn bounded_queue_keeps_last_n_in_order() {
        let mut q = RecipientQueue::new(Some(2), None);
        let lens: Vec<usize> = ["msg 1", "msg 2", "msg 3", "msg 4"]
            .into_iter()
            .map(|m| {
                q.add_msg(m, None);
                q.len()
            })
            .collect();
        assert_eq!(lens, vec![1, 2, 2, 2]);
        assert_eq!(drain(&mut q, None), vec!["msg 3", "msg 4"]);
    }

    #[test]
    fn capacity_never_exceeded_for_any_prefix() {
        for cap in 1..6usize {
            let mut q = RecipientQueue::new(Some(cap), None);
            for i in 0..20usize {
                q.add_msg(i, None);
                assert!(q.len() <= cap);
                let expected: Vec<usize> = (i.saturating_sub(cap - 1)..=i).collect();
                let actual: Vec<usize> = q.iter().map(|(_, m)| *m).collect();
                assert_eq!(actual, expected);
            }
        }
    }

    #[test]
    fn zero_limits_mean_unbounded() {
        let q: RecipientQueue<()> = RecipientQueue::new(Some(0), Some(Duration::seconds(-5)));
        assert_eq!(q.capacity(), None);
        assert_eq!(q.max_age(), None);
    }

    #[test]
    fn readd_to_empty_queue_uses_given_timestamp() {
        let mut q = RecipientQueue::unbounded();
        let change = q.readd_msg("msg 1", at(1));
        assert!(change.became_non_empty());
        assert_eq!(q.to_string(), "1: msg 1");
        assert_eq!(q.get_msg(None).0, Some("msg 1"));
        assert_eq!(q.retry_boundary(), 0);
    }

    #[test]
    fn readd_borrows_timestamps_from_neighbours() {
        let mut q = RecipientQueue::unbounded();
        q.add_msg("msg 3", at(3));
        q.add_msg("msg 4", at(4));

        // no re-added messages yet: borrow the oldest fresh timestamp
        q.readd_msg("msg 1", None);
        assert_eq!(q.to_string(), "\n    3: msg 1\n    3: msg 3\n    4: msg 4");
        assert_eq!(q.get_msg(None).0, Some("msg 1"));

        q.readd_msg("msg 1", at(1));
        assert_eq!(q.to_string(), "\n    1: msg 1\n    3: msg 3\n    4: msg 4");

        // goes behind "msg 1" and borrows the timestamp of "msg 3"
        q.readd_msg("msg 2", None);
        assert_eq!(
            q.to_string(),
            "\n    1: msg 1\n    3: msg 2\n    3: msg 3\n    4: msg 4"
        );

        let mut out = Vec::new();
        while let (Some(m), _) = q.get_msg(None) {
            out.push(m);
            assert!(q.retry_boundary() <= q.len());
        }
        assert_eq!(out, vec!["msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn readd_with_only_retried_messages_uses_youngest_retry_timestamp() {
        let mut q = RecipientQueue::unbounded();
        q.readd_msg("a", at(10));
        q.readd_msg("b", at(20));
        q.readd_msg("c", None);
        let stamps: Vec<i64> = q.iter().map(|(t, _)| t.timestamp()).collect();
        assert_eq!(stamps, vec![10, 20, 20]);
        assert_eq!(q.retry_boundary(), 3);
    }

    #[test]
    fn retries_precede_fresh_messages_in_retry_order() {
        let mut q = RecipientQueue::unbounded();
        q.add_msg("A", at(1));
        q.add_msg("B", at(2));
        q.add_msg("C", at(3));

        let a = q.get_msg(None).0.unwrap();
        let b = q.get_msg(None).0.unwrap();
        q.add_msg("D", at(4));
        q.readd_msg(a, None);
        q.readd_msg(b, None);

        assert_eq!(q.retry_boundary(), 2);
        assert_eq!(drain(&mut q, None), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn readd_into_full_queue_is_dropped() {
        let mut q = RecipientQueue::new(Some(2), None);
        q.add_msg("young 1", at(5));
        q.add_msg("young 2", at(6));
        let change = q.readd_msg("old", at(1));
        assert!(!change.became_non_empty());
        assert_eq!(q.len(), 2);
        assert_eq!(q.retry_boundary(), 0);
        assert_eq!(drain(&mut q, None), vec!["young 1", "young 2"]);
    }

    #[test]
    fn overflow_eviction_keeps_retry_boundary_in_range() {
        let mut q = RecipientQueue::new(Some(2), None);
        q.readd_msg("retry", at(1));
        q.add_msg("fresh 1", at(2));
        q.add_msg("fresh 2", at(3));
        // "retry" was evicted, so no re-added message remains
        assert_eq!(q.retry_boundary(), 0);
        q.get_msg(None);
        q.readd_msg("fresh 1", None);
        assert_eq!(drain(&mut q, None), vec!["fresh 1", "fresh 2"]);
    }

    #[test]
    fn messages_older_than_max_age_expire() {
        let mut q = RecipientQueue::new(None, Some(Duration::seconds(5000)));
        for i in (0..11000).step_by(1000) {
            q.add_msg(i, at(i));
        }
        let kept: Vec<i64> = q.iter().map(|(_, m)| *m).collect();
        assert_eq!(kept, vec![5000, 6000, 7000, 8000, 9000, 10000]);

        let mut out = Vec::new();
        while let (Some(m), _) = q.get_msg(at(10000)) {
            out.push(m);
        }
        assert_eq!(out, vec![5000, 6000, 7000, 8000, 9000, 10000]);
    }

    #[test]
    fn expired_message_is_not_returned() {
        let mut q = RecipientQueue::new(None, Some(Duration::seconds(60)));
        q.add_msg("stale", at(0));
        assert_eq!(q.len(), 1);
        assert_eq!(q.expire_msgs(at(60)), 0);

        let (msg, change) = q.get_msg(at(61));
        assert_eq!(msg, None);
        assert!(change.became_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn expiry_shrinks_retry_segment() {
        let mut q = RecipientQueue::new(None, Some(Duration::seconds(10)));
        q.readd_msg("r1", at(0));
        q.readd_msg("r2", at(1));
        q.add_msg("f1", at(5));
        assert_eq!(q.retry_boundary(), 2);

        assert_eq!(q.expire_msgs(at(11)), 1);
        assert_eq!(q.retry_boundary(), 1);
        assert_eq!(q.expire_msgs(at(100)), 2);
        assert_eq!(q.retry_boundary(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn display_formats() {
        let mut q = RecipientQueue::unbounded();
        assert_eq!(q.to_string(), "<no-messages>");
        q.add_msg("msg 1", at(0));
        assert_eq!(q.to_string(), "0: msg 1");
        q.add_msg("msg 2", at(1));
        assert_eq!(q.to_string(), "\n    0: msg 1\n    1: msg 2");
    }
}
