//! Recipients that have queued messages and an authorized channel.

use std::collections::{HashSet, VecDeque};

/// Insertion-ordered set of recipient addresses eligible for delivery.
///
/// Membership is owned by [`Recipients`](crate::Recipients); callers outside
/// this crate can only read it.
#[derive(Debug, Default, Clone)]
pub struct ReadySet {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.members.contains(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in service order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub(crate) fn insert(&mut self, address: &str) -> bool {
        if !self.members.insert(address.to_string()) {
            return false;
        }
        self.order.push_back(address.to_string());
        true
    }

    pub(crate) fn remove(&mut self, address: &str) -> bool {
        if !self.members.remove(address) {
            return false;
        }
        self.order.retain(|a| a != address);
        true
    }

    pub(crate) fn front(&self) -> Option<&str> {
        self.order.front().map(String::as_str)
    }

    /// Move `address` to the back of the service order, if it is a member.
    pub(crate) fn requeue(&mut self, address: &str) {
        if let Some(pos) = self.order.iter().position(|a| a == address) {
            if let Some(a) = self.order.remove(pos) {
                self.order.push_back(a);
            }
        }
    }
}
