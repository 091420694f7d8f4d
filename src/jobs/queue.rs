//! Per-job message queue.
//!
//! Waiting messages are ordered by `(priority, enqueue sequence)`. A message
//! is eligible when it is due and no other message to the same phone is in
//! flight. Retries re-enter with a fresh sequence number but reuse their slot:
//! the queue never holds more messages than it was built with.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use super::model::{MessageStatus, QueuedMessage};

/// What the queue can offer at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePeek {
    /// A message is eligible now.
    Ready,
    /// Nothing eligible before this instant.
    NotBefore(DateTime<Utc>),
    /// Waiting messages exist but their phones are all in flight.
    Blocked,
    /// Nothing waiting.
    Empty,
}

#[derive(Debug)]
pub struct MessageQueue {
    messages: Vec<QueuedMessage>,
    /// (priority, seq) → message index.
    waiting: BTreeMap<(i32, u64), usize>,
    in_flight: HashSet<String>,
    next_seq: u64,
}

impl MessageQueue {
    /// Build a queue; every message starts waiting, in the given order.
    pub fn new(messages: Vec<QueuedMessage>) -> Self {
        let mut queue = Self {
            messages,
            waiting: BTreeMap::new(),
            in_flight: HashSet::new(),
            next_seq: 0,
        };
        for idx in 0..queue.messages.len() {
            queue.enqueue(idx);
        }
        queue
    }

    fn enqueue(&mut self, idx: usize) {
        let key = (self.messages[idx].priority, self.next_seq);
        self.next_seq += 1;
        self.waiting.insert(key, idx);
    }

    fn first_eligible(&self, now: DateTime<Utc>) -> Result<(i32, u64), QueuePeek> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for (key, &idx) in &self.waiting {
            let msg = &self.messages[idx];
            if self.in_flight.contains(&msg.phone) {
                continue;
            }
            match msg.scheduled_at {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => return Ok(*key),
            }
        }
        Err(match earliest {
            Some(at) => QueuePeek::NotBefore(at),
            None if self.waiting.is_empty() => QueuePeek::Empty,
            None => QueuePeek::Blocked,
        })
    }

    pub fn peek(&self, now: DateTime<Utc>) -> QueuePeek {
        match self.first_eligible(now) {
            Ok(_) => QueuePeek::Ready,
            Err(peek) => peek,
        }
    }

    /// Take the next eligible message, mark it `sending` and its phone in flight.
    pub fn take_next(&mut self, now: DateTime<Utc>) -> Option<usize> {
        let key = self.first_eligible(now).ok()?;
        let idx = self.waiting.remove(&key)?;
        let msg = &mut self.messages[idx];
        msg.status = MessageStatus::Sending;
        msg.updated_at = now;
        self.in_flight.insert(msg.phone.clone());
        Some(idx)
    }

    /// Release the phone of a message whose attempt returned.
    pub fn finish(&mut self, idx: usize) {
        let phone = &self.messages[idx].phone;
        self.in_flight.remove(phone);
    }

    /// Put a message back in line after a failed attempt.
    pub fn requeue(&mut self, idx: usize) {
        self.enqueue(idx);
    }

    /// Remove every waiting message (not in flight) and return their indices.
    pub fn drain_waiting(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.waiting).into_values().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn get(&self, idx: usize) -> &QueuedMessage {
        &self.messages[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut QueuedMessage {
        &mut self.messages[idx]
    }

    pub fn messages(&self) -> &[QueuedMessage] {
        &self.messages
    }
}
