use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    domain::{EnvelopeId, Priority, UserId},
    messaging::types::{EventKind, Payload},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    Expired,
    MaxRetriesExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

/// A terminal envelope. Never re-enters a queue.
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetterEntry {
    pub envelope: EnvelopeId,
    pub user: UserId,
    pub priority: Priority,
    pub kind: EventKind,
    pub reason: DeadLetterReason,
    pub error: Option<String>,
    pub attempts: u32,
    pub dead_at: DateTime<Utc>,
    #[serde(skip)]
    pub payload: Payload,
}

/// Bounded ring of dead letters; the oldest entry is evicted first.
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: VecDeque<DeadLetterEntry>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: DeadLetterEntry) {
        self.entries.push_back(entry);
        self.trim();
    }

    pub fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.iter().cloned().collect()
    }
}
