use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    domain::{EnvelopeId, Priority, UserId},
    handler::Handler,
    messaging::{port::ReplyTarget, types::Payload},
};

/// Per-enqueue overrides. Unset fields fall back to the queue defaults.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub max_age: Option<Duration>,
    pub dedup_key: Option<String>,
    /// Route the handler call through the breaker of this collaborator.
    pub breaker: Option<String>,
    /// Originating conversation, used for failure notices.
    pub reply: Option<ReplyTarget>,
}

impl EnqueueOptions {
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    pub fn reply(mut self, reply: ReplyTarget) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn max_age(mut self, d: Duration) -> Self {
        self.max_age = Some(d);
        self
    }
}

/// Unit of scheduled work, owned by the queue manager once enqueued.
pub(crate) struct Envelope {
    pub id: EnvelopeId,
    pub user: UserId,
    /// Priority at enqueue time; retries are re-inserted one tier above it.
    pub base_priority: Priority,
    pub priority: Priority,
    pub payload: Payload,
    pub handler: Arc<dyn Handler>,
    pub reply: Option<ReplyTarget>,
    pub breaker: Option<String>,
    pub created_at: Instant,
    /// Retry delay; the envelope is not drained before this instant.
    pub not_before: Option<Instant>,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub max_age: Duration,
}

impl Envelope {
    pub fn is_due(&self, now: Instant) -> bool {
        self.not_before.map(|t| now >= t).unwrap_or(true)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.max_age
    }
}
