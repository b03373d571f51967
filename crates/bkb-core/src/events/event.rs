use serde::Serialize;

use crate::{
    domain::{EnvelopeId, Priority, UserId},
    scheduler::DeadLetterReason,
    shaper::Tier,
};

/// Every event the pipeline publishes. The topic set is fixed.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum PipelineEvent {
    Enqueued {
        user: UserId,
        envelope: EnvelopeId,
        priority: Priority,
        depth: usize,
    },
    DuplicateRejected {
        user: UserId,
        dedup_key: String,
    },
    ProcessingStarted {
        user: UserId,
        envelope: EnvelopeId,
        attempt: u32,
    },
    ProcessingCompleted {
        user: UserId,
        envelope: EnvelopeId,
        elapsed_ms: u64,
    },
    RetryScheduled {
        user: UserId,
        envelope: EnvelopeId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    DeadLettered {
        user: UserId,
        envelope: EnvelopeId,
        reason: DeadLetterReason,
        error: Option<String>,
    },
    RateLimited {
        user: UserId,
        tier: Tier,
        reset_in_secs: u64,
    },
    CircuitTripped {
        name: String,
        failures: u32,
    },
    ErrorHandled {
        collaborator: Option<String>,
        error: String,
        user_message: String,
    },
}

impl PipelineEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            PipelineEvent::Enqueued { .. } => "enqueued",
            PipelineEvent::DuplicateRejected { .. } => "duplicate-rejected",
            PipelineEvent::ProcessingStarted { .. } => "processing-started",
            PipelineEvent::ProcessingCompleted { .. } => "processing-completed",
            PipelineEvent::RetryScheduled { .. } => "retry-scheduled",
            PipelineEvent::DeadLettered { .. } => "dead-lettered",
            PipelineEvent::RateLimited { .. } => "rate-limited",
            PipelineEvent::CircuitTripped { .. } => "circuit-tripped",
            PipelineEvent::ErrorHandled { .. } => "error-handled",
        }
    }
}
