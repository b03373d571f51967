use async_trait::async_trait;

use super::{PipelineEvent, Subscribe};

/// Renders every pipeline event as a structured log line.
#[derive(Default)]
pub struct LogSubscriber;

impl LogSubscriber {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogSubscriber {
    async fn on_event(&self, e: &PipelineEvent) {
        match e {
            PipelineEvent::Enqueued {
                user,
                envelope,
                priority,
                depth,
            } => {
                tracing::debug!(%user, %envelope, priority = priority.0, depth, "[enqueued]");
            }
            PipelineEvent::DuplicateRejected { user, dedup_key } => {
                tracing::debug!(%user, dedup_key, "[duplicate-rejected]");
            }
            PipelineEvent::ProcessingStarted {
                user,
                envelope,
                attempt,
            } => {
                tracing::debug!(%user, %envelope, attempt, "[processing-started]");
            }
            PipelineEvent::ProcessingCompleted {
                user,
                envelope,
                elapsed_ms,
            } => {
                tracing::debug!(%user, %envelope, elapsed_ms, "[processing-completed]");
            }
            PipelineEvent::RetryScheduled {
                user,
                envelope,
                attempt,
                delay_ms,
                error,
            } => {
                tracing::info!(%user, %envelope, attempt, delay_ms, error, "[retry-scheduled]");
            }
            PipelineEvent::DeadLettered {
                user,
                envelope,
                reason,
                error,
            } => {
                tracing::warn!(%user, %envelope, reason = reason.as_str(), error = error.as_deref().unwrap_or("-"), "[dead-lettered]");
            }
            PipelineEvent::RateLimited {
                user,
                tier,
                reset_in_secs,
            } => {
                tracing::info!(%user, tier = tier.as_str(), reset_in_secs, "[rate-limited]");
            }
            PipelineEvent::CircuitTripped { name, failures } => {
                tracing::warn!(breaker = %name, failures, "[circuit-tripped]");
            }
            PipelineEvent::ErrorHandled {
                collaborator,
                error,
                user_message,
            } => {
                tracing::warn!(
                    collaborator = collaborator.as_deref().unwrap_or("-"),
                    error,
                    user_message,
                    "[error-handled]"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
