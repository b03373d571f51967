use std::sync::Arc;

use async_trait::async_trait;

use bkb_core::{
    domain::ChatId,
    events::{PipelineEvent, Subscribe},
    formatting::escape_html,
    messaging::port::MessagingPort,
};

/// Forwards dead letters and tripped breakers to the operator chat.
pub struct AdminAlerts {
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
}

impl AdminAlerts {
    pub fn new(messenger: Arc<dyn MessagingPort>, chat_id: ChatId) -> Self {
        Self { messenger, chat_id }
    }

    fn render(event: &PipelineEvent) -> Option<String> {
        match event {
            PipelineEvent::DeadLettered {
                user,
                envelope,
                reason,
                error,
            } => Some(format!(
                "📭 <b>Dead letter</b>\nUser: <code>{user}</code>\nEnvelope: <code>{envelope}</code>\nReason: {}\nError: {}",
                reason.as_str(),
                escape_html(error.as_deref().unwrap_or("-")),
            )),
            PipelineEvent::CircuitTripped { name, failures } => Some(format!(
                "🔌 <b>Circuit opened</b>\n{} failed {failures} times",
                escape_html(name),
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl Subscribe for AdminAlerts {
    async fn on_event(&self, event: &PipelineEvent) {
        let Some(html) = Self::render(event) else {
            return;
        };
        if let Err(e) = self.messenger.send_html(self.chat_id, &html).await {
            tracing::warn!(chat = %self.chat_id, "admin alert not delivered: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "admin-alerts"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMessenger;
    use bkb_core::{
        domain::{EnvelopeId, Priority, UserId},
        scheduler::DeadLetterReason,
    };

    #[tokio::test]
    async fn only_operational_events_are_forwarded() {
        let fake = Arc::new(FakeMessenger::default());
        let alerts = AdminAlerts::new(fake.clone(), ChatId(-100));

        alerts
            .on_event(&PipelineEvent::Enqueued {
                user: UserId(1),
                envelope: EnvelopeId(1),
                priority: Priority::NORMAL,
                depth: 1,
            })
            .await;
        alerts
            .on_event(&PipelineEvent::DeadLettered {
                user: UserId(1),
                envelope: EnvelopeId(2),
                reason: DeadLetterReason::MaxRetriesExceeded,
                error: Some("payments: <502>".into()),
            })
            .await;

        let sent = fake.sends.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(-100));
        assert!(sent[0].1.contains("env-2"));
        assert!(sent[0].1.contains("max_retries_exceeded"));
        assert!(sent[0].1.contains("&lt;502&gt;"));
    }
}
