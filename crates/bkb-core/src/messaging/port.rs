use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::InlineKeyboard,
    Result,
};

/// Cross-messenger port.
///
/// The pipeline only needs to talk back to the originating conversation (error
/// notices, rate-limit notices); business handlers use the richer calls.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}

/// The originating conversation of an event, used for best-effort replies.
#[derive(Clone)]
pub struct ReplyTarget {
    pub chat_id: ChatId,
    pub messenger: Arc<dyn MessagingPort>,
}

impl ReplyTarget {
    pub fn new(chat_id: ChatId, messenger: Arc<dyn MessagingPort>) -> Self {
        Self { chat_id, messenger }
    }

    pub async fn send_html(&self, html: &str) -> Result<MessageRef> {
        self.messenger.send_html(self.chat_id, html).await
    }
}

impl std::fmt::Debug for ReplyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTarget")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}
