use async_trait::async_trait;

use bkb_core::{
    handler::{Handler, HandlerContext},
    messaging::types::{InlineButton, InlineKeyboard, Payload},
    Error, Result,
};

pub const FALLBACK_TEXT: &str = "Use the menu to begin a booking or view FAQs.";

pub const FAQ_TEXT: &str = "eSIM support bookings run between 8:00 AM and 6:00 PM Eastern. \
Slots last 30-60 minutes and are reserved for one client at a time. \
By booking, you agree to our disclaimer and Terms of Service.";

pub const HELP_TEXT: &str = "<b>Commands</b>\n\
/start - main menu\n\
/book - create a booking\n\
/bookings - your bookings\n\
/faq - FAQ and Terms of Service\n\
/help - this message";

/// Main menu buttons: label and the command each one stands for.
pub const MENU_ITEMS: &[(&str, &str)] = &[
    ("Create a booking", "book"),
    ("My bookings", "bookings"),
    ("FAQ / TOS", "faq"),
];

pub struct MainMenu;

#[async_trait]
impl Handler for MainMenu {
    fn name(&self) -> &str {
        "menu"
    }

    async fn handle(&self, ctx: &HandlerContext, _payload: &Payload) -> Result<()> {
        let Some(reply) = &ctx.reply else {
            return Err(Error::External("menu requested without a chat".into()));
        };
        let keyboard = InlineKeyboard::new(
            MENU_ITEMS
                .iter()
                .map(|(label, cmd)| InlineButton {
                    label: (*label).to_string(),
                    callback_data: format!("menu:{cmd}"),
                })
                .collect(),
        );
        reply
            .messenger
            .send_inline_keyboard(reply.chat_id, "What would you like to do?", keyboard)
            .await?;
        Ok(())
    }
}

/// Replies with a fixed HTML text.
pub struct StaticReply {
    name: &'static str,
    html: &'static str,
}

impl StaticReply {
    pub fn help() -> Self {
        Self {
            name: "help",
            html: HELP_TEXT,
        }
    }

    pub fn faq() -> Self {
        Self {
            name: "faq",
            html: FAQ_TEXT,
        }
    }

    pub fn fallback() -> Self {
        Self {
            name: "fallback",
            html: FALLBACK_TEXT,
        }
    }
}

#[async_trait]
impl Handler for StaticReply {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, ctx: &HandlerContext, _payload: &Payload) -> Result<()> {
        ctx.reply_html(self.html).await
    }
}

/// Stale or unknown buttons: the query is already acknowledged, nothing to do.
pub struct IgnoreCallback;

#[async_trait]
impl Handler for IgnoreCallback {
    fn name(&self) -> &str {
        "ignore-callback"
    }

    async fn handle(&self, ctx: &HandlerContext, payload: &Payload) -> Result<()> {
        tracing::debug!(
            user = %ctx.user,
            interaction = payload.interaction_id().unwrap_or("-"),
            "no handler for callback"
        );
        Ok(())
    }
}
