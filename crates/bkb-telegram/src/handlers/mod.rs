//! Routing from normalized payloads to pipeline handlers.
//!
//! Booking flows live outside this crate and plug in by command name or
//! callback-data prefix. The built-ins cover the main menu, help, FAQ and the
//! fallback reply.

use std::{collections::HashMap, sync::Arc};

use bkb_core::{handler::Handler, messaging::types::Payload};

mod builtin;

pub use builtin::{
    IgnoreCallback, MainMenu, StaticReply, FALLBACK_TEXT, FAQ_TEXT, HELP_TEXT, MENU_ITEMS,
};

/// A handler plus the breaker its calls go through, if any.
#[derive(Clone)]
pub struct Route {
    pub handler: Arc<dyn Handler>,
    pub breaker: Option<String>,
}

impl Route {
    fn plain(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            breaker: None,
        }
    }
}

pub struct HandlerRegistry {
    commands: HashMap<String, Route>,
    callbacks: HashMap<String, Route>,
    /// Reply-keyboard labels standing in for commands ("FAQ / TOS" -> faq).
    aliases: HashMap<String, String>,
    /// Free text that is not a menu label (e.g. a multi-step booking form).
    text: Option<Route>,
    fallback: Route,
    ignore: Route,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HandlerRegistry {
    /// Empty registry: everything resolves to the fallback reply.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            callbacks: HashMap::new(),
            aliases: HashMap::new(),
            text: None,
            fallback: Route::plain(Arc::new(StaticReply::fallback())),
            ignore: Route::plain(Arc::new(IgnoreCallback)),
        }
    }

    /// `/start`, `/help`, `/faq` and the menu labels.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new()
            .command("start", Arc::new(MainMenu))
            .command("menu", Arc::new(MainMenu))
            .command("help", Arc::new(StaticReply::help()))
            .command("faq", Arc::new(StaticReply::faq()));
        for (label, cmd) in MENU_ITEMS {
            reg.aliases.insert((*label).to_string(), (*cmd).to_string());
        }
        reg
    }

    pub fn command(mut self, name: &str, handler: Arc<dyn Handler>) -> Self {
        self.commands
            .insert(name.to_lowercase(), Route::plain(handler));
        self
    }

    /// Register a command whose handler calls go through the `breaker` circuit.
    pub fn command_guarded(mut self, name: &str, handler: Arc<dyn Handler>, breaker: &str) -> Self {
        self.commands.insert(
            name.to_lowercase(),
            Route {
                handler,
                breaker: Some(breaker.to_string()),
            },
        );
        self
    }

    /// Route callback data `"{prefix}:..."` to `handler`.
    pub fn callback(mut self, prefix: &str, handler: Arc<dyn Handler>) -> Self {
        self.callbacks
            .insert(prefix.to_string(), Route::plain(handler));
        self
    }

    pub fn callback_guarded(mut self, prefix: &str, handler: Arc<dyn Handler>, breaker: &str) -> Self {
        self.callbacks.insert(
            prefix.to_string(),
            Route {
                handler,
                breaker: Some(breaker.to_string()),
            },
        );
        self
    }

    pub fn text(mut self, handler: Arc<dyn Handler>) -> Self {
        self.text = Some(Route::plain(handler));
        self
    }

    pub fn fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = Route::plain(handler);
        self
    }

    fn command_route(&self, name: &str) -> Route {
        self.commands
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn resolve(&self, payload: &Payload) -> Route {
        match payload {
            Payload::Command(c) => self.command_route(&c.name),
            Payload::Call(c) => self.command_route(&c.name),
            Payload::Callback(q) => match q.data.split_once(':') {
                Some(("menu", cmd)) => self.command_route(cmd),
                _ => payload
                    .interaction_id()
                    .and_then(|prefix| self.callbacks.get(prefix).cloned())
                    .unwrap_or_else(|| self.ignore.clone()),
            },
            Payload::Text(t) => match self.aliases.get(t.text.trim()) {
                Some(cmd) => self.command_route(cmd),
                None => self.text.clone().unwrap_or_else(|| self.fallback.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMessenger;
    use bkb_core::{
        domain::{ChatId, EnvelopeId, UserId},
        handler::{handler_fn, HandlerContext},
        messaging::port::ReplyTarget,
    };
    use tokio_util::sync::CancellationToken;

    fn noop(name: &'static str) -> Arc<dyn Handler> {
        handler_fn(name, |_ctx, _payload| async { Ok(()) })
    }

    fn name_of(reg: &HandlerRegistry, payload: Payload) -> String {
        reg.resolve(&payload).handler.name().to_string()
    }

    #[test]
    fn builtins_cover_menu_help_faq_and_fallback() {
        let reg = HandlerRegistry::with_builtins();
        assert_eq!(name_of(&reg, Payload::command("start", "")), "menu");
        assert_eq!(name_of(&reg, Payload::command("HELP", "")), "help");
        assert_eq!(name_of(&reg, Payload::text("FAQ / TOS")), "faq");
        assert_eq!(name_of(&reg, Payload::callback("1", "menu:faq")), "faq");
        assert_eq!(name_of(&reg, Payload::text("hello there")), "fallback");
        assert_eq!(name_of(&reg, Payload::command("unknown", "")), "fallback");
        assert_eq!(name_of(&reg, Payload::callback("1", "slot:none")), "ignore-callback");
        // Menu button for a flow that is not plugged in.
        assert_eq!(name_of(&reg, Payload::callback("1", "menu:book")), "fallback");
    }

    #[test]
    fn external_flows_plug_in_by_name_and_prefix() {
        let reg = HandlerRegistry::with_builtins()
            .command_guarded("book", noop("booking"), "calendar")
            .callback("slot", noop("slot-picker"))
            .text(noop("booking-form"));

        let route = reg.resolve(&Payload::text("Create a booking"));
        assert_eq!(route.handler.name(), "booking");
        assert_eq!(route.breaker.as_deref(), Some("calendar"));

        assert_eq!(
            name_of(&reg, Payload::callback("9", "slot:2026-05-01:10:00")),
            "slot-picker"
        );
        assert_eq!(name_of(&reg, Payload::text("Jane")), "booking-form");
    }

    fn ctx(fake: Arc<FakeMessenger>) -> HandlerContext {
        HandlerContext {
            user: UserId(5),
            envelope: EnvelopeId(1),
            attempt: 1,
            reply: Some(ReplyTarget::new(ChatId(5), fake)),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn main_menu_sends_command_buttons() {
        let fake = Arc::new(FakeMessenger::default());
        MainMenu
            .handle(&ctx(fake.clone()), &Payload::command("start", ""))
            .await
            .unwrap();
        assert_eq!(
            fake.keyboards.lock().unwrap()[0],
            vec!["menu:book", "menu:bookings", "menu:faq"]
        );
    }

    #[tokio::test]
    async fn static_replies_send_their_text() {
        let fake = Arc::new(FakeMessenger::default());
        let c = ctx(fake.clone());
        StaticReply::faq().handle(&c, &Payload::text("FAQ / TOS")).await.unwrap();
        StaticReply::fallback().handle(&c, &Payload::text("hi")).await.unwrap();
        assert_eq!(fake.sent_texts(), vec![FAQ_TEXT.to_string(), FALLBACK_TEXT.to_string()]);
    }
}
