use serde::Serialize;

use crate::domain::MessageRef;

/// Normalized content of an inbound event (or of internally scheduled work).
///
/// Platform-specific fields live in the adapter crate; the pipeline only reads
/// routing metadata (command name, callback data) off these.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Internally scheduled function call (reminders, broadcasts, follow-ups).
    Call(CallRequest),
    /// Inline-button interaction.
    Callback(CallbackQuery),
    /// `/command args`.
    Command(Command),
    /// Free-form text message.
    Text(TextMessage),
}

#[derive(Clone, Debug)]
pub struct CallRequest {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub callback_id: String,
    pub data: String,
    pub message: Option<MessageRef>,
}

#[derive(Clone, Debug)]
pub struct Command {
    pub name: String,
    pub args: String,
}

#[derive(Clone, Debug)]
pub struct TextMessage {
    pub text: String,
}

/// Coarse event kind used for admission tiers and default priorities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Interaction,
    Command,
    Text,
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Call(_) => EventKind::Call,
            Payload::Callback(_) => EventKind::Interaction,
            Payload::Command(_) => EventKind::Command,
            Payload::Text(_) => EventKind::Text,
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        match self {
            Payload::Command(c) => Some(c.name.as_str()),
            _ => None,
        }
    }

    /// Callback data prefix (`slot:2026-05-01:10:00` -> `slot`).
    pub fn interaction_id(&self) -> Option<&str> {
        match self {
            Payload::Callback(q) => Some(q.data.split(':').next().unwrap_or_default()),
            _ => None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(TextMessage { text: text.into() })
    }

    pub fn command(name: impl Into<String>, args: impl Into<String>) -> Self {
        Payload::Command(Command {
            name: name.into(),
            args: args.into(),
        })
    }

    pub fn callback(callback_id: impl Into<String>, data: impl Into<String>) -> Self {
        Payload::Callback(CallbackQuery {
            callback_id: callback_id.into(),
            data: data.into(),
            message: None,
        })
    }

    pub fn call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Payload::Call(CallRequest {
            name: name.into(),
            args,
        })
    }
}

/// Inline keyboard (buttons) used by menus and booking flows.
#[derive(Clone, Debug)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_metadata_follows_variant() {
        let cmd = Payload::command("book", "tomorrow");
        assert_eq!(cmd.kind(), EventKind::Command);
        assert_eq!(cmd.command_name(), Some("book"));
        assert_eq!(cmd.interaction_id(), None);

        let cb = Payload::callback("42", "slot:2026-05-01:10:00");
        assert_eq!(cb.kind(), EventKind::Interaction);
        assert_eq!(cb.interaction_id(), Some("slot"));

        assert_eq!(Payload::text("hi").kind(), EventKind::Text);
        assert_eq!(
            Payload::call("reminder", serde_json::json!({"booking": 7})).kind(),
            EventKind::Call
        );
    }
}
