//! Centralized error classification.
//!
//! Every terminal handler failure passes through [`ErrorClassifier::handle`],
//! which records it, turns it into a short user-facing message, tries to tell
//! the user, and announces it on the event bus.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::{
    config::ClassifierConfig,
    events::{EventBus, PipelineEvent},
    formatting::{escape_html, truncate_text},
    messaging::port::ReplyTarget,
    Error,
};

const MAX_MESSAGE_LEN: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Connection,
    RateLimit,
    Permission,
    Collaborator,
    Generic,
}

#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub message: String,
    pub trace: String,
    pub timestamp: DateTime<Utc>,
    pub collaborator: Option<String>,
    pub class: ErrorClass,
}

struct Rule {
    class: ErrorClass,
    pattern: Regex,
}

/// Ordered rule table; the first matching rule wins.
fn default_rules() -> Vec<Rule> {
    const RULES: &[(ErrorClass, &str)] = &[
        (
            ErrorClass::Timeout,
            r"(?i)timed?[ _-]?out|etimedout|deadline exceeded",
        ),
        (
            ErrorClass::Connection,
            r"(?i)econnrefused|connection refused|econnreset|connection reset|network is unreachable",
        ),
        (
            ErrorClass::RateLimit,
            r"(?i)\b429\b|too many requests|rate[ _-]?limit|retry after|flood",
        ),
        (
            ErrorClass::Permission,
            r"(?i)\b403\b|forbidden|permission denied|not authori[sz]ed|unauthori[sz]ed",
        ),
    ];

    RULES
        .iter()
        .filter_map(|(class, pat)| match Regex::new(pat) {
            Ok(pattern) => Some(Rule {
                class: *class,
                pattern,
            }),
            Err(e) => {
                tracing::error!(pattern = pat, "invalid classifier rule: {e}");
                None
            }
        })
        .collect()
}

/// User-facing message for a classified error.
pub fn user_message(class: ErrorClass, collaborator: Option<&str>) -> String {
    match class {
        ErrorClass::Timeout => "⏱ The request timed out. Please try again.".to_string(),
        ErrorClass::Connection => {
            "🔌 Connection error. Please try again in a moment.".to_string()
        }
        ErrorClass::RateLimit => {
            "🐢 Too many requests. Please wait a little before trying again.".to_string()
        }
        ErrorClass::Permission => "🚫 Permission denied.".to_string(),
        ErrorClass::Collaborator => format!(
            "⚠️ {} encountered an issue. Please try again later.",
            collaborator.unwrap_or("A service")
        ),
        ErrorClass::Generic => "❌ Something went wrong. Please try again.".to_string(),
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ClassifierStats {
    pub total: u64,
    pub by_class: HashMap<ErrorClass, u64>,
    pub by_collaborator: HashMap<String, u64>,
    pub notify_failures: u64,
}

#[derive(Default)]
struct ClassifierState {
    global: VecDeque<ErrorRecord>,
    per_collaborator: HashMap<String, VecDeque<ErrorRecord>>,
    stats: ClassifierStats,
}

pub struct ErrorClassifier {
    cfg: ClassifierConfig,
    rules: Vec<Rule>,
    bus: EventBus,
    state: Mutex<ClassifierState>,
}

impl ErrorClassifier {
    pub fn new(cfg: ClassifierConfig, bus: EventBus) -> Self {
        Self {
            cfg,
            rules: default_rules(),
            bus,
            state: Mutex::new(ClassifierState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClassifierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify without side effects.
    pub fn classify(&self, err: &Error, collaborator: Option<&str>) -> ErrorClass {
        if err.is_timeout() {
            return ErrorClass::Timeout;
        }
        let text = err.to_string();
        if let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(&text)) {
            return rule.class;
        }
        if collaborator.is_some() {
            ErrorClass::Collaborator
        } else {
            ErrorClass::Generic
        }
    }

    /// Record, message the user (best-effort) and publish `error-handled`.
    ///
    /// `collaborator` defaults to the name carried by the error itself.
    /// Returns the user-facing message.
    pub async fn handle(
        &self,
        err: &Error,
        reply: Option<&ReplyTarget>,
        collaborator: Option<&str>,
    ) -> String {
        let collaborator = collaborator.or_else(|| err.collaborator_name());
        let class = self.classify(err, collaborator);
        let message = user_message(class, collaborator);

        self.record(ErrorRecord {
            message: truncate_text(&err.to_string(), MAX_MESSAGE_LEN),
            trace: format!("{err:?}"),
            timestamp: Utc::now(),
            collaborator: collaborator.map(str::to_string),
            class,
        });

        if let Some(reply) = reply {
            if let Err(e) = reply.send_html(&escape_html(&message)).await {
                tracing::warn!(chat = %reply.chat_id, "failed to deliver error notice: {e}");
                self.lock().stats.notify_failures += 1;
            }
        }

        self.bus.publish(PipelineEvent::ErrorHandled {
            collaborator: collaborator.map(str::to_string),
            error: truncate_text(&err.to_string(), MAX_MESSAGE_LEN),
            user_message: message.clone(),
        });

        message
    }

    fn record(&self, rec: ErrorRecord) {
        let mut st = self.lock();
        st.stats.total += 1;
        *st.stats.by_class.entry(rec.class).or_default() += 1;

        match rec.collaborator.clone() {
            Some(name) => {
                *st.stats.by_collaborator.entry(name.clone()).or_default() += 1;
                let cap = self.cfg.per_collaborator_capacity.max(1);
                let buf = st.per_collaborator.entry(name).or_default();
                push_bounded(buf, rec, cap);
            }
            None => {
                let cap = self.cfg.global_capacity.max(1);
                push_bounded(&mut st.global, rec, cap);
            }
        }
    }

    /// Most recent errors, newest last. `None` selects the global buffer.
    pub fn recent_errors(&self, collaborator: Option<&str>, limit: usize) -> Vec<ErrorRecord> {
        let st = self.lock();
        let buf = match collaborator {
            Some(name) => match st.per_collaborator.get(name) {
                Some(b) => b,
                None => return Vec::new(),
            },
            None => &st.global,
        };
        let skip = buf.len().saturating_sub(limit);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> ClassifierStats {
        self.lock().stats.clone()
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}
