//! Inbound-event pipeline for the booking bot.
//!
//! Admission shaping, per-user priority scheduling with retry and dead
//! letters, circuit breakers and error classification. Framework-agnostic:
//! the chat platform lives behind [`messaging::port::MessagingPort`] in an
//! adapter crate.

pub mod breaker;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod formatting;
pub mod handler;
pub mod logging;
pub mod messaging;
pub mod pipeline;
pub mod scheduler;
pub mod shaper;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
