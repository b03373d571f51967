//! Typed publish/subscribe between the pipeline and its observers.

mod bus;
mod event;
mod log;

pub use bus::{EventBus, Subscribe};
pub use event::PipelineEvent;
pub use log::LogSubscriber;
