//! Handler contract between the pipeline and business logic.
//!
//! The queue manager invokes a [`Handler`] once per attempt. A handler may be
//! dropped mid-flight when it exceeds its processing timeout (the context's
//! `cancel` token fires first), and may run again on retry, so side effects
//! must be idempotent.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{EnvelopeId, UserId},
    messaging::{port::ReplyTarget, types::Payload},
    Error, Result,
};

/// Invocation context for one handler attempt.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub user: UserId,
    pub envelope: EnvelopeId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub reply: Option<ReplyTarget>,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    /// Send HTML back to the originating conversation.
    pub async fn reply_html(&self, html: &str) -> Result<()> {
        match &self.reply {
            Some(r) => r.send_html(html).await.map(|_| ()),
            None => Err(Error::External(format!(
                "{} has no originating conversation",
                self.envelope
            ))),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &HandlerContext, payload: &Payload) -> Result<()>;
}

/// Closure-backed handler. Each call builds a fresh future from owned
/// copies of the context and payload.
pub struct HandlerFn<F> {
    name: String,
    f: F,
}

impl<F> std::fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFn").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(HandlerContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &HandlerContext, payload: &Payload) -> Result<()> {
        (self.f)(ctx.clone(), payload.clone()).await
    }
}

/// Wrap a closure as a shared handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn {
        name: name.into(),
        f,
    })
}
