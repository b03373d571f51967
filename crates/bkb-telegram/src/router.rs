use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use bkb_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::types::{CallbackQuery as CallbackPayload, Payload},
    pipeline::{InboundEvent, Pipeline, Submitted},
};

use crate::handlers::HandlerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<HandlerRegistry>,
}

/// Poll Telegram until Ctrl-C, feeding every update into the pipeline.
pub async fn run_polling(
    bot: Bot,
    pipeline: Arc<Pipeline>,
    registry: Arc<HandlerRegistry>,
) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => tracing::warn!("get_me failed: {e}"),
    }

    let state = Arc::new(AppState { pipeline, registry });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, stopping polling");
            if let Ok(done) = token.shutdown() {
                done.await;
            }
        }
    });

    dispatcher.dispatch().await;
    Ok(())
}

/// `/start@my_bot foo` -> command `start` with args `foo`; anything else is text.
pub fn parse_text(text: &str) -> Payload {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('/') {
        let (head, args) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));
        let name = head.split('@').next().unwrap_or(head);
        if !name.is_empty() {
            return Payload::command(name.to_lowercase(), args.trim());
        }
    }
    Payload::text(trimmed)
}

fn log_outcome(user: UserId, outcome: &Submitted) {
    match outcome {
        Submitted::Enqueued(id) => tracing::debug!(%user, envelope = %id, "update enqueued"),
        Submitted::Duplicate => tracing::debug!(%user, "update already seen"),
        Submitted::RateLimited(r) => {
            tracing::debug!(%user, tier = r.tier.as_str(), "update rate limited")
        }
    }
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        tracing::debug!(chat = msg.chat.id.0, "ignoring non-text message");
        return Ok(());
    };

    let user = UserId(from.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);
    let payload = parse_text(text);
    let route = state.registry.resolve(&payload);

    let mut ev = InboundEvent::new(user, chat, payload, route.handler)
        .with_dedup_key(format!("msg:{chat}:{}", msg.id.0));
    if let Some(b) = route.breaker {
        ev = ev.with_breaker(b);
    }

    let outcome = state.pipeline.submit(ev).await;
    log_outcome(user, &outcome);
    Ok(())
}

async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    // Acknowledge first so the client stops its spinner even if we reject.
    if let Err(e) = state
        .pipeline
        .messenger()
        .answer_callback_query(&q.id, None)
        .await
    {
        tracing::debug!("answer_callback_query failed: {e}");
    }

    let (Some(msg), Some(data)) = (q.message.as_ref(), q.data.clone()) else {
        return Ok(());
    };
    if data.is_empty() {
        return Ok(());
    }

    let user = UserId(q.from.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);
    let payload = Payload::Callback(CallbackPayload {
        callback_id: q.id.clone(),
        data,
        message: Some(MessageRef {
            chat_id: chat,
            message_id: MessageId(msg.id.0),
        }),
    });
    let route = state.registry.resolve(&payload);

    let mut ev = InboundEvent::new(user, chat, payload, route.handler)
        .with_dedup_key(format!("cb:{}", q.id));
    if let Some(b) = route.breaker {
        ev = ev.with_breaker(b);
    }

    let outcome = state.pipeline.submit(ev).await;
    log_outcome(user, &outcome);
    Ok(())
}
