use std::sync::Arc;

use bkb_core::{
    config::Config,
    domain::ChatId,
    events::LogSubscriber,
    pipeline::Pipeline,
};
use bkb_telegram::{alerts::AdminAlerts, handlers::HandlerRegistry, TelegramMessenger};

#[tokio::main]
async fn main() -> Result<(), bkb_core::Error> {
    bkb_core::logging::init("bkb")?;

    let cfg = Config::load()?;

    let messenger = Arc::new(TelegramMessenger::from_token(&cfg.telegram_bot_token));
    let pipeline = Arc::new(Pipeline::new(&cfg, messenger.clone()));

    pipeline.subscribe(Arc::new(LogSubscriber::new()));
    if let Some(admin) = cfg.admin_chat_id {
        pipeline.subscribe(Arc::new(AdminAlerts::new(messenger.clone(), ChatId(admin))));
    }
    pipeline.start();

    let registry = Arc::new(HandlerRegistry::with_builtins());
    let polled = bkb_telegram::router::run_polling(messenger.bot(), pipeline.clone(), registry).await;

    pipeline.shutdown().await;
    if let Ok(stats) = serde_json::to_string(&pipeline.stats()) {
        tracing::info!(stats = %stats, "final pipeline stats");
    }

    polled.map_err(|e| bkb_core::Error::External(format!("telegram bot failed: {e}")))
}
