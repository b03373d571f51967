use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bkb_core::{
    config::{Config, TierLimit},
    domain::{ChatId, MessageId, MessageRef, Priority, UserId},
    events::PipelineEvent,
    handler::{handler_fn, Handler, HandlerContext},
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, Payload},
    },
    pipeline::{InboundEvent, Pipeline, Submitted},
    scheduler::DeadLetterReason,
    shaper::Tier,
    Error, Result,
};

#[derive(Default)]
struct RecordingMessenger {
    sent: Mutex<Vec<(ChatId, String)>>,
}

impl RecordingMessenger {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl MessagingPort for RecordingMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id, html.to_string()));
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(sent.len() as i32),
        })
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        _keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.send_html(chat_id, text).await
    }

    async fn answer_callback_query(&self, _callback_id: &str, _text: Option<&str>) -> Result<()> {
        Ok(())
    }
}

fn roomy_config() -> Config {
    let mut cfg = Config::with_token("test");
    let roomy = TierLimit::new(100, Duration::from_secs(60));
    cfg.shaper.global = roomy;
    cfg.shaper.conversation = roomy;
    cfg.shaper.user = roomy;
    cfg.shaper.command = roomy;
    cfg.shaper.interaction = roomy;
    cfg.shaper.burst = roomy;
    cfg.queue.retry_base_delay = Duration::from_millis(10);
    cfg
}

fn recorder() -> (Arc<dyn Handler>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let h = handler_fn("record", move |_ctx: HandlerContext, payload: Payload| {
        let s = s.clone();
        async move {
            if let Payload::Text(t) = payload {
                s.lock().unwrap().push(t.text);
            }
            Ok(())
        }
    });
    (h, seen)
}

#[tokio::test(start_paused = true)]
async fn five_events_from_one_user() {
    let mut cfg = roomy_config();
    cfg.shaper.user = TierLimit::new(4, Duration::from_secs(60));

    let messenger = Arc::new(RecordingMessenger::default());
    let pipeline = Pipeline::new(&cfg, messenger.clone());
    let (handler, seen) = recorder();
    let (user, chat) = (UserId(7), ChatId(7));

    let events = [
        ("low", Priority::LOW, Some("upd-1")),
        ("high", Priority::HIGH, Some("upd-2")),
        ("low-again", Priority::LOW, Some("upd-1")),
        ("normal", Priority::NORMAL, Some("upd-4")),
        ("over-limit", Priority::NORMAL, Some("upd-5")),
    ];

    let mut outcomes = Vec::new();
    for (text, prio, key) in events {
        let mut ev = InboundEvent::new(user, chat, Payload::text(text), handler.clone())
            .with_priority(prio);
        if let Some(k) = key {
            ev = ev.with_dedup_key(k);
        }
        outcomes.push(pipeline.submit(ev).await);
    }

    assert!(matches!(outcomes[0], Submitted::Enqueued(_)));
    assert!(matches!(outcomes[1], Submitted::Enqueued(_)));
    assert_eq!(outcomes[2], Submitted::Duplicate);
    assert!(matches!(outcomes[3], Submitted::Enqueued(_)));
    match &outcomes[4] {
        Submitted::RateLimited(r) => assert_eq!(r.tier, Tier::User),
        other => panic!("expected rate limit, got {other:?}"),
    }

    pipeline.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.shutdown().await;

    assert_eq!(*seen.lock().unwrap(), vec!["high", "normal", "low"]);

    let stats = pipeline.stats();
    assert_eq!(stats.shaper.allowed, 4);
    assert_eq!(stats.shaper.rejected.get(&Tier::User), Some(&1));
    assert_eq!(stats.queue.counters.duplicates, 1);
    assert_eq!(stats.queue.counters.processed, 3);
    assert_eq!(stats.queue.dlq_size, 0);

    // Only the rate-limit notice reached the chat.
    assert_eq!(messenger.texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fifo_within_priority_and_users_are_isolated() {
    let pipeline = Pipeline::new(&roomy_config(), Arc::new(RecordingMessenger::default()));
    let (handler, seen) = recorder();

    for i in 0..3 {
        for user in [1, 2] {
            let ev = InboundEvent::new(
                UserId(user),
                ChatId(user),
                Payload::text(format!("u{user}-{i}")),
                handler.clone(),
            );
            pipeline.submit(ev).await;
        }
    }

    pipeline.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.shutdown().await;

    let seen = seen.lock().unwrap().clone();
    for user in ["u1", "u2"] {
        let mine: Vec<_> = seen.iter().filter(|s| s.starts_with(user)).cloned().collect();
        assert_eq!(
            mine,
            vec![format!("{user}-0"), format!("{user}-1"), format!("{user}-2")]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_reach_dead_letters_and_subscribers() {
    let mut cfg = roomy_config();
    cfg.queue.max_retries = 2;

    let messenger = Arc::new(RecordingMessenger::default());
    let pipeline = Pipeline::new(&cfg, messenger.clone());
    let mut rx = pipeline.bus().subscribe();

    let always_fails = handler_fn("payments", |_ctx, _payload| async {
        Err::<(), _>(Error::collaborator("payments", "gateway returned 502"))
    });
    let ev = InboundEvent::new(UserId(3), ChatId(3), Payload::command("pay", ""), always_fails)
        .with_breaker("payments");
    assert!(matches!(pipeline.submit(ev).await, Submitted::Enqueued(_)));

    pipeline.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.shutdown().await;

    let dead = pipeline.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(dead[0].attempts, 2);

    let notices = messenger.texts();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("payments encountered an issue"));
    assert_eq!(
        pipeline.classifier().recent_errors(Some("payments"), 5).len(),
        1
    );

    let mut topics = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let PipelineEvent::DeadLettered { reason, .. } = &ev {
            assert_eq!(*reason, DeadLetterReason::MaxRetriesExceeded);
        }
        topics.push(ev.topic());
    }
    assert_eq!(
        topics,
        vec![
            "enqueued",
            "processing-started",
            "retry-scheduled",
            "processing-started",
            "dead-lettered",
            "error-handled",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn open_breaker_short_circuits_later_envelopes() {
    let mut cfg = roomy_config();
    cfg.queue.max_retries = 1;
    cfg.breaker.failure_threshold = 2;

    let pipeline = Pipeline::new(&cfg, Arc::new(RecordingMessenger::default()));
    let calls = Arc::new(Mutex::new(0u32));
    let c = calls.clone();
    let calendar = handler_fn("calendar", move |_ctx, _payload| {
        let c = c.clone();
        async move {
            *c.lock().unwrap() += 1;
            Err::<(), _>(Error::External("calendar backend unavailable".into()))
        }
    });

    for user in 1..=3 {
        let ev = InboundEvent::new(UserId(user), ChatId(user), Payload::text("slots"), calendar.clone())
            .with_breaker("calendar");
        pipeline.submit(ev).await;
    }

    pipeline.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.shutdown().await;

    // Two failures trip the breaker; the third envelope never reaches the handler.
    assert_eq!(*calls.lock().unwrap(), 2);
    assert_eq!(pipeline.dead_letters().len(), 3);
    let breaker = &pipeline.stats().breakers[0];
    assert_eq!(breaker.name, "calendar");
    assert_eq!(breaker.rejections, 1);
}
