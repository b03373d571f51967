//! Inbound pipeline facade: admission, then per-user scheduling.
//!
//! Owns one instance of every component and the background tasks that keep
//! them tidy. Adapters only need [`Pipeline::submit`].

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    breaker::{BreakerRegistry, BreakerStats},
    classifier::{ClassifierStats, ErrorClassifier},
    config::Config,
    domain::{ChatId, EnvelopeId, Priority, UserId},
    events::{EventBus, Subscribe},
    handler::Handler,
    messaging::{
        port::{MessagingPort, ReplyTarget},
        types::Payload,
    },
    scheduler::{DeadLetterEntry, EnqueueOptions, EnqueueOutcome, QueueManager, QueueStats},
    shaper::{
        Admission, AdmissionRequest, AdmissionShaper, CounterStore, MemoryStore, Rejection,
        ShaperStats, Tier,
    },
    tasks::TaskSet,
};

const SHAPER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A normalized inbound event bound to the handler that will process it.
#[derive(Clone)]
pub struct InboundEvent {
    pub user: UserId,
    pub chat: ChatId,
    pub payload: Payload,
    pub handler: Arc<dyn Handler>,
    /// Defaults by kind: interactions HIGH, everything else NORMAL.
    pub priority: Option<Priority>,
    pub dedup_key: Option<String>,
    pub breaker: Option<String>,
}

impl InboundEvent {
    pub fn new(user: UserId, chat: ChatId, payload: Payload, handler: Arc<dyn Handler>) -> Self {
        Self {
            user,
            chat,
            payload,
            handler,
            priority: None,
            dedup_key: None,
            breaker: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or(match self.payload {
            Payload::Callback(_) => Priority::HIGH,
            Payload::Call(_) | Payload::Command(_) | Payload::Text(_) => Priority::NORMAL,
        })
    }
}

impl std::fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundEvent")
            .field("user", &self.user)
            .field("chat", &self.chat)
            .field("kind", &self.payload.kind())
            .field("handler", &self.handler.name())
            .field("priority", &self.priority)
            .field("dedup_key", &self.dedup_key)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submitted {
    Enqueued(EnvelopeId),
    Duplicate,
    RateLimited(Rejection),
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStats {
    pub queue: QueueStats,
    pub shaper: ShaperStats,
    pub breakers: Vec<BreakerStats>,
    pub errors: ClassifierStats,
    pub subscribers: usize,
    pub tasks: Vec<String>,
}

pub struct Pipeline {
    bus: EventBus,
    messenger: Arc<dyn MessagingPort>,
    shaper: Arc<AdmissionShaper>,
    queue: Arc<QueueManager>,
    classifier: Arc<ErrorClassifier>,
    breakers: Arc<BreakerRegistry>,
    tasks: TaskSet,
}

impl Pipeline {
    pub fn new(cfg: &Config, messenger: Arc<dyn MessagingPort>) -> Self {
        Self::with_store(cfg, messenger, Arc::new(MemoryStore::new()))
    }

    /// Like [`new`](Self::new) with an external admission counter store.
    pub fn with_store(
        cfg: &Config,
        messenger: Arc<dyn MessagingPort>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let bus = EventBus::new(cfg.event_bus_capacity);
        let classifier = Arc::new(ErrorClassifier::new(cfg.classifier, bus.clone()));
        let breakers = Arc::new(BreakerRegistry::new(cfg.breaker, bus.clone()));
        let shaper = Arc::new(AdmissionShaper::with_store(
            cfg.shaper.clone(),
            store,
            bus.clone(),
        ));
        let queue = Arc::new(QueueManager::new(
            cfg.queue.clone(),
            bus.clone(),
            classifier.clone(),
            breakers.clone(),
        ));

        Self {
            bus,
            messenger,
            shaper,
            queue,
            classifier,
            breakers,
            tasks: TaskSet::new(),
        }
    }

    /// Admit and enqueue one inbound event.
    ///
    /// Rejected events get the rejection message in their chat (best-effort);
    /// blacklisted users are dropped silently.
    pub async fn submit(&self, ev: InboundEvent) -> Submitted {
        let req = AdmissionRequest::for_payload(ev.user, ev.chat, &ev.payload);
        if let Admission::Rejected(rejection) = self.shaper.check(&req).await {
            if rejection.tier != Tier::Blacklist {
                let reply = ReplyTarget::new(ev.chat, self.messenger.clone());
                if let Err(e) = reply.send_html(&rejection.message).await {
                    tracing::debug!(chat = %ev.chat, "rate-limit notice not delivered: {e}");
                }
            }
            return Submitted::RateLimited(rejection);
        }

        let priority = ev.effective_priority();
        let mut options =
            EnqueueOptions::default().reply(ReplyTarget::new(ev.chat, self.messenger.clone()));
        options.dedup_key = ev.dedup_key;
        options.breaker = ev.breaker;

        match self
            .queue
            .enqueue(ev.user, ev.payload, priority, ev.handler, options)
        {
            EnqueueOutcome::Accepted(id) => Submitted::Enqueued(id),
            EnqueueOutcome::Duplicate => Submitted::Duplicate,
        }
    }

    /// Start queue loops, shaper sweeps and breaker decay.
    pub fn start(&self) {
        self.queue.start();

        let shaper = self.shaper.clone();
        self.tasks
            .spawn_every("shaper-sweep", SHAPER_SWEEP_INTERVAL, move || {
                let shaper = shaper.clone();
                async move { shaper.sweep() }
            });

        let breakers = self.breakers.clone();
        self.tasks
            .spawn_every("breaker-decay", self.breakers.decay_interval(), move || {
                let breakers = breakers.clone();
                async move { breakers.decay_all() }
            });

        tracing::info!("pipeline started");
    }

    /// Attach an event subscriber; it runs until [`shutdown`](Self::shutdown).
    pub fn subscribe(&self, sub: Arc<dyn Subscribe>) {
        self.bus.spawn_subscriber(&self.tasks, sub);
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.tasks.shutdown().await;
        tracing::info!("pipeline stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue: self.queue.stats(),
            shaper: self.shaper.stats(),
            breakers: self.breakers.stats(),
            errors: self.classifier.stats(),
            subscribers: self.bus.subscriber_count(),
            tasks: self.tasks.running(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.queue.dead_letters()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn messenger(&self) -> Arc<dyn MessagingPort> {
        self.messenger.clone()
    }

    pub fn shaper(&self) -> &Arc<AdmissionShaper> {
        &self.shaper
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }
}
