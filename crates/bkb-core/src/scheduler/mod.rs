//! Per-user priority queues with dedup, retry and a dead-letter ring.
//!
//! Each originating user gets one ordered queue. A periodic tick hands every
//! idle queue with due work to its own drain task; the `processing` flag is
//! set under the state lock before the task is spawned and cleared only when
//! that task is gone, so two ticks can never drain the same user concurrently.
//! Different users drain in parallel.

mod backoff;
mod dead_letter;
mod envelope;

pub use backoff::RetryBackoff;
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterReason};
pub use envelope::EnqueueOptions;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::envelope::Envelope;
use crate::{
    breaker::BreakerRegistry,
    classifier::ErrorClassifier,
    config::QueueConfig,
    domain::{EnvelopeId, Priority, UserId},
    events::{EventBus, PipelineEvent},
    handler::{Handler, HandlerContext},
    messaging::types::Payload,
    tasks::TaskSet,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted(EnvelopeId),
    Duplicate,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub processed: u64,
    /// Failed attempts, including ones that were retried.
    pub failed: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub expired: u64,
    pub dead_lettered: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counters: QueueCounters,
    pub queues: usize,
    pub processing: usize,
    /// Drain tasks currently alive.
    pub drains: usize,
    pub queued: usize,
    pub max_depth: usize,
    pub dlq_size: usize,
    pub dedup_records: usize,
    pub healthy: bool,
}

struct UserQueue {
    items: VecDeque<Envelope>,
    processing: bool,
    last_activity: Instant,
}

impl UserQueue {
    fn new(now: Instant) -> Self {
        Self {
            items: VecDeque::new(),
            processing: false,
            last_activity: now,
        }
    }

    /// Insert before the first strictly less urgent envelope (FIFO among equals).
    fn insert(&mut self, env: Envelope) {
        let idx = self
            .items
            .iter()
            .position(|e| e.priority > env.priority)
            .unwrap_or(self.items.len());
        self.items.insert(idx, env);
    }

    /// First envelope in queue order that may run now. Envelopes waiting out
    /// a retry backoff are skipped, not waited on.
    fn next_due(&self, now: Instant) -> Option<usize> {
        self.items.iter().position(|e| e.is_due(now))
    }
}

struct QueueState {
    queues: HashMap<UserId, UserQueue>,
    dedup: HashMap<String, Instant>,
    dlq: DeadLetterQueue,
    counters: QueueCounters,
    live_drains: usize,
}

/// Held by one drain task for its whole life, including the time between
/// `tick` and the task's first poll. Dropping it releases the user's queue.
struct DrainSlot {
    manager: Arc<QueueManager>,
    user: UserId,
}

impl Drop for DrainSlot {
    fn drop(&mut self) {
        let mut st = self.manager.lock();
        st.live_drains = st.live_drains.saturating_sub(1);
        if let Some(q) = st.queues.get_mut(&self.user) {
            q.processing = false;
        }
    }
}

pub struct QueueManager {
    cfg: QueueConfig,
    backoff: RetryBackoff,
    bus: EventBus,
    classifier: Arc<ErrorClassifier>,
    breakers: Arc<BreakerRegistry>,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    started: AtomicBool,
    tasks: TaskSet,
}

impl QueueManager {
    pub fn new(
        cfg: QueueConfig,
        bus: EventBus,
        classifier: Arc<ErrorClassifier>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            backoff: RetryBackoff::new(cfg.retry_base_delay, cfg.retry_max_delay),
            state: Mutex::new(QueueState {
                queues: HashMap::new(),
                dedup: HashMap::new(),
                dlq: DeadLetterQueue::new(cfg.dlq_capacity),
                counters: QueueCounters::default(),
                live_drains: 0,
            }),
            cfg,
            bus,
            classifier,
            breakers,
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            tasks: TaskSet::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `payload` for `user`, or reject it as a duplicate of an envelope
    /// accepted with the same dedup key inside the dedup window.
    pub fn enqueue(
        &self,
        user: UserId,
        payload: Payload,
        priority: Priority,
        handler: Arc<dyn Handler>,
        options: EnqueueOptions,
    ) -> EnqueueOutcome {
        let now = Instant::now();
        let mut st = self.lock();

        if let Some(key) = &options.dedup_key {
            let fresh = st
                .dedup
                .get(key)
                .map(|at| now.saturating_duration_since(*at) < self.cfg.dedup_window)
                .unwrap_or(false);
            if fresh {
                st.counters.duplicates += 1;
                drop(st);
                tracing::debug!(%user, dedup_key = %key, "duplicate envelope rejected");
                self.bus.publish(PipelineEvent::DuplicateRejected {
                    user,
                    dedup_key: key.clone(),
                });
                return EnqueueOutcome::Duplicate;
            }
            st.dedup.insert(key.clone(), now);
        }

        let id = EnvelopeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let env = Envelope {
            id,
            user,
            base_priority: priority,
            priority,
            payload,
            handler,
            reply: options.reply,
            breaker: options.breaker,
            created_at: now,
            not_before: None,
            attempts: 0,
            max_retries: options.max_retries.unwrap_or(self.cfg.max_retries),
            timeout: options.timeout.unwrap_or(self.cfg.processing_timeout),
            max_age: options.max_age.unwrap_or(self.cfg.max_age),
        };

        st.counters.enqueued += 1;
        let queue = st
            .queues
            .entry(user)
            .or_insert_with(|| UserQueue::new(now));
        queue.insert(env);
        queue.last_activity = now;
        let depth = queue.items.len();
        drop(st);

        self.bus.publish(PipelineEvent::Enqueued {
            user,
            envelope: id,
            priority,
            depth,
        });
        EnqueueOutcome::Accepted(id)
    }

    /// Start the tick and cleanup loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        self.tasks
            .spawn_every("queue-tick", self.cfg.tick_interval, move || {
                let this = this.clone();
                async move {
                    this.tick();
                }
            });

        let this = self.clone();
        self.tasks
            .spawn_every("queue-cleanup", self.cfg.cleanup_interval, move || {
                let this = this.clone();
                async move {
                    this.cleanup();
                }
            });

        tracing::info!(
            tick_ms = self.cfg.tick_interval.as_millis() as u64,
            pacing_ms = self.cfg.pacing_delay.as_millis() as u64,
            "queue manager started"
        );
    }

    /// Stop periodic loops and wait for in-flight drains to exit. Queued
    /// envelopes stay queued.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
    }

    /// Hand every idle queue with due work to its own drain task.
    /// Returns how many drains were started.
    pub fn tick(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let ready: Vec<UserId> = {
            let mut st = self.lock();
            let ready: Vec<UserId> = st
                .queues
                .iter_mut()
                .filter(|(_, q)| !q.processing && q.next_due(now).is_some())
                .map(|(user, q)| {
                    q.processing = true;
                    *user
                })
                .collect();
            st.live_drains += ready.len();
            ready
        };

        let mut started = 0;
        for user in ready {
            let slot = DrainSlot {
                manager: self.clone(),
                user,
            };
            let this = self.clone();
            // A refused spawn drops the slot, which releases the queue again.
            if self.tasks.spawn(format!("drain:{user}"), move |cancel| async move {
                let _slot = slot;
                this.drain(user, cancel).await;
            }) {
                started += 1;
            }
        }
        started
    }

    async fn drain(&self, user: UserId, cancel: CancellationToken) {
        let mut processed = 0usize;
        loop {
            if processed > 0 && self.has_due(user) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.cfg.pacing_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let Some(env) = self.take_due(user) else {
                break;
            };
            self.process(env, &cancel).await;
            processed += 1;
        }
    }

    fn has_due(&self, user: UserId) -> bool {
        let now = Instant::now();
        self.lock()
            .queues
            .get(&user)
            .and_then(|q| q.next_due(now))
            .is_some()
    }

    fn take_due(&self, user: UserId) -> Option<Envelope> {
        let now = Instant::now();
        let mut st = self.lock();
        let q = st.queues.get_mut(&user)?;
        let idx = q.next_due(now)?;
        q.last_activity = now;
        q.items.remove(idx)
    }

    async fn process(&self, mut env: Envelope, cancel: &CancellationToken) {
        if env.is_expired(Instant::now()) {
            tracing::warn!(
                user = %env.user,
                envelope = %env.id,
                max_age_ms = env.max_age.as_millis() as u64,
                "envelope expired before processing"
            );
            self.dead_letter(env, DeadLetterReason::Expired, None);
            return;
        }

        env.attempts += 1;
        self.bus.publish(PipelineEvent::ProcessingStarted {
            user: env.user,
            envelope: env.id,
            attempt: env.attempts,
        });

        let ctx = HandlerContext {
            user: env.user,
            envelope: env.id,
            attempt: env.attempts,
            reply: env.reply.clone(),
            cancel: cancel.child_token(),
        };

        let started = Instant::now();
        match self.invoke(&env, &ctx).await {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.lock().counters.processed += 1;
                tracing::debug!(
                    user = %env.user,
                    envelope = %env.id,
                    handler = env.handler.name(),
                    elapsed_ms,
                    "envelope processed"
                );
                self.bus.publish(PipelineEvent::ProcessingCompleted {
                    user: env.user,
                    envelope: env.id,
                    elapsed_ms,
                });
            }
            Err(err) => self.on_failure(env, err).await,
        }
    }

    /// Run the handler racing its timeout, through its breaker if it has one.
    /// The timeout sits inside the breaker call so a hung collaborator counts
    /// as a breaker failure.
    async fn invoke(&self, env: &Envelope, ctx: &HandlerContext) -> Result<()> {
        let call = move || async move {
            match tokio::time::timeout(env.timeout, env.handler.handle(ctx, &env.payload)).await {
                Ok(res) => res,
                Err(_) => {
                    ctx.cancel.cancel();
                    Err(Error::Timeout(env.timeout))
                }
            }
        };

        match &env.breaker {
            Some(name) => self.breakers.execute(name, call).await,
            None => call().await,
        }
    }

    async fn on_failure(&self, mut env: Envelope, err: Error) {
        if env.attempts < env.max_retries {
            let delay = self.backoff.delay(env.attempts);
            tracing::warn!(
                user = %env.user,
                envelope = %env.id,
                attempt = env.attempts,
                delay_ms = delay.as_millis() as u64,
                "handler failed, retry scheduled: {err}"
            );
            self.bus.publish(PipelineEvent::RetryScheduled {
                user: env.user,
                envelope: env.id,
                attempt: env.attempts,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });

            env.priority = env.base_priority.elevated();
            env.not_before = Some(Instant::now() + delay);

            let now = Instant::now();
            let mut st = self.lock();
            st.counters.failed += 1;
            st.counters.retries += 1;
            st.queues
                .entry(env.user)
                .or_insert_with(|| UserQueue::new(now))
                .insert(env);
            return;
        }

        tracing::error!(
            user = %env.user,
            envelope = %env.id,
            attempts = env.attempts,
            handler = env.handler.name(),
            "retries exhausted: {err}"
        );
        self.lock().counters.failed += 1;

        let reply = env.reply.clone();
        let collaborator = env.breaker.clone();
        self.dead_letter(
            env,
            DeadLetterReason::MaxRetriesExceeded,
            Some(err.to_string()),
        );
        self.classifier
            .handle(&err, reply.as_ref(), collaborator.as_deref())
            .await;
    }

    fn dead_letter(&self, env: Envelope, reason: DeadLetterReason, error: Option<String>) {
        let (user, id) = (env.user, env.id);
        {
            let mut st = self.lock();
            st.counters.dead_lettered += 1;
            if reason == DeadLetterReason::Expired {
                st.counters.expired += 1;
            }
            st.dlq.push(DeadLetterEntry {
                envelope: env.id,
                user: env.user,
                priority: env.base_priority,
                kind: env.payload.kind(),
                reason,
                error: error.clone(),
                attempts: env.attempts,
                dead_at: Utc::now(),
                payload: env.payload,
            });
        }
        self.bus.publish(PipelineEvent::DeadLettered {
            user,
            envelope: id,
            reason,
            error,
        });
    }

    /// Expire dedup records, drop idle empty queues and cap the DLQ.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let dedup_ttl = self.cfg.dedup_window * 2;
        let idle_ttl = self.cfg.idle_queue_ttl;

        let mut st = self.lock();
        let (dedup_before, queues_before) = (st.dedup.len(), st.queues.len());

        st.dedup
            .retain(|_, at| now.saturating_duration_since(*at) < dedup_ttl);
        st.queues.retain(|_, q| {
            q.processing
                || !q.items.is_empty()
                || now.saturating_duration_since(q.last_activity) < idle_ttl
        });
        st.dlq.trim();

        let dedup_removed = dedup_before - st.dedup.len();
        let queues_removed = queues_before - st.queues.len();
        drop(st);

        if dedup_removed > 0 || queues_removed > 0 {
            tracing::debug!(dedup_removed, queues_removed, "queue cleanup");
        }
    }

    pub fn depth(&self, user: UserId) -> usize {
        self.lock()
            .queues
            .get(&user)
            .map(|q| q.items.len())
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock().dlq.snapshot()
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.lock();
        let processing = st.queues.values().filter(|q| q.processing).count();
        let drains = st.live_drains;
        let queued = st.queues.values().map(|q| q.items.len()).sum();
        let max_depth = st
            .queues
            .values()
            .map(|q| q.items.len())
            .max()
            .unwrap_or(0);

        QueueStats {
            counters: st.counters,
            queues: st.queues.len(),
            processing,
            drains,
            queued,
            max_depth,
            dlq_size: st.dlq.len(),
            dedup_records: st.dedup.len(),
            // A processing flag with no live drain behind it would park that
            // user's queue for good.
            healthy: processing <= drains && processing <= st.queues.len(),
        }
    }
}
