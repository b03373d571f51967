use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{config::TierLimit, Result};

/// Outcome of one sliding-window check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCheck {
    pub allowed: bool,
    /// Requests counted inside the window, including this one when allowed.
    pub count: u32,
    /// Time until the oldest counted request leaves the window.
    pub reset_in: Duration,
}

/// Backing store for admission counters and the blacklist.
///
/// Only admitted requests are recorded, so a rejected caller cannot push its
/// own reset time further out.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check_and_record(&self, key: &str, limit: TierLimit) -> Result<WindowCheck>;

    /// Record one violation and return how many fall inside `window`.
    async fn record_violation(&self, identity: &str, window: Duration) -> Result<u32>;

    async fn ban(&self, identity: &str, ttl: Duration) -> Result<()>;
    async fn unban(&self, identity: &str) -> Result<bool>;
    async fn banned_remaining(&self, identity: &str) -> Result<Option<Duration>>;

    /// Drop state older than `max_window`. Shared stores expire keys themselves.
    fn sweep(&self, _max_window: Duration) {}
}

/// In-process sliding-window log. The default store and the fallback when a
/// shared store is unreachable.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
    violations: Mutex<HashMap<String, VecDeque<Instant>>>,
    bans: Mutex<HashMap<String, Instant>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn prune(log: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while log
        .front()
        .map(|t| now.saturating_duration_since(*t) >= window)
        .unwrap_or(false)
    {
        log.pop_front();
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_at(&self, key: &str, limit: TierLimit, now: Instant) -> WindowCheck {
        let mut buckets = lock(&self.buckets);
        let log = buckets.entry(key.to_string()).or_default();
        prune(log, limit.window, now);

        let reset_in = |log: &VecDeque<Instant>| {
            log.front()
                .map(|t| (*t + limit.window).saturating_duration_since(now))
                .unwrap_or(limit.window)
        };

        if log.len() as u32 >= limit.limit {
            return WindowCheck {
                allowed: false,
                count: log.len() as u32,
                reset_in: reset_in(log),
            };
        }

        log.push_back(now);
        WindowCheck {
            allowed: true,
            count: log.len() as u32,
            reset_in: reset_in(log),
        }
    }

    pub fn violation_at(&self, identity: &str, window: Duration, now: Instant) -> u32 {
        let mut violations = lock(&self.violations);
        let log = violations.entry(identity.to_string()).or_default();
        prune(log, window, now);
        log.push_back(now);
        log.len() as u32
    }

    pub fn ban_at(&self, identity: &str, ttl: Duration, now: Instant) {
        lock(&self.bans).insert(identity.to_string(), now + ttl);
        lock(&self.violations).remove(identity);
    }

    pub fn unban_now(&self, identity: &str) -> bool {
        lock(&self.bans).remove(identity).is_some()
    }

    pub fn banned_remaining_at(&self, identity: &str, now: Instant) -> Option<Duration> {
        let mut bans = lock(&self.bans);
        match bans.get(identity) {
            Some(until) if *until > now => Some(until.saturating_duration_since(now)),
            Some(_) => {
                bans.remove(identity);
                None
            }
            None => None,
        }
    }

    /// Drop buckets with nothing newer than `max_window` and lapsed bans.
    pub fn sweep(&self, max_window: Duration) {
        let now = Instant::now();
        for map in [&self.buckets, &self.violations] {
            let mut map = lock(map);
            map.retain(|_, log| {
                prune(log, max_window, now);
                !log.is_empty()
            });
        }
        lock(&self.bans).retain(|_, until| *until > now);
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check_and_record(&self, key: &str, limit: TierLimit) -> Result<WindowCheck> {
        Ok(self.check_at(key, limit, Instant::now()))
    }

    async fn record_violation(&self, identity: &str, window: Duration) -> Result<u32> {
        Ok(self.violation_at(identity, window, Instant::now()))
    }

    async fn ban(&self, identity: &str, ttl: Duration) -> Result<()> {
        self.ban_at(identity, ttl, Instant::now());
        Ok(())
    }

    async fn unban(&self, identity: &str) -> Result<bool> {
        Ok(self.unban_now(identity))
    }

    async fn banned_remaining(&self, identity: &str) -> Result<Option<Duration>> {
        Ok(self.banned_remaining_at(identity, Instant::now()))
    }

    fn sweep(&self, max_window: Duration) {
        MemoryStore::sweep(self, max_window);
    }
}
