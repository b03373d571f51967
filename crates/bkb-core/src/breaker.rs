//! Circuit breakers isolating the pipeline from unhealthy collaborators.
//!
//! One [`CircuitBreaker`] per protected operation name, created lazily by the
//! [`BreakerRegistry`] and kept for the process lifetime.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(recovery timeout elapsed)--> HALF_OPEN
//!   ^                                  ^                                      |
//!   +------------(probe succeeds)------+----------(probe fails)---------------+
//! ```

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    config::BreakerConfig,
    events::{EventBus, PipelineEvent},
    formatting::truncate_text,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub trips: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub next_attempt_in_ms: Option<u64>,
    pub last_error: Option<String>,
}

struct BreakerState {
    state: CircuitState,
    /// Timestamps of counted failures, oldest first. Its length is the failure count.
    recent_failures: VecDeque<Instant>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,

    total_calls: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    trips: u64,
    last_error: Option<String>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            next_attempt: None,
            probe_in_flight: false,
            total_calls: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
            trips: 0,
            last_error: None,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    bus: EventBus,
    state: Mutex<BreakerState>,
}

/// Marks an admitted call; an abandoned half-open probe (its future dropped,
/// e.g. by a processing timeout) re-opens the breaker instead of wedging it.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            let mut st = self.breaker.lock();
            if st.state == CircuitState::HalfOpen {
                st.probe_in_flight = false;
                self.breaker.trip(&mut st, Instant::now());
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig, bus: EventBus) -> Self {
        Self {
            name: name.into(),
            cfg,
            bus,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` through the breaker.
    ///
    /// Returns `Error::CircuitOpen` without invoking `op` while the breaker is
    /// open (or while a half-open probe is already running); otherwise returns
    /// `op`'s own result after updating the breaker state.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = self.admit(Instant::now())?;
        let mut guard = CallGuard {
            breaker: self,
            probe,
            settled: false,
        };

        let res = op().await;
        guard.settled = true;

        let now = Instant::now();
        match &res {
            Ok(_) => self.on_success(probe, now),
            Err(e) => self.on_failure(probe, e, now),
        }
        res
    }

    /// Decide whether a call may run. `Ok(true)` marks the half-open probe.
    fn admit(&self, now: Instant) -> Result<bool> {
        let mut st = self.lock();
        self.prune(&mut st, now);

        match st.state {
            CircuitState::Closed => {
                st.total_calls += 1;
                Ok(false)
            }
            CircuitState::Open => {
                let next = st.next_attempt.unwrap_or(now);
                if now >= next {
                    tracing::info!(breaker = %self.name, "circuit half-open, probing");
                    st.state = CircuitState::HalfOpen;
                    st.probe_in_flight = true;
                    st.total_calls += 1;
                    Ok(true)
                } else {
                    st.rejections += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_in: next.saturating_duration_since(now),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    st.rejections += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    st.probe_in_flight = true;
                    st.total_calls += 1;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, probe: bool, now: Instant) {
        let mut st = self.lock();
        st.successes += 1;
        match st.state {
            CircuitState::HalfOpen if probe => {
                tracing::info!(breaker = %self.name, "circuit closed after successful probe");
                st.state = CircuitState::Closed;
                st.probe_in_flight = false;
                st.recent_failures.clear();
                st.next_attempt = None;
            }
            CircuitState::Closed => {
                st.recent_failures.pop_front();
            }
            // A call admitted before the trip finished late; the open window stands.
            _ => {}
        }
        self.prune(&mut st, now);
    }

    fn on_failure(&self, probe: bool, err: &Error, now: Instant) {
        let mut st = self.lock();
        st.failures += 1;
        st.last_error = Some(truncate_text(&err.to_string(), 200));

        match st.state {
            CircuitState::HalfOpen if probe => {
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened: {err}");
                st.probe_in_flight = false;
                st.recent_failures.push_back(now);
                self.trip(&mut st, now);
            }
            CircuitState::Closed => {
                st.recent_failures.push_back(now);
                if st.recent_failures.len() as u32 >= self.cfg.failure_threshold.max(1) {
                    self.trip(&mut st, now);
                }
            }
            _ => {}
        }
    }

    fn trip(&self, st: &mut BreakerState, now: Instant) {
        st.state = CircuitState::Open;
        st.next_attempt = Some(now + self.cfg.recovery_timeout);
        st.trips += 1;
        let failures = st.recent_failures.len() as u32;
        tracing::warn!(
            breaker = %self.name,
            failures,
            recovery_ms = self.cfg.recovery_timeout.as_millis() as u64,
            "circuit opened"
        );
        self.bus.publish(PipelineEvent::CircuitTripped {
            name: self.name.clone(),
            failures,
        });
    }

    /// Drop failures older than the monitoring period.
    fn prune(&self, st: &mut BreakerState, now: Instant) {
        while st
            .recent_failures
            .front()
            .map(|t| now.saturating_duration_since(*t) > self.cfg.monitoring_period)
            .unwrap_or(false)
        {
            st.recent_failures.pop_front();
        }
    }

    /// Windowed decay, run periodically by the registry.
    pub fn decay(&self) {
        let mut st = self.lock();
        self.prune(&mut st, Instant::now());
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().recent_failures.len() as u32
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let st = self.lock();
        let executed = st.successes + st.failures;
        let (success_rate, failure_rate) = if executed == 0 {
            (1.0, 0.0)
        } else {
            (
                st.successes as f64 / executed as f64,
                st.failures as f64 / executed as f64,
            )
        };
        let next_attempt_in_ms = match st.state {
            CircuitState::Open => st
                .next_attempt
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        };

        BreakerStats {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.recent_failures.len() as u32,
            total_calls: st.total_calls,
            successes: st.successes,
            failures: st.failures,
            rejections: st.rejections,
            trips: st.trips,
            success_rate,
            failure_rate,
            next_attempt_in_ms,
            last_error: st.last_error.clone(),
        }
    }

    /// Operational override: open now for a full recovery timeout.
    pub fn force_open(&self) {
        let mut st = self.lock();
        tracing::warn!(breaker = %self.name, "circuit forced open");
        st.probe_in_flight = false;
        self.trip(&mut st, Instant::now());
    }

    /// Operational override: close and forget recorded failures.
    pub fn force_closed(&self) {
        let mut st = self.lock();
        tracing::warn!(breaker = %self.name, "circuit forced closed");
        st.state = CircuitState::Closed;
        st.recent_failures.clear();
        st.next_attempt = None;
        st.probe_in_flight = false;
    }

    /// Operational override: let the next call probe immediately.
    pub fn force_half_open(&self) {
        let mut st = self.lock();
        tracing::warn!(breaker = %self.name, "circuit forced half-open");
        st.state = CircuitState::HalfOpen;
        st.next_attempt = None;
        st.probe_in_flight = false;
    }
}

/// Lazily created breakers keyed by operation name.
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    bus: EventBus,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig, bus: EventBus) -> Self {
        Self {
            cfg,
            bus,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.cfg)
    }

    /// Like [`get`](Self::get) but with a dedicated config on first creation.
    pub fn get_with(&self, name: &str, cfg: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.lock();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, cfg, self.bus.clone())))
            .clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get(name);
        breaker.execute(op).await
    }

    pub fn decay_all(&self) {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        for b in breakers {
            b.decay();
        }
    }

    pub fn decay_interval(&self) -> Duration {
        (self.cfg.monitoring_period / 2).max(Duration::from_secs(1))
    }

    /// Stats for every breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        let mut out: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
            monitoring_period: Duration::from_secs(60),
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.execute(|| async { Err::<(), _>(Error::External("boom".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_short_circuits() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let b = CircuitBreaker::new("calendar", cfg(), bus);

        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(Error::External(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::CircuitTripped { failures: 3, .. })
        ));

        let invoked = AtomicUsize::new(0);
        let res = b
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().rejections, 1);
        assert!(b.stats().next_attempt_in_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_success_closes_and_resets() {
        let b = CircuitBreaker::new("calendar", cfg(), EventBus::new(4));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let seen = b
            .execute(|| async { Ok::<_, Error>(b.state()) })
            .await
            .unwrap();
        assert_eq!(seen, CircuitState::HalfOpen);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_failure_reopens() {
        let b = CircuitBreaker::new("calendar", cfg(), EventBus::new(4));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(matches!(fail(&b).await, Err(Error::External(_))));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().trips, 2);
        // Fresh recovery window.
        assert!(matches!(succeed(&b).await, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn success_decrements_failure_count() {
        let b = CircuitBreaker::new("calendar", cfg(), EventBus::new(4));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.failure_count(), 2);
        succeed(&b).await.unwrap();
        assert_eq!(b.failure_count(), 1);
        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_decay() {
        let b = CircuitBreaker::new("calendar", cfg(), EventBus::new(4));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        b.decay();
        assert_eq!(b.failure_count(), 0);

        // Two stale + one fresh failure must not trip.
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_reopens_instead_of_wedging() {
        let b = CircuitBreaker::new("calendar", cfg(), EventBus::new(4));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let slow = b.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), slow).await;
        assert!(timed_out.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_overrides() {
        let b = CircuitBreaker::new("crm", cfg(), EventBus::new(4));
        b.force_open();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(succeed(&b).await, Err(Error::CircuitOpen { .. })));

        b.force_half_open();
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        let _ = fail(&b).await;
        b.force_closed();
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn registry_reuses_breakers_by_name() {
        let reg = BreakerRegistry::new(cfg(), EventBus::new(4));
        let a = reg.get("calendar");
        let b = reg.get("calendar");
        assert!(Arc::ptr_eq(&a, &b));

        let out = reg.execute("payments", || async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(out, 42);

        let names: Vec<_> = reg.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["calendar".to_string(), "payments".to_string()]);
        assert!(reg.find("crm").is_none());
    }
}
