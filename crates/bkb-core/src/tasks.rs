//! Named background tasks with a single shutdown point.
//!
//! Every periodic loop in the pipeline (queue tick, cleanup sweeps, breaker
//! decay, event subscribers) is spawned through a [`TaskSet`] so that
//! `shutdown()` cancels and joins all of them before the process exits.

use std::{future::Future, sync::Mutex, time::Duration};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct Running {
    name: String,
    handle: JoinHandle<()>,
}

struct TaskSetState {
    cancel: CancellationToken,
    running: Vec<Running>,
    /// Set while `shutdown` is joining; spawns are refused.
    closed: bool,
}

pub struct TaskSet {
    state: Mutex<TaskSetState>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TaskSetState {
                cancel: CancellationToken::new(),
                running: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskSetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a task that receives the set's cancellation token.
    ///
    /// Returns `false` without calling `f` while the set is shutting down;
    /// `f` (and whatever it captured) is dropped instead.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut st = self.lock();
        if st.closed {
            drop(st);
            tracing::debug!(task = %name, "task set shutting down, spawn refused");
            return false;
        }
        let token = st.cancel.child_token();
        let handle = tokio::spawn(f(token));
        st.running.retain(|r| !r.handle.is_finished());
        st.running.push(Running { name, handle });
        true
    }

    /// Run `tick()` every `period` until shutdown. The first run happens one
    /// period after spawning; a slow tick delays the next one instead of bursting.
    pub fn spawn_every<F, Fut>(&self, name: impl Into<String>, period: Duration, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        self.spawn(name, move |cancel| async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = %task_name, "periodic task stopped");
        })
    }

    /// Names of tasks that have not finished yet.
    pub fn running(&self) -> Vec<String> {
        self.lock()
            .running
            .iter()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Cancel every task and wait for all of them to exit.
    ///
    /// Spawns attempted while this runs are refused, so every task that was
    /// started is joined before it returns. The set can be reused afterwards;
    /// new tasks get a fresh token.
    pub async fn shutdown(&self) {
        let running = {
            let mut st = self.lock();
            st.closed = true;
            st.cancel.cancel();
            std::mem::take(&mut st.running)
        };

        for r in running {
            if let Err(e) = r.handle.await {
                if e.is_panic() {
                    tracing::error!(task = %r.name, "background task panicked");
                }
            }
        }

        let mut st = self.lock();
        st.cancel = CancellationToken::new();
        st.closed = false;
    }
}
