//! Tiered admission shaper.
//!
//! Every inbound event is checked against the tiers below, in this order,
//! stopping at the first rejection:
//!
//! blacklist -> global -> conversation -> user -> command | interaction -> burst
//!
//! Each tier is an independent sliding window keyed by `(tier, identity)`.
//! Whitelisted users skip all tiers.

mod store;

pub use store::{CounterStore, MemoryStore, WindowCheck};

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;

use crate::{
    config::{ShaperConfig, TierLimit},
    domain::{ChatId, UserId},
    events::{EventBus, PipelineEvent},
    messaging::types::Payload,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Blacklist,
    Global,
    Conversation,
    User,
    Command,
    Interaction,
    Burst,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Blacklist => "blacklist",
            Tier::Global => "global",
            Tier::Conversation => "conversation",
            Tier::User => "user",
            Tier::Command => "command",
            Tier::Interaction => "interaction",
            Tier::Burst => "burst",
        }
    }

    fn message(&self, reset_in_secs: u64) -> String {
        match self {
            Tier::Blacklist => "🚫 You have been temporarily blocked.".to_string(),
            Tier::Global => format!(
                "⏳ The bot is busy right now. Please try again in {reset_in_secs}s."
            ),
            Tier::Conversation => format!(
                "⏳ This chat is sending too many messages. Please wait {reset_in_secs}s."
            ),
            Tier::User => format!(
                "⏳ You are sending requests too quickly. Please wait {reset_in_secs}s."
            ),
            Tier::Command => format!(
                "⏳ That command was used too often. Please wait {reset_in_secs}s."
            ),
            Tier::Interaction => format!(
                "⏳ Too many button presses. Please wait {reset_in_secs}s."
            ),
            Tier::Burst => "⏳ Slow down a little, please.".to_string(),
        }
    }
}

/// Routing metadata the shaper needs from an inbound event.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    pub user: UserId,
    pub chat: ChatId,
    pub command: Option<String>,
    pub interaction: Option<String>,
}

impl AdmissionRequest {
    pub fn new(user: UserId, chat: ChatId) -> Self {
        Self {
            user,
            chat,
            command: None,
            interaction: None,
        }
    }

    pub fn for_payload(user: UserId, chat: ChatId, payload: &Payload) -> Self {
        Self {
            user,
            chat,
            command: payload.command_name().map(str::to_string),
            interaction: payload.interaction_id().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub tier: Tier,
    pub message: String,
    pub reset_in_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    AllowedWhitelisted,
    Rejected(Rejection),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ShaperStats {
    pub enabled: bool,
    pub store: &'static str,
    pub degraded: bool,
    pub allowed: u64,
    pub allowed_whitelisted: u64,
    pub rejected: HashMap<Tier, u64>,
    pub auto_blacklisted: u64,
    pub store_errors: u64,
}

pub struct AdmissionShaper {
    cfg: ShaperConfig,
    primary: Arc<dyn CounterStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
    whitelist: Mutex<HashSet<UserId>>,
    stats: Mutex<ShaperStats>,
    bus: EventBus,
}

fn seconds_ceil(d: Duration) -> u64 {
    d.as_secs_f64().ceil() as u64
}

impl AdmissionShaper {
    /// Shaper over an in-process store.
    pub fn new(cfg: ShaperConfig, bus: EventBus) -> Self {
        Self::with_store(cfg, Arc::new(MemoryStore::new()), bus)
    }

    pub fn with_store(cfg: ShaperConfig, store: Arc<dyn CounterStore>, bus: EventBus) -> Self {
        let whitelist = cfg.whitelist.iter().copied().map(UserId).collect();
        Self {
            stats: Mutex::new(ShaperStats {
                enabled: cfg.enabled,
                store: store.name(),
                ..Default::default()
            }),
            cfg,
            primary: store,
            fallback: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            whitelist: Mutex::new(whitelist),
            bus,
        }
    }

    fn stats_lock(&self) -> std::sync::MutexGuard<'_, ShaperStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn whitelist_lock(&self) -> std::sync::MutexGuard<'_, HashSet<UserId>> {
        self.whitelist.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn check(&self, req: &AdmissionRequest) -> Admission {
        if !self.cfg.enabled {
            return Admission::Allowed;
        }

        if self.is_whitelisted(req.user) {
            self.stats_lock().allowed_whitelisted += 1;
            return Admission::AllowedWhitelisted;
        }

        let identity = req.user.to_string();
        if let Some(remaining) = self.banned_remaining(&identity).await {
            return self.reject(req, Tier::Blacklist, remaining).await;
        }

        for (tier, key, limit) in self.tiers(req) {
            let check = self.hit(&key, limit).await;
            if !check.allowed {
                return self.reject(req, tier, check.reset_in).await;
            }
        }

        self.stats_lock().allowed += 1;
        Admission::Allowed
    }

    /// The sliding-window tiers that apply to `req`, in evaluation order.
    fn tiers(&self, req: &AdmissionRequest) -> Vec<(Tier, String, TierLimit)> {
        let c = &self.cfg;
        let mut tiers = vec![
            (Tier::Global, "global".to_string(), c.global),
            (Tier::Conversation, format!("conv:{}", req.chat), c.conversation),
            (Tier::User, format!("user:{}", req.user), c.user),
        ];
        if let Some(cmd) = &req.command {
            let limit = c.command_overrides.get(cmd).copied().unwrap_or(c.command);
            tiers.push((Tier::Command, format!("cmd:{cmd}:{}", req.user), limit));
        } else if let Some(id) = &req.interaction {
            tiers.push((Tier::Interaction, format!("cb:{id}:{}", req.user), c.interaction));
        }
        tiers.push((Tier::Burst, format!("burst:{}", req.user), c.burst));
        tiers
    }

    async fn reject(&self, req: &AdmissionRequest, tier: Tier, reset_in: Duration) -> Admission {
        let reset_in_secs = seconds_ceil(reset_in);
        *self.stats_lock().rejected.entry(tier).or_default() += 1;

        tracing::info!(
            user = %req.user,
            chat = %req.chat,
            tier = tier.as_str(),
            reset_in_secs,
            "request rate limited"
        );
        self.bus.publish(PipelineEvent::RateLimited {
            user: req.user,
            tier,
            reset_in_secs,
        });

        if tier != Tier::Blacklist {
            self.track_violation(req.user).await;
        }

        Admission::Rejected(Rejection {
            tier,
            message: tier.message(reset_in_secs),
            reset_in_secs,
        })
    }

    async fn track_violation(&self, user: UserId) {
        let identity = user.to_string();
        let window = self.cfg.violation_window;
        let count = if self.is_degraded() {
            self.fallback.violation_at(&identity, window, tokio::time::Instant::now())
        } else {
            match self.primary.record_violation(&identity, window).await {
                Ok(n) => n,
                Err(e) => {
                    self.degrade(&e);
                    self.fallback
                        .violation_at(&identity, window, tokio::time::Instant::now())
                }
            }
        };

        if count > self.cfg.blacklist_threshold {
            tracing::warn!(
                %user,
                violations = count,
                ttl_secs = self.cfg.blacklist_ttl.as_secs(),
                "auto-blacklisting user"
            );
            self.ban(user, self.cfg.blacklist_ttl).await;
            self.stats_lock().auto_blacklisted += 1;
        }
    }

    async fn hit(&self, key: &str, limit: TierLimit) -> WindowCheck {
        if !self.is_degraded() {
            match self.primary.check_and_record(key, limit).await {
                Ok(c) => return c,
                Err(e) => self.degrade(&e),
            }
        }
        self.fallback
            .check_at(key, limit, tokio::time::Instant::now())
    }

    async fn banned_remaining(&self, identity: &str) -> Option<Duration> {
        let primary = if self.is_degraded() {
            None
        } else {
            match self.primary.banned_remaining(identity).await {
                Ok(r) => Some(r),
                Err(e) => {
                    self.degrade(&e);
                    None
                }
            }
        };
        match primary {
            Some(r) => r,
            None => self
                .fallback
                .banned_remaining_at(identity, tokio::time::Instant::now()),
        }
    }

    fn degrade(&self, err: &crate::Error) {
        self.stats_lock().store_errors += 1;
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                store = self.primary.name(),
                "counter store failed, falling back to in-process counters: {err}"
            );
            self.stats_lock().degraded = true;
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Try the primary store again after a degrade.
    pub fn reset_degraded(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(store = self.primary.name(), "counter store re-enabled");
            self.stats_lock().degraded = false;
        }
    }

    /// Manually blacklist `user` for `ttl`.
    pub async fn ban(&self, user: UserId, ttl: Duration) {
        let identity = user.to_string();
        let now = tokio::time::Instant::now();
        if !self.is_degraded() {
            if let Err(e) = self.primary.ban(&identity, ttl).await {
                self.degrade(&e);
            }
        }
        // Mirrored so a later degrade keeps the ban.
        self.fallback.ban_at(&identity, ttl, now);
    }

    pub async fn unban(&self, user: UserId) -> bool {
        let identity = user.to_string();
        let mut removed = self.fallback.unban_now(&identity);
        if !self.is_degraded() {
            match self.primary.unban(&identity).await {
                Ok(r) => removed |= r,
                Err(e) => self.degrade(&e),
            }
        }
        removed
    }

    pub async fn is_banned(&self, user: UserId) -> bool {
        self.banned_remaining(&user.to_string()).await.is_some()
    }

    pub fn whitelist_add(&self, user: UserId) -> bool {
        self.whitelist_lock().insert(user)
    }

    pub fn whitelist_remove(&self, user: UserId) -> bool {
        self.whitelist_lock().remove(&user)
    }

    pub fn is_whitelisted(&self, user: UserId) -> bool {
        self.whitelist_lock().contains(&user)
    }

    /// Drop idle buckets and lapsed bans.
    pub fn sweep(&self) {
        let max_window = self.longest_window();
        self.primary.sweep(max_window);
        self.fallback.sweep(max_window);
    }

    fn longest_window(&self) -> Duration {
        let c = &self.cfg;
        [c.global, c.conversation, c.user, c.command, c.interaction, c.burst]
            .iter()
            .map(|t| t.window)
            .chain(c.command_overrides.values().map(|t| t.window))
            .chain(std::iter::once(c.violation_window))
            .max()
            .unwrap_or(c.violation_window)
    }

    pub fn stats(&self) -> ShaperStats {
        self.stats_lock().clone()
    }
}
