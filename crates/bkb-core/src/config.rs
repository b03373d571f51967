use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration for the bot and its inbound pipeline.
///
/// Every section has a `Default` matching production values, so tests and
/// embedders can build a `Config` without touching the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    /// Chat that receives operational alerts (dead letters, tripped breakers).
    pub admin_chat_id: Option<i64>,
    pub event_bus_capacity: usize,

    pub queue: QueueConfig,
    pub shaper: ShaperConfig,
    pub breaker: BreakerConfig,
    pub classifier: ClassifierConfig,
}

/// Scheduler / queue manager tunables.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub tick_interval: Duration,
    /// Delay between two envelopes of the same user (platform per-chat limits).
    pub pacing_delay: Duration,
    pub cleanup_interval: Duration,
    pub dedup_window: Duration,
    /// Empty user queues with no activity for this long are dropped.
    pub idle_queue_ttl: Duration,
    pub dlq_capacity: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    // Per-envelope defaults (overridable per enqueue).
    pub max_retries: u32,
    pub processing_timeout: Duration,
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            pacing_delay: Duration::from_millis(200),
            cleanup_interval: Duration::from_secs(60),
            dedup_window: Duration::from_secs(5),
            idle_queue_ttl: Duration::from_secs(10 * 60),
            dlq_capacity: 1000,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            max_retries: 3,
            processing_timeout: Duration::from_secs(30),
            max_age: Duration::from_secs(5 * 60),
        }
    }
}

/// `limit` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierLimit {
    pub limit: u32,
    pub window: Duration,
}

impl TierLimit {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Admission shaper tunables.
#[derive(Clone, Debug)]
pub struct ShaperConfig {
    pub enabled: bool,
    pub global: TierLimit,
    pub conversation: TierLimit,
    pub user: TierLimit,
    pub command: TierLimit,
    /// Per-command limits overriding `command` (keyed by command name, no slash).
    pub command_overrides: HashMap<String, TierLimit>,
    pub interaction: TierLimit,
    pub burst: TierLimit,

    /// Rejections counted per identity inside this window feed auto-blacklisting.
    pub violation_window: Duration,
    /// More than this many violations inside `violation_window` bans the identity.
    pub blacklist_threshold: u32,
    pub blacklist_ttl: Duration,
    pub whitelist: Vec<i64>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: TierLimit::new(30, Duration::from_secs(1)),
            conversation: TierLimit::new(30, Duration::from_secs(60)),
            user: TierLimit::new(20, Duration::from_secs(60)),
            command: TierLimit::new(10, Duration::from_secs(60)),
            command_overrides: HashMap::new(),
            interaction: TierLimit::new(30, Duration::from_secs(60)),
            burst: TierLimit::new(5, Duration::from_secs(2)),
            violation_window: Duration::from_secs(60 * 60),
            blacklist_threshold: 10,
            blacklist_ttl: Duration::from_secs(24 * 60 * 60),
            whitelist: Vec::new(),
        }
    }
}

/// Circuit breaker tunables (shared by every breaker in a registry).
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Failures older than this no longer count toward tripping.
    pub monitoring_period: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

/// Error classifier buffer sizes.
#[derive(Clone, Copy, Debug)]
pub struct ClassifierConfig {
    pub per_collaborator_capacity: usize,
    pub global_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            per_collaborator_capacity: 50,
            global_capacity: 200,
        }
    }
}

impl Config {
    /// Build a config with default pipeline sections (no environment access).
    pub fn with_token(telegram_bot_token: impl Into<String>) -> Self {
        Self {
            telegram_bot_token: telegram_bot_token.into(),
            admin_chat_id: None,
            event_bus_capacity: 1024,
            queue: QueueConfig::default(),
            shaper: ShaperConfig::default(),
            breaker: BreakerConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .or_else(|| env_str("TELEGRAM_TOKEN"))
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;

        let mut cfg = Self::with_token(telegram_bot_token);
        cfg.admin_chat_id = env_i64("ADMIN_CHAT_ID");
        if let Some(cap) = env_usize("EVENT_BUS_CAPACITY") {
            cfg.event_bus_capacity = cap;
        }

        // Queue
        let q = &mut cfg.queue;
        override_ms(&mut q.tick_interval, "QUEUE_TICK_MS");
        override_ms(&mut q.pacing_delay, "QUEUE_PACING_MS");
        override_ms(&mut q.processing_timeout, "QUEUE_TIMEOUT_MS");
        override_ms(&mut q.max_age, "QUEUE_MAX_AGE_MS");
        override_ms(&mut q.dedup_window, "QUEUE_DEDUP_WINDOW_MS");
        if let Some(n) = env_u32("QUEUE_MAX_RETRIES") {
            q.max_retries = n;
        }
        if let Some(n) = env_usize("QUEUE_DLQ_CAPACITY") {
            q.dlq_capacity = n;
        }
        if q.tick_interval.is_zero() {
            return Err(Error::Config("QUEUE_TICK_MS must be > 0".to_string()));
        }

        // Admission shaper
        let s = &mut cfg.shaper;
        if let Some(b) = env_bool("RATE_LIMIT_ENABLED") {
            s.enabled = b;
        }
        if let Some(n) = env_u32("RATE_LIMIT_USER_REQUESTS") {
            s.user.limit = n;
        }
        override_ms(&mut s.user.window, "RATE_LIMIT_USER_WINDOW_MS");
        if let Some(n) = env_u32("RATE_LIMIT_GLOBAL_REQUESTS") {
            s.global.limit = n;
        }
        if let Some(n) = env_u32("RATE_LIMIT_BURST_REQUESTS") {
            s.burst.limit = n;
        }
        if let Some(n) = env_u32("BLACKLIST_THRESHOLD") {
            s.blacklist_threshold = n;
        }
        if let Some(secs) = env_u64("BLACKLIST_TTL_SECS") {
            s.blacklist_ttl = Duration::from_secs(secs);
        }
        s.whitelist = parse_csv_i64(env_str("WHITELISTED_USERS"));
        if let Some(admin) = cfg.admin_chat_id {
            if !s.whitelist.contains(&admin) {
                s.whitelist.push(admin);
            }
        }

        // Circuit breakers
        let b = &mut cfg.breaker;
        if let Some(n) = env_u32("BREAKER_FAILURE_THRESHOLD") {
            b.failure_threshold = n.max(1);
        }
        override_ms(&mut b.recovery_timeout, "BREAKER_RECOVERY_MS");
        override_ms(&mut b.monitoring_period, "BREAKER_MONITORING_MS");

        Ok(cfg)
    }
}

fn override_ms(slot: &mut Duration, key: &str) {
    if let Some(ms) = env_u64(key) {
        *slot = Duration::from_millis(ms);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (k, v) in parse_dotenv(&contents) {
        if env::var_os(&k).is_some() {
            continue; // do not override existing env
        }
        env::set_var(k, v);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
