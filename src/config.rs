use std::env;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub queue: QueueDefaultsConfig,
    pub consume: ConsumeConfig,
    pub sweeper: SweeperConfig,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            engine: EngineConfig::load(),
            queue: QueueDefaultsConfig::load(),
            consume: ConsumeConfig::load(),
            sweeper: SweeperConfig::load(),
        }
    }
}

// --- MODULES ---

// ENGINE
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log_level: String,
    pub shutdown_timeout_secs: u64,
    pub metrics_tick_secs: u64,
}

impl EngineConfig {
    fn load() -> Self {
        Self {
            log_level:             get_env("LOG_LEVEL", "info"),
            shutdown_timeout_secs: get_env("SHUTDOWN_TIMEOUT_SECS", "10"),
            metrics_tick_secs:     get_env("METRICS_TICK_SECS", "60"),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// QUEUE DEFAULTS
#[derive(Debug, Clone)]
pub struct QueueDefaultsConfig {
    pub default_buffer: usize,
    pub default_workers: usize,
    pub broadcast_send_timeout_ms: u64,
}

impl QueueDefaultsConfig {
    fn load() -> Self {
        Self {
            default_buffer:            get_env("QUEUE_DEFAULT_BUFFER", "100"),
            default_workers:           get_env("QUEUE_DEFAULT_WORKERS", "2"),
            broadcast_send_timeout_ms: get_env("BROADCAST_SEND_TIMEOUT_MS", "50"),
        }
    }
}

// CONSUME
#[derive(Debug, Clone)]
pub struct ConsumeConfig {
    pub default_timeout_ms: u64,
    pub default_batch: usize,
    pub poll_ms: u64,
    pub compaction_every: u64,
    pub compaction_margin: i64,
}

impl ConsumeConfig {
    fn load() -> Self {
        Self {
            default_timeout_ms: get_env("CONSUME_DEFAULT_TIMEOUT_MS", "1000"),
            default_batch:      get_env("CONSUME_DEFAULT_BATCH", "5"),
            poll_ms:            get_env("CONSUME_POLL_MS", "10"),
            compaction_every:   get_env("COMPACTION_EVERY", "100"),
            compaction_margin:  get_env("COMPACTION_MARGIN", "10"),
        }
    }
}

// SWEEPERS
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub stale_group_sweep_secs: u64,
    pub stale_group_ttl_secs: u64,
    pub orphan_sweep_secs: u64,
    pub orphan_threshold_secs: u64,
}

impl SweeperConfig {
    fn load() -> Self {
        Self {
            stale_group_sweep_secs: get_env("STALE_GROUP_SWEEP_SECS", "300"),
            stale_group_ttl_secs:   get_env("STALE_GROUP_TTL_SECS", "14400"),
            orphan_sweep_secs:      get_env("ORPHAN_SWEEP_SECS", "600"),
            orphan_threshold_secs:  get_env("ORPHAN_THRESHOLD_SECS", "86400"),
        }
    }

    pub fn stale_group_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_group_ttl_secs)
    }

    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
