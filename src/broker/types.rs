//! Queue configuration and consume options.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::config::Config;

// ==========================================
// DELIVERY MODE
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMode {
    /// Every registered group receives a copy of every message.
    Broadcast,
    /// Each message goes to exactly one group, rotating among groups with
    /// free egress capacity.
    RoundRobin,
    /// At most one group may bind; consumed messages are deleted regardless
    /// of persistence.
    SingleConsumer,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::Broadcast
    }
}

// ==========================================
// QUEUE CONFIG
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// false => consumed messages are deleted even if other groups have not
    /// read them yet.
    pub is_persistent: bool,
    /// Buffer capacity. 0 => engine default (100).
    pub max_size: usize,
    /// Retention hint, ms. 0 => unbounded.
    pub ttl_ms: u64,
    pub delivery_mode: DeliveryMode,
    pub retry_enabled: bool,
    #[serde(rename = "retryConfig")]
    pub retry: RetryConfig,
    pub circuit_breaker_enabled: bool,
    #[serde(rename = "circuitBreakerConfig")]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Dispatcher parallelism. 0 => engine default (2).
    pub worker_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            is_persistent: true,
            max_size: 0,
            ttl_ms: 0,
            delivery_mode: DeliveryMode::default(),
            retry_enabled: false,
            retry: RetryConfig::default(),
            circuit_breaker_enabled: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            worker_count: 0,
        }
    }
}

impl QueueConfig {
    /// Zero-valued knobs fall back to engine defaults.
    pub fn merge_defaults(&mut self) {
        let defaults = &Config::global().queue;
        if self.max_size == 0 {
            self.max_size = defaults.default_buffer;
        }
        if self.worker_count == 0 {
            self.worker_count = defaults.default_workers;
        }
    }

    pub fn buffer_size(&self) -> usize {
        if self.max_size == 0 {
            Config::global().queue.default_buffer
        } else {
            self.max_size
        }
    }

    pub fn workers(&self) -> usize {
        if self.worker_count == 0 {
            Config::global().queue.default_workers
        } else {
            self.worker_count
        }
    }
}

/// Retry policy for the push-dispatch layer. The engine stores and defaults
/// it; dispatchers read it through the queue config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub error_threshold: f64,
    pub minimum_requests: u64,
    pub open_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            minimum_requests: 10,
            open_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

// ==========================================
// CONSUME OPTIONS
// ==========================================

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Concrete consumer identity. Empty/None registers the group without a
    /// member.
    pub consumer_id: Option<String>,
    /// Blocking wait bound. None => engine default (1 s). Zero => poll only.
    pub timeout: Option<Duration>,
    /// How many messages to pump from the repository on a miss. None => 5.
    pub max_count: Option<usize>,
    /// Seek: start reading at the index of this stored message.
    pub start_from_id: Option<String>,
    /// Seek: rewind the group position to 0.
    pub reset_offset: bool,
}

