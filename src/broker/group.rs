//! ConsumerGroupRegistry: per-(domain, queue, group) position, membership,
//! TTL and activity bookkeeping.
//!
//! The registry map is coarse (create/list); each group's mutable state sits
//! behind its own lock so the consume hot path never contends on the map.
//! Positions are monotonic: a store with a smaller value is clamped, and only
//! an explicit seek can rewind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::BrokerError;
use crate::utils::utils_time::current_time_ms;

type GroupKey = (String, String, String);

pub struct ConsumerGroupRegistry {
    groups: DashMap<GroupKey, Arc<GroupState>>,
}

pub struct GroupState {
    pub domain: String,
    pub queue: String,
    pub id: String,
    pub created_at_ms: u64,
    inner: Mutex<GroupInner>,
}

struct GroupInner {
    /// Next index to read. Monotonically non-decreasing except via seek.
    position: i64,
    consumers: HashSet<String>,
    /// Zero means "no expiry".
    ttl: Duration,
    last_activity_ms: u64,
}

impl GroupState {
    fn new(domain: &str, queue: &str, id: &str) -> Self {
        let now = current_time_ms();
        Self {
            domain: domain.to_string(),
            queue: queue.to_string(),
            id: id.to_string(),
            created_at_ms: now,
            inner: Mutex::new(GroupInner {
                position: 0,
                consumers: HashSet::new(),
                ttl: Duration::ZERO,
                last_activity_ms: now,
            }),
        }
    }

    pub fn position(&self) -> i64 {
        self.inner.lock().position
    }

    /// Monotonic advance: smaller values are clamped to the current position.
    /// Returns the position actually stored.
    pub fn store_position(&self, position: i64) -> i64 {
        let mut inner = self.inner.lock();
        if position > inner.position {
            inner.position = position;
        }
        inner.position
    }

    /// Seek: the one path allowed to move a position backwards.
    pub fn force_position(&self, position: i64) {
        self.inner.lock().position = position.max(0);
    }

    pub fn add_consumer(&self, consumer_id: &str) {
        if consumer_id.is_empty() {
            return;
        }
        self.inner.lock().consumers.insert(consumer_id.to_string());
    }

    pub fn consumers(&self) -> Vec<String> {
        self.inner.lock().consumers.iter().cloned().collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.lock().ttl = ttl;
    }

    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity_ms = current_time_ms();
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.inner.lock().last_activity_ms
    }

    /// Expired when idle past the group TTL (if set) or past `older_than`.
    fn is_stale(&self, now_ms: u64, older_than: Duration) -> bool {
        let inner = self.inner.lock();
        let idle_ms = now_ms.saturating_sub(inner.last_activity_ms);
        if !inner.ttl.is_zero() && idle_ms > inner.ttl.as_millis() as u64 {
            return true;
        }
        idle_ms > older_than.as_millis() as u64
    }
}

impl ConsumerGroupRegistry {
    pub fn new() -> Self {
        Self { groups: DashMap::new() }
    }

    /// Lazily creates the group; an empty `consumer_id` just ensures the
    /// group exists without attaching a member.
    pub fn register_consumer(
        &self,
        domain: &str,
        queue: &str,
        group: &str,
        consumer_id: &str,
    ) -> Arc<GroupState> {
        let key = (domain.to_string(), queue.to_string(), group.to_string());
        let state = self
            .groups
            .entry(key)
            .or_insert_with(|| Arc::new(GroupState::new(domain, queue, group)))
            .clone();
        state.add_consumer(consumer_id);
        state
    }

    pub fn get(&self, domain: &str, queue: &str, group: &str) -> Option<Arc<GroupState>> {
        self.groups
            .get(&(domain.to_string(), queue.to_string(), group.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn position(&self, domain: &str, queue: &str, group: &str) -> i64 {
        self.get(domain, queue, group).map(|g| g.position()).unwrap_or(0)
    }

    pub fn list(&self, domain: &str, queue: &str) -> Vec<Arc<GroupState>> {
        self.groups
            .iter()
            .filter(|e| e.key().0 == domain && e.key().1 == queue)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn delete(&self, domain: &str, queue: &str, group: &str) -> Result<Arc<GroupState>, BrokerError> {
        self.groups
            .remove(&(domain.to_string(), queue.to_string(), group.to_string()))
            .map(|(_, state)| state)
            .ok_or_else(|| {
                BrokerError::GroupNotFound(domain.to_string(), queue.to_string(), group.to_string())
            })
    }

    /// Groups idle past `older_than` (or past their own TTL). The caller
    /// runs the full deletion pipeline for each.
    pub fn stale_groups(&self, older_than: Duration) -> Vec<Arc<GroupState>> {
        let now = current_time_ms();
        self.groups
            .iter()
            .filter(|e| e.value().is_stale(now, older_than))
            .map(|e| e.value().clone())
            .collect()
    }
}

impl Default for ConsumerGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================
