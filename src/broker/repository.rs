//! MessageRepository: in-memory store of messages per (domain, queue).
//!
//! Each queue keeps two indices, `id -> index` and `index -> id`; indices are
//! dense and append-only, so group positions can seek by index. Deleting a
//! message removes the payload but leaves the index slot in place until
//! compaction, keeping outstanding group positions valid. The repository owns
//! exactly one AckMatrix per queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::broker::ack::AckMatrix;
use crate::broker::message::Message;
use crate::error::BrokerError;

type QueueKey = (String, String);

pub struct MessageRepository {
    queues: DashMap<QueueKey, Arc<QueueStore>>,
}

struct QueueStore {
    inner: RwLock<QueueInner>,
    ack: Arc<AckMatrix>,
}

#[derive(Default)]
struct QueueInner {
    messages: HashMap<String, Arc<Message>>,
    id_to_index: HashMap<String, i64>,
    index_to_id: BTreeMap<i64, String>,
    next_index: i64,
}

impl MessageRepository {
    pub fn new() -> Self {
        Self { queues: DashMap::new() }
    }

    /// Called by queue creation. Idempotent.
    pub fn register_queue(&self, domain: &str, queue: &str) {
        self.queues
            .entry((domain.to_string(), queue.to_string()))
            .or_insert_with(|| {
                Arc::new(QueueStore {
                    inner: RwLock::new(QueueInner::default()),
                    ack: Arc::new(AckMatrix::new()),
                })
            });
    }

    pub fn drop_queue(&self, domain: &str, queue: &str) {
        self.queues.remove(&(domain.to_string(), queue.to_string()));
    }

    fn store_for(&self, domain: &str, queue: &str) -> Result<Arc<QueueStore>, BrokerError> {
        self.queues
            .get(&(domain.to_string(), queue.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::QueueNotFound(domain.to_string(), queue.to_string()))
    }

    /// Assigns the next index to `msg` and records it. Duplicate ids are an
    /// error, never a silent replace.
    pub fn store(
        &self,
        domain: &str,
        queue: &str,
        msg: Message,
    ) -> Result<(i64, Arc<Message>), BrokerError> {
        let store = self.store_for(domain, queue)?;
        let id = msg.id.clone();
        let stored = Arc::new(msg);
        let index = {
            let mut inner = store.inner.write();
            if inner.id_to_index.contains_key(&id) {
                return Err(BrokerError::MessageAlreadyExists(id));
            }
            let index = inner.next_index;
            inner.next_index += 1;
            inner.id_to_index.insert(id.clone(), index);
            inner.index_to_id.insert(index, id.clone());
            inner.messages.insert(id.clone(), stored.clone());
            index
        };
        // matrix update outside the store lock
        store.ack.message_stored(&id);
        Ok((index, stored))
    }

    /// Up to `limit` live messages with index >= `start`, in index order.
    /// Empty on exhaustion or unknown queue, never an error.
    pub fn messages_after_index(
        &self,
        domain: &str,
        queue: &str,
        start: i64,
        limit: usize,
    ) -> Vec<(i64, Arc<Message>)> {
        let store = match self.store_for(domain, queue) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let inner = store.inner.read();
        inner
            .index_to_id
            .range(start..)
            .filter_map(|(idx, id)| inner.messages.get(id).map(|m| (*idx, m.clone())))
            .take(limit)
            .collect()
    }

    pub fn index_of(&self, domain: &str, queue: &str, msg_id: &str) -> Result<i64, BrokerError> {
        let store = self.store_for(domain, queue)?;
        let inner = store.inner.read();
        inner
            .id_to_index
            .get(msg_id)
            .copied()
            .ok_or_else(|| BrokerError::MessageNotFound(msg_id.to_string()))
    }

    pub fn get_message(&self, domain: &str, queue: &str, msg_id: &str) -> Option<Arc<Message>> {
        let store = self.store_for(domain, queue).ok()?;
        let inner = store.inner.read();
        inner.messages.get(msg_id).cloned()
    }

    /// Remove the payload; the index slot survives until compaction so group
    /// positions keep their meaning.
    pub fn delete_message(&self, domain: &str, queue: &str, msg_id: &str) -> Result<(), BrokerError> {
        let store = self.store_for(domain, queue)?;
        let removed = store.inner.write().messages.remove(msg_id).is_some();
        if !removed {
            return Err(BrokerError::MessageNotFound(msg_id.to_string()));
        }
        store.ack.remove_message(msg_id);
        Ok(())
    }

    /// Delete every live message. Returns how many were dropped.
    pub fn delete_all_messages(&self, domain: &str, queue: &str) -> usize {
        let store = match self.store_for(domain, queue) {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let ids: Vec<String> = {
            let mut inner = store.inner.write();
            inner.messages.drain().map(|(id, _)| id).collect()
        };
        for id in &ids {
            store.ack.remove_message(id);
        }
        ids.len()
    }

    /// Drop index entries strictly below `safe_pos`. Callers guarantee no
    /// live group position still needs them (see the compaction protocol in
    /// the consume path).
    pub fn cleanup_message_indices(&self, domain: &str, queue: &str, safe_pos: i64) {
        let store = match self.store_for(domain, queue) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut inner = store.inner.write();
        let dead: Vec<(i64, String)> = inner
            .index_to_id
            .range(..safe_pos)
            .map(|(idx, id)| (*idx, id.clone()))
            .collect();
        for (idx, id) in dead {
            inner.index_to_id.remove(&idx);
            inner.id_to_index.remove(&id);
        }
    }

    /// Wipe all indices. Only for queues proven to have had no consumer
    /// groups past the orphan threshold.
    pub fn clear_queue_indices(&self, domain: &str, queue: &str) {
        if let Ok(store) = self.store_for(domain, queue) {
            let mut inner = store.inner.write();
            inner.id_to_index.clear();
            inner.index_to_id.clear();
        }
    }

    pub fn ack_matrix(&self, domain: &str, queue: &str) -> Result<Arc<AckMatrix>, BrokerError> {
        Ok(self.store_for(domain, queue)?.ack.clone())
    }

    /// Register a group with the queue's matrix; it starts owing every
    /// currently-live message.
    pub fn attach_group(&self, domain: &str, queue: &str, group: &str) -> Result<(), BrokerError> {
        let store = self.store_for(domain, queue)?;
        let live: Vec<String> = {
            let inner = store.inner.read();
            inner
                .index_to_id
                .values()
                .filter(|id| inner.messages.contains_key(*id))
                .cloned()
                .collect()
        };
        store.ack.register_group(group, live);
        Ok(())
    }

    pub fn message_count(&self, domain: &str, queue: &str) -> usize {
        self.store_for(domain, queue)
            .map(|s| s.inner.read().messages.len())
            .unwrap_or(0)
    }

    pub fn next_index(&self, domain: &str, queue: &str) -> i64 {
        self.store_for(domain, queue)
            .map(|s| s.inner.read().next_index)
            .unwrap_or(0)
    }
}

impl Default for MessageRepository {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================
