//! AckMatrix: per-queue bookkeeping of which groups have acknowledged which
//! messages.
//!
//! Bidirectional under one lock: `acks: msg -> set<group>` and the reverse
//! `pending: group -> ordered set<msg>`. A message is fully acknowledged when
//! every group registered *at that moment* has acked it. Groups that join
//! after a message was stored owe an ack for it, so late joiners never cause
//! premature deletion.

use std::collections::{HashMap, HashSet};
use hashlink::LinkedHashSet;
use parking_lot::Mutex;

pub struct AckMatrix {
    inner: Mutex<MatrixInner>,
}

#[derive(Default)]
struct MatrixInner {
    groups: HashSet<String>,
    /// msg id -> groups that acked it. A row exists for every live message.
    acks: HashMap<String, HashSet<String>>,
    /// group -> msg ids still owed, in store order.
    pending: HashMap<String, LinkedHashSet<String>>,
}

impl MatrixInner {
    fn fully_acked(&self, msg_id: &str) -> bool {
        let acked_by = match self.acks.get(msg_id) {
            Some(set) => set,
            None => return false,
        };
        self.groups.iter().all(|g| acked_by.contains(g))
    }
}

impl AckMatrix {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MatrixInner::default()) }
    }

    /// Register a group. Every live message it has not acked becomes pending
    /// for it. Idempotent.
    pub fn register_group<I>(&self, group: &str, live_messages: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut inner = self.inner.lock();
        if !inner.groups.insert(group.to_string()) {
            return;
        }
        let mut owed = LinkedHashSet::new();
        for id in live_messages {
            let acked = inner.acks.get(&id).map(|s| s.contains(group)).unwrap_or(false);
            if !acked {
                owed.insert(id);
            }
        }
        inner.pending.insert(group.to_string(), owed);
    }

    pub fn registered_groups(&self) -> Vec<String> {
        self.inner.lock().groups.iter().cloned().collect()
    }

    /// A new message was stored: open its row and mark it owed by every
    /// currently-registered group.
    pub fn message_stored(&self, msg_id: &str) {
        let mut inner = self.inner.lock();
        inner.acks.entry(msg_id.to_string()).or_default();
        let groups: Vec<String> = inner.groups.iter().cloned().collect();
        for group in groups {
            inner
                .pending
                .entry(group)
                .or_default()
                .insert(msg_id.to_string());
        }
    }

    /// Record an ack. Returns true iff every currently-registered group has
    /// now acked this message.
    pub fn acknowledge(&self, group: &str, msg_id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner
            .acks
            .entry(msg_id.to_string())
            .or_default()
            .insert(group.to_string());
        if let Some(owed) = inner.pending.get_mut(group) {
            owed.remove(msg_id);
        }
        inner.fully_acked(msg_id)
    }

    pub fn is_acked(&self, group: &str, msg_id: &str) -> bool {
        self.inner
            .lock()
            .acks
            .get(msg_id)
            .map(|s| s.contains(group))
            .unwrap_or(false)
    }

    /// Drop a group's column. Returns the messages it still owed that no
    /// remaining group owes either: they became deletable by this removal.
    pub fn remove_group(&self, group: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        if !inner.groups.remove(group) {
            return Vec::new();
        }
        let owed = inner.pending.remove(group).unwrap_or_default();
        for acked_by in inner.acks.values_mut() {
            acked_by.remove(group);
        }
        owed.into_iter()
            .filter(|msg_id| inner.fully_acked(msg_id) || inner.groups.is_empty())
            .collect()
    }

    /// Forget a message entirely (row drop on repository deletion).
    pub fn remove_message(&self, msg_id: &str) {
        let mut inner = self.inner.lock();
        inner.acks.remove(msg_id);
        for owed in inner.pending.values_mut() {
            owed.remove(msg_id);
        }
    }

    pub fn pending_count(&self, group: &str) -> usize {
        self.inner.lock().pending.get(group).map(|s| s.len()).unwrap_or(0)
    }

    /// Messages still owed by the group, in store order.
    pub fn pending_ids(&self, group: &str) -> Vec<String> {
        self.inner
            .lock()
            .pending
            .get(group)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for AckMatrix {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_group_full_ack() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.message_stored("m1");

        assert_eq!(matrix.pending_count("g1"), 1);
        assert!(matrix.acknowledge("g1", "m1"), "only group acked -> fully acked");
        assert_eq!(matrix.pending_count("g1"), 0);
    }

    #[test]
    fn test_two_groups_need_both_acks() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.register_group("g2", std::iter::empty());
        matrix.message_stored("m1");

        assert!(!matrix.acknowledge("g1", "m1"), "g2 still owes");
        assert!(matrix.acknowledge("g2", "m1"), "both acked");
    }

    #[test]
    fn test_late_joiner_owes_live_messages() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.message_stored("m1");
        assert!(matrix.acknowledge("g1", "m1"));

        // m2 stored, then g2 joins while m2 is still live
        matrix.message_stored("m2");
        matrix.register_group("g2", vec!["m2".to_string()]);

        assert_eq!(matrix.pending_count("g2"), 1);
        assert!(!matrix.acknowledge("g1", "m2"), "late joiner g2 still owes m2");
        assert!(matrix.acknowledge("g2", "m2"));
    }

    #[test]
    fn test_remove_group_releases_messages() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.register_group("g2", std::iter::empty());
        matrix.message_stored("m1");
        matrix.message_stored("m2");

        // g1 acked m1 only; g2 acked nothing
        matrix.acknowledge("g1", "m1");

        // removing g2 releases m1 (now fully acked) but not m2 (g1 owes it)
        let deletable = matrix.remove_group("g2");
        assert_eq!(deletable, vec!["m1".to_string()]);
        assert_eq!(matrix.pending_count("g1"), 1);
    }

    #[test]
    fn test_remove_last_group_releases_everything_it_owed() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.message_stored("m1");
        matrix.message_stored("m2");

        let mut deletable = matrix.remove_group("g1");
        deletable.sort();
        assert_eq!(deletable, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_pending_ids_keep_store_order() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        for id in ["a", "b", "c"] {
            matrix.message_stored(id);
        }
        matrix.acknowledge("g1", "b");
        assert_eq!(matrix.pending_ids("g1"), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_register_group_is_idempotent() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.message_stored("m1");
        // re-registering must not wipe the pending set
        matrix.register_group("g1", std::iter::empty());
        assert_eq!(matrix.pending_count("g1"), 1);
    }

    #[test]
    fn test_remove_message_clears_pending() {
        let matrix = AckMatrix::new();
        matrix.register_group("g1", std::iter::empty());
        matrix.message_stored("m1");
        matrix.remove_message("m1");
        assert_eq!(matrix.pending_count("g1"), 0);
        assert!(!matrix.is_acked("g1", "m1"));
    }
}
