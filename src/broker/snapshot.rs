//! Observability snapshots consumed by the monitoring layer.

use serde::Serialize;

use crate::broker::types::DeliveryMode;

#[derive(Serialize)]
pub struct EngineSnapshot {
    pub uptime_secs: u64,
    pub domains: Vec<DomainSnapshot>,
}

#[derive(Serialize)]
pub struct DomainSnapshot {
    pub name: String,
    pub has_schema: bool,
    pub queues: Vec<QueueSnapshot>,
}

#[derive(Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub delivery_mode: DeliveryMode,
    pub is_persistent: bool,
    pub message_count: usize,
    pub route_count: usize,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Serialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub position: i64,
    pub consumers: Vec<String>,
    pub pending: usize,
    pub ttl_secs: u64,
    pub created_at: String,
    pub last_activity: String,
}
