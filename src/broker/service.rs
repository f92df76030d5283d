//! MessageService: the engine facade.
//!
//! Publish pipeline: validate against the domain schema -> store (fatal on
//! error) -> enqueue -> notify subscribers -> route. Everything after the
//! store is best-effort: failures are logged and never surfaced to the
//! publisher. Routing is iterative over a worklist with a per-publish
//! visited set, so routing cycles terminate after one copy per queue.
//!
//! Consume pipeline: resolve the queue runtime, register the group, poll the
//! group's egress channel, pump from the repository on a miss, then advance
//! the group position and settle the ack matrix. A timeout is `Ok(None)`,
//! never an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::channel_queue::ChannelQueue;
use crate::broker::domain::{Domain, DomainRegistry};
use crate::broker::group::{ConsumerGroupRegistry, GroupState};
use crate::broker::message::Message;
use crate::broker::repository::MessageRepository;
use crate::broker::routing::{Predicate, RoutingRule, RoutingTable};
use crate::broker::snapshot::{DomainSnapshot, EngineSnapshot, GroupSnapshot, QueueSnapshot};
use crate::broker::subscription::{SubscriptionHandler, SubscriptionRegistry};
use crate::broker::schema::Schema;
use crate::broker::types::{ConsumeOptions, DeliveryMode, QueueConfig};
use crate::config::Config;
use crate::error::BrokerError;
use crate::utils::utils_time::format_time_ms;

type QueueKey = (String, String);

pub struct MessageService {
    domains: DomainRegistry,
    repository: Arc<MessageRepository>,
    groups: ConsumerGroupRegistry,
    routing: RoutingTable,
    subscriptions: SubscriptionRegistry,
    runtimes: DashMap<QueueKey, Arc<ChannelQueue>>,
    consume_cfg: crate::config::ConsumeConfig,
    broadcast_send_timeout: Duration,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
}

impl MessageService {
    pub fn new(config: &Config) -> Self {
        Self {
            domains: DomainRegistry::new(),
            repository: Arc::new(MessageRepository::new()),
            groups: ConsumerGroupRegistry::new(),
            routing: RoutingTable::new(),
            subscriptions: SubscriptionRegistry::new(),
            runtimes: DashMap::new(),
            consume_cfg: config.consume.clone(),
            broadcast_send_timeout: Duration::from_millis(config.queue.broadcast_send_timeout_ms),
            shutdown_timeout: config.engine.shutdown_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Root cancellation for everything the service spawns. Sweepers take
    /// child tokens from here.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn repository(&self) -> &Arc<MessageRepository> {
        &self.repository
    }

    // ==========================================
    // DOMAIN / QUEUE ADMIN
    // ==========================================

    pub fn create_domain(&self, name: &str, schema: Option<Schema>) -> Result<(), BrokerError> {
        self.domains.create_domain(name, schema)?;
        info!("[MessageService] domain '{}' created", name);
        Ok(())
    }

    /// Stops every queue the domain owns in parallel (bounded by the
    /// shutdown timeout), then removes the domain and its routes.
    pub async fn delete_domain(&self, name: &str) -> Result<(), BrokerError> {
        let domain = self.domains.get(name)?;
        let queues = domain.queue_names();

        let stopping: Vec<Arc<ChannelQueue>> = queues
            .iter()
            .filter_map(|q| {
                self.runtimes
                    .remove(&(name.to_string(), q.clone()))
                    .map(|(_, cq)| cq)
            })
            .collect();
        futures_util::future::join_all(
            stopping.iter().map(|cq| cq.stop(self.shutdown_timeout)),
        )
        .await;

        for queue in &queues {
            for group in self.groups.list(name, queue) {
                let _ = self.groups.delete(name, queue, &group.id);
            }
            self.repository.drop_queue(name, queue);
        }
        self.routing.drop_domain(name);
        self.domains.remove_domain(name)?;
        info!("[MessageService] domain '{}' deleted ({} queues stopped)", name, queues.len());
        Ok(())
    }

    pub fn list_domains(&self) -> Vec<Arc<Domain>> {
        self.domains.list()
    }

    pub fn create_queue(&self, domain: &str, queue: &str, config: QueueConfig) -> Result<(), BrokerError> {
        self.domains.create_queue(domain, queue, config)?;
        self.repository.register_queue(domain, queue);
        info!("[MessageService] queue '{}/{}' created", domain, queue);
        Ok(())
    }

    pub async fn delete_queue(&self, domain: &str, queue: &str) -> Result<(), BrokerError> {
        self.domains.remove_queue(domain, queue)?;
        if let Some((_, cq)) = self.runtimes.remove(&(domain.to_string(), queue.to_string())) {
            cq.stop(self.shutdown_timeout).await;
        }
        for group in self.groups.list(domain, queue) {
            let _ = self.groups.delete(domain, queue, &group.id);
        }
        self.routing.remove_queue(domain, queue);
        self.repository.drop_queue(domain, queue);
        info!("[MessageService] queue '{}/{}' deleted", domain, queue);
        Ok(())
    }

    pub fn list_queues(&self, domain: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self.domains.get(domain)?.queue_names())
    }

    pub fn queue_config(&self, domain: &str, queue: &str) -> Result<QueueConfig, BrokerError> {
        self.domains.queue_config(domain, queue)
    }

    // ==========================================
    // PUBLISH
    // ==========================================

    /// Returns the stored message id. After the initial store succeeds, the
    /// enqueue/notify/route side effects are best-effort, and routed copies
    /// flow through the same per-queue pipeline.
    pub async fn publish(&self, domain: &str, queue: &str, msg: Message) -> Result<String, BrokerError> {
        let domain_entry = self.domains.get(domain)?;
        let stored = self.publish_one(&domain_entry, queue, msg).await?;
        let root_id = stored.id.clone();

        // Iterative routing: worklist plus a per-publish visited set, so a
        // routing cycle delivers at most one copy per queue and terminates.
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(queue.to_string());
        let mut worklist: Vec<(String, Arc<Message>)> = vec![(queue.to_string(), stored)];

        while let Some((source, message)) = worklist.pop() {
            for destination in self.routing.matches(domain, &source, &message) {
                if !visited.insert(destination.clone()) {
                    continue;
                }
                match self.publish_one(&domain_entry, &destination, message.routed_copy()).await {
                    Ok(routed) => worklist.push((destination, routed)),
                    Err(e) => warn!(
                        "[MessageService] route '{}/{}' -> '{}' dropped: {}",
                        domain, source, destination, e
                    ),
                }
            }
        }
        Ok(root_id)
    }

    /// Single-queue publish: validate, enrich, store, enqueue, notify.
    async fn publish_one(
        &self,
        domain: &Arc<Domain>,
        queue: &str,
        mut msg: Message,
    ) -> Result<Arc<Message>, BrokerError> {
        if !domain.has_queue(queue) {
            return Err(BrokerError::QueueNotFound(domain.name.clone(), queue.to_string()));
        }
        if let Some(schema) = &domain.schema {
            schema.validate(&msg.payload)?;
        }
        msg.enrich(&domain.name, queue);

        let (index, stored) = self.repository.store(&domain.name, queue, msg)?;

        match self.get_or_create_runtime(&domain.name, queue) {
            Ok(cq) => {
                if let Err(e) = cq.enqueue(stored.clone(), index).await {
                    warn!("[MessageService] enqueue on '{}/{}' failed: {}", domain.name, queue, e);
                }
            }
            Err(e) => warn!("[MessageService] no runtime for '{}/{}': {}", domain.name, queue, e),
        }
        self.subscriptions.notify(&domain.name, queue, &stored);
        Ok(stored)
    }

    // ==========================================
    // CONSUME
    // ==========================================

    /// `Ok(None)` means no message within the timeout. Cancellation of the
    /// caller's token during a wait returns `Err(Cancelled)`.
    pub async fn consume_with_group(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        queue: &str,
        group: &str,
        options: ConsumeOptions,
    ) -> Result<Option<Arc<Message>>, BrokerError> {
        // missing domain and missing queue look the same to a consumer
        self.domains.queue_config(domain, queue).map_err(|e| match e {
            BrokerError::DomainNotFound(_) => {
                BrokerError::QueueNotFound(domain.to_string(), queue.to_string())
            }
            other => other,
        })?;
        let cq = self.get_or_create_runtime(domain, queue)?;

        let consumer_id = options.consumer_id.clone().unwrap_or_default();
        let was_known = self.groups.get(domain, queue, group).is_some();
        let state = self.groups.register_consumer(domain, queue, group, &consumer_id);
        if let Err(e) = cq.register_group(group, state.position()) {
            // a singleConsumer rejection must not leave a half-created group
            if !was_known {
                let _ = self.groups.delete(domain, queue, group);
            }
            return Err(e);
        }

        // explicit seeks are the only way a position moves backwards
        if options.reset_offset {
            state.force_position(0);
            cq.reset_group(group, 0).await;
        } else if let Some(start_id) = &options.start_from_id {
            let index = self.repository.index_of(domain, queue, start_id)?;
            state.force_position(index);
            cq.reset_group(group, index).await;
        }

        self.repository.attach_group(domain, queue, group)?;

        // fast path: a short poll on the egress channel
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.consume_cfg.default_timeout_ms));
        let poll = Duration::from_millis(self.consume_cfg.poll_ms).min(timeout);
        let mut delivered = cq.recv_for_group(group, poll, cancel).await?;

        // slow path: ask the dispatcher to pump, then wait out the timeout
        if delivered.is_none() {
            let max_count = options.max_count.unwrap_or(self.consume_cfg.default_batch);
            cq.request_messages(group, max_count).await;
            let remaining = timeout.saturating_sub(poll);
            delivered = cq.recv_for_group(group, remaining, cancel).await?;
        }

        let msg = match delivered {
            Some(msg) => msg,
            None => return Ok(None),
        };

        // advance: position = delivered index + 1, monotonic
        state.touch();
        if let Ok(index) = self.repository.index_of(domain, queue, &msg.id) {
            let position = state.store_position(index + 1);
            cq.set_position(group, position);
        }

        // settle the ack matrix and delete when allowed
        let matrix = self.repository.ack_matrix(domain, queue)?;
        let fully_acked = matrix.acknowledge(group, &msg.id);
        let delete_now = fully_acked
            || cq.delivery_mode() == DeliveryMode::SingleConsumer
            || !cq.is_persistent();
        if delete_now {
            match self.repository.delete_message(domain, queue, &msg.id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!("[MessageService] '{}' already deleted by a concurrent acker", msg.id)
                }
                Err(e) => warn!("[MessageService] post-ack delete of '{}' failed: {}", msg.id, e),
            }
        }

        // housekeeping off the consume path: index compaction every K consumes
        let consumes = cq.bump_consumes();
        if consumes % self.consume_cfg.compaction_every.max(1) == 0 {
            self.spawn_compaction(domain, queue, &cq);
        }

        Ok(Some(msg))
    }

    /// Compaction: drop index entries below the smallest live group position
    /// minus the safety margin. The margin covers consumes whose position
    /// store has not landed yet.
    fn spawn_compaction(&self, domain: &str, queue: &str, cq: &Arc<ChannelQueue>) {
        let repository = self.repository.clone();
        let cq = cq.clone();
        let margin = self.consume_cfg.compaction_margin;
        let domain = domain.to_string();
        let queue = queue.to_string();
        tokio::spawn(async move {
            if let Some(min_position) = cq.min_live_position() {
                let safe_pos = min_position - margin;
                if safe_pos > 0 {
                    repository.cleanup_message_indices(&domain, &queue, safe_pos);
                    debug!("[MessageService] compacted '{}/{}' below {}", domain, queue, safe_pos);
                }
            }
        });
    }

    // ==========================================
    // SUBSCRIPTIONS
    // ==========================================

    pub fn subscribe(
        &self,
        domain: &str,
        queue: &str,
        handler: SubscriptionHandler,
    ) -> Result<String, BrokerError> {
        self.domains.queue_config(domain, queue)?;
        Ok(self.subscriptions.subscribe(domain, queue, handler))
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.unsubscribe(subscription_id)
    }

    // ==========================================
    // ROUTING ADMIN
    // ==========================================

    pub fn add_routing_rule(
        &self,
        domain: &str,
        source: &str,
        destination: &str,
        predicate: Predicate,
    ) -> Result<(), BrokerError> {
        let domain_entry = self.domains.get(domain)?;
        for queue in [source, destination] {
            if !domain_entry.has_queue(queue) {
                return Err(BrokerError::QueueNotFound(domain.to_string(), queue.to_string()));
            }
        }
        self.routing.add(
            domain,
            RoutingRule {
                source: source.to_string(),
                destination: destination.to_string(),
                predicate,
            },
        )
    }

    pub fn remove_routing_rule(
        &self,
        domain: &str,
        source: &str,
        destination: &str,
    ) -> Result<(), BrokerError> {
        self.domains.get(domain)?;
        self.routing.remove(domain, source, destination)
    }

    pub fn list_routing_rules(
        &self,
        domain: &str,
        source: Option<&str>,
    ) -> Result<Vec<Arc<RoutingRule>>, BrokerError> {
        self.domains.get(domain)?;
        Ok(self.routing.list(domain, source))
    }

    // ==========================================
    // GROUP ADMIN
    // ==========================================

    pub fn create_consumer_group(
        &self,
        domain: &str,
        queue: &str,
        group: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.domains.queue_config(domain, queue)?;
        let was_known = self.groups.get(domain, queue, group).is_some();
        let state = self.groups.register_consumer(domain, queue, group, "");
        if let Some(ttl) = ttl {
            state.set_ttl(ttl);
        }
        let cq = self.get_or_create_runtime(domain, queue)?;
        if let Err(e) = cq.register_group(group, state.position()) {
            if !was_known {
                let _ = self.groups.delete(domain, queue, group);
            }
            return Err(e);
        }
        self.repository.attach_group(domain, queue, group)?;
        Ok(())
    }

    /// Deleting a group that still owes acks is always allowed; messages no
    /// other group owes become deletable on the spot.
    pub fn delete_consumer_group(&self, domain: &str, queue: &str, group: &str) -> Result<(), BrokerError> {
        self.groups.delete(domain, queue, group)?;
        if let Some(cq) = self.runtime(domain, queue) {
            cq.remove_group(group);
        }
        if let Ok(matrix) = self.repository.ack_matrix(domain, queue) {
            for msg_id in matrix.remove_group(group) {
                match self.repository.delete_message(domain, queue, &msg_id) {
                    Ok(()) | Err(BrokerError::MessageNotFound(_)) => {}
                    Err(e) => warn!(
                        "[MessageService] delete of released '{}' on '{}/{}' failed: {}",
                        msg_id, domain, queue, e
                    ),
                }
            }
        }
        info!("[MessageService] group '{}' removed from '{}/{}'", group, domain, queue);
        Ok(())
    }

    pub fn list_consumer_groups(&self, domain: &str, queue: &str) -> Result<Vec<Arc<GroupState>>, BrokerError> {
        self.domains.queue_config(domain, queue)?;
        let mut groups = self.groups.list(domain, queue);
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    /// `ttl_secs` of zero means "no expiry"; negative values are invalid.
    pub fn update_group_ttl(&self, domain: &str, queue: &str, group: &str, ttl_secs: i64) -> Result<(), BrokerError> {
        if ttl_secs < 0 {
            return Err(BrokerError::InvalidTtl(format!("{} is negative", ttl_secs)));
        }
        let state = self.groups.get(domain, queue, group).ok_or_else(|| {
            BrokerError::GroupNotFound(domain.to_string(), queue.to_string(), group.to_string())
        })?;
        state.set_ttl(Duration::from_secs(ttl_secs as u64));
        Ok(())
    }

    /// Materialized messages the group still owes, in store order.
    pub fn pending_messages(&self, domain: &str, queue: &str, group: &str) -> Result<Vec<Arc<Message>>, BrokerError> {
        let matrix = self.repository.ack_matrix(domain, queue)?;
        Ok(matrix
            .pending_ids(group)
            .iter()
            .filter_map(|id| self.repository.get_message(domain, queue, id))
            .collect())
    }

    pub fn group_position(&self, domain: &str, queue: &str, group: &str) -> i64 {
        self.groups.position(domain, queue, group)
    }

    // ==========================================
    // SWEEPS (invoked by the engine's background tasks)
    // ==========================================

    /// Remove groups idle past `older_than` (or past their own TTL).
    /// Returns how many were removed.
    pub fn sweep_stale_groups(&self, older_than: Duration) -> usize {
        let mut removed = 0;
        for state in self.groups.stale_groups(older_than) {
            match self.delete_consumer_group(&state.domain, &state.queue, &state.id) {
                Ok(()) => {
                    info!(
                        "[MessageService] stale group '{}' swept from '{}/{}'",
                        state.id, state.domain, state.queue
                    );
                    removed += 1;
                }
                Err(e) => warn!(
                    "[MessageService] stale sweep of '{}' on '{}/{}' failed: {}",
                    state.id, state.domain, state.queue, e
                ),
            }
        }
        removed
    }

    /// Orphan-queue GC. `observed` is the sweeper's own memory of when each
    /// queue was first seen with zero groups; any group registration resets
    /// the clock. Queues past the threshold get bulk-deleted and their
    /// indices wiped. Returns how many queues were purged.
    pub fn sweep_orphan_queues(
        &self,
        threshold: Duration,
        observed: &mut HashMap<QueueKey, Instant>,
    ) -> usize {
        let mut purged = 0;
        let mut live: HashSet<QueueKey> = HashSet::new();
        for domain in self.domains.list() {
            for queue in domain.queue_names() {
                let key = (domain.name.clone(), queue.clone());
                live.insert(key.clone());
                if !self.groups.list(&domain.name, &queue).is_empty() {
                    observed.remove(&key);
                    continue;
                }
                let since = *observed.entry(key.clone()).or_insert_with(Instant::now);
                if since.elapsed() >= threshold {
                    let dropped = self.repository.delete_all_messages(&domain.name, &queue);
                    self.repository.clear_queue_indices(&domain.name, &queue);
                    observed.remove(&key);
                    info!(
                        "[MessageService] orphan queue '{}/{}' purged ({} messages)",
                        domain.name, queue, dropped
                    );
                    purged += 1;
                }
            }
        }
        // forget queues that no longer exist
        observed.retain(|key, _| live.contains(key));
        purged
    }

    // ==========================================
    // LIFECYCLE & OBSERVABILITY
    // ==========================================

    /// Stop every queue runtime in parallel; each gets the shutdown cap.
    pub async fn stop_all_queues(&self) {
        self.shutdown.cancel();
        let runtimes: Vec<Arc<ChannelQueue>> = self
            .runtimes
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.runtimes.clear();
        futures_util::future::join_all(
            runtimes.iter().map(|cq| cq.stop(self.shutdown_timeout)),
        )
        .await;
    }

    pub fn snapshot(&self, uptime: Duration) -> EngineSnapshot {
        let mut domains = Vec::new();
        for domain in self.domains.list() {
            let mut queues = Vec::new();
            for queue in domain.queue_names() {
                let config = match domain.queue_config(&queue) {
                    Some(config) => config,
                    None => continue,
                };
                let matrix = self.repository.ack_matrix(&domain.name, &queue).ok();
                let groups = self
                    .groups
                    .list(&domain.name, &queue)
                    .into_iter()
                    .map(|g| GroupSnapshot {
                        id: g.id.clone(),
                        position: g.position(),
                        consumers: g.consumers(),
                        pending: matrix
                            .as_ref()
                            .map(|m| m.pending_count(&g.id))
                            .unwrap_or(0),
                        ttl_secs: g.ttl().as_secs(),
                        created_at: format_time_ms(g.created_at_ms),
                        last_activity: format_time_ms(g.last_activity_ms()),
                    })
                    .collect();
                queues.push(QueueSnapshot {
                    name: queue.clone(),
                    delivery_mode: config.delivery_mode,
                    is_persistent: config.is_persistent,
                    message_count: self.repository.message_count(&domain.name, &queue),
                    route_count: self.routing.list(&domain.name, Some(queue.as_str())).len(),
                    groups,
                });
            }
            domains.push(DomainSnapshot {
                name: domain.name.clone(),
                has_schema: domain.schema.is_some(),
                queues,
            });
        }
        EngineSnapshot {
            uptime_secs: uptime.as_secs(),
            domains,
        }
    }

    // --- HELPERS ---

    fn runtime(&self, domain: &str, queue: &str) -> Option<Arc<ChannelQueue>> {
        self.runtimes
            .get(&(domain.to_string(), queue.to_string()))
            .map(|e| e.value().clone())
    }

    /// Lazy start: the first access to a queue spins up its worker pool.
    fn get_or_create_runtime(&self, domain: &str, queue: &str) -> Result<Arc<ChannelQueue>, BrokerError> {
        if let Some(cq) = self.runtime(domain, queue) {
            return Ok(cq);
        }
        let config = self.domains.queue_config(domain, queue)?;
        let cq = self
            .runtimes
            .entry((domain.to_string(), queue.to_string()))
            .or_insert_with(|| {
                Arc::new(ChannelQueue::start(
                    domain,
                    queue,
                    config,
                    self.broadcast_send_timeout,
                    self.repository.clone(),
                    &self.shutdown,
                ))
            })
            .clone();
        Ok(cq)
    }
}
