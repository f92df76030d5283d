//! ChannelQueue: the per-queue delivery runtime.
//!
//! One bounded ingress (signal) channel, one bounded egress channel per
//! registered group, and a pool of dispatcher workers draining the shared
//! ingress. Delivery modes fan messages out on the push path; on a consume
//! miss the group asks the dispatcher to pump from the repository at its own
//! position. A per-group `last_pushed` cursor keeps the push and pull paths
//! from double-feeding the same egress channel.
//!
//! Backpressure on broadcast is bounded-block: the dispatcher waits up to the
//! configured send timeout for egress capacity, then drops that delivery with
//! a warning. The message is still in the repository and still pending in the
//! ack matrix, so the group re-pulls it on its next consume.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::repository::MessageRepository;
use crate::broker::types::{DeliveryMode, QueueConfig};
use crate::error::BrokerError;

// ==========================================
// SIGNALS
// ==========================================

enum QueueSignal {
    /// A freshly stored message to dispatch according to the delivery mode.
    Enqueue { msg: Arc<Message>, index: i64 },
    /// A group missed on its egress channel and wants `max` messages pumped
    /// from the repository at its position.
    Pump { group: String, max: usize },
}

struct GroupChannel {
    tx: mpsc::Sender<Arc<Message>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Message>>>,
    /// Highest repository index ever pushed into `tx`; -1 when none.
    last_pushed: AtomicI64,
    /// Serializes pushers. Concurrent workers feeding one egress channel
    /// must not reorder or double-deliver.
    push_gate: tokio::sync::Mutex<()>,
}

enum PushOutcome {
    Pushed,
    /// Already carried by the channel, or pushing it now would overtake an
    /// earlier undelivered index.
    Skipped,
    Full,
    Closed,
}

// ==========================================
// CHANNEL QUEUE
// ==========================================

pub struct ChannelQueue {
    core: Arc<QueueCore>,
    signal_tx: mpsc::Sender<QueueSignal>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct QueueCore {
    domain: String,
    queue: String,
    config: QueueConfig,
    broadcast_send_timeout: Duration,
    repository: Arc<MessageRepository>,
    groups: RwLock<HashMap<String, Arc<GroupChannel>>>,
    /// In-memory mirror of group positions, clamped monotonic.
    positions: DashMap<String, i64>,
    rr_cursor: AtomicUsize,
    consumes: AtomicU64,
}

impl ChannelQueue {
    /// Spins up the worker pool. Called lazily on first access to the queue.
    pub fn start(
        domain: &str,
        queue: &str,
        config: QueueConfig,
        broadcast_send_timeout: Duration,
        repository: Arc<MessageRepository>,
        parent: &CancellationToken,
    ) -> Self {
        let core = Arc::new(QueueCore {
            domain: domain.to_string(),
            queue: queue.to_string(),
            broadcast_send_timeout,
            repository,
            groups: RwLock::new(HashMap::new()),
            positions: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
            consumes: AtomicU64::new(0),
            config,
        });

        let (signal_tx, signal_rx) = mpsc::channel(core.config.buffer_size());
        let shared_rx = Arc::new(tokio::sync::Mutex::new(signal_rx));
        let cancel = parent.child_token();

        let worker_count = core.config.workers();
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let core = core.clone();
            let rx = shared_rx.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, core, rx, cancel).await;
            }));
        }
        debug!(
            "[ChannelQueue:{}/{}] started with {} workers",
            domain, queue, worker_count
        );

        Self {
            core,
            signal_tx,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.core.config.delivery_mode
    }

    pub fn is_persistent(&self) -> bool {
        self.core.config.is_persistent
    }

    // --- Group membership ---

    /// Registers a group with its own egress channel. Idempotent. Fails with
    /// `AlreadyBound` when a singleConsumer queue already has another group.
    pub fn register_group(&self, group: &str, position: i64) -> Result<bool, BrokerError> {
        if self.core.groups.read().contains_key(group) {
            return Ok(false);
        }
        let mut groups = self.core.groups.write();
        if groups.contains_key(group) {
            return Ok(false);
        }
        if self.core.config.delivery_mode == DeliveryMode::SingleConsumer && !groups.is_empty() {
            return Err(BrokerError::AlreadyBound(self.core.queue.clone()));
        }
        let (tx, rx) = mpsc::channel(self.core.config.buffer_size());
        groups.insert(
            group.to_string(),
            Arc::new(GroupChannel {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                last_pushed: AtomicI64::new(position - 1),
                push_gate: tokio::sync::Mutex::new(()),
            }),
        );
        self.core.positions.insert(group.to_string(), position);
        Ok(true)
    }

    pub fn remove_group(&self, group: &str) {
        self.core.groups.write().remove(group);
        self.core.positions.remove(group);
    }

    // --- Positions ---

    /// Mirror advance; smaller values are clamped like the registry's.
    pub fn set_position(&self, group: &str, position: i64) {
        self.core
            .positions
            .entry(group.to_string())
            .and_modify(|p| {
                if position > *p {
                    *p = position;
                }
            })
            .or_insert(position);
    }

    /// Seek support: rewinds the mirror and the delivery cursor, and drains
    /// whatever was already sitting in the egress channel.
    pub async fn reset_group(&self, group: &str, position: i64) {
        let gc = { self.core.groups.read().get(group).cloned() };
        if let Some(gc) = gc {
            let mut rx = gc.rx.lock().await;
            while rx.try_recv().is_ok() {}
            gc.last_pushed.store(position - 1, Ordering::SeqCst);
        }
        self.core.positions.insert(group.to_string(), position);
    }

    /// Smallest position among groups that have advanced at least once.
    pub fn min_live_position(&self) -> Option<i64> {
        self.core
            .positions
            .iter()
            .map(|e| *e.value())
            .filter(|p| *p > 0)
            .min()
    }

    /// Consume-path counter for the compaction cadence.
    pub fn bump_consumes(&self) -> u64 {
        self.core.consumes.fetch_add(1, Ordering::Relaxed) + 1
    }

    // --- Delivery ---

    /// Hands a freshly stored message to the dispatcher pool. Backpressure
    /// here is the publisher's backpressure.
    pub async fn enqueue(&self, msg: Arc<Message>, index: i64) -> Result<(), BrokerError> {
        self.signal_tx
            .send(QueueSignal::Enqueue { msg, index })
            .await
            .map_err(|_| BrokerError::Storage(format!(
                "queue runtime '{}/{}' is stopped",
                self.core.domain, self.core.queue
            )))
    }

    /// Asks the dispatcher pool to pump `max` messages for `group`.
    pub async fn request_messages(&self, group: &str, max: usize) {
        let _ = self
            .signal_tx
            .send(QueueSignal::Pump { group: group.to_string(), max })
            .await;
    }

    /// Receive for a group. Zero `wait` is a non-blocking poll. Competing
    /// consumers of one group serialize on the egress receiver, which is what
    /// shared group progress means.
    pub async fn recv_for_group(
        &self,
        group: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Message>>, BrokerError> {
        let gc = { self.core.groups.read().get(group).cloned() };
        let gc = match gc {
            Some(gc) => gc,
            None => return Ok(None),
        };
        let mut rx = gc.rx.lock().await;
        if wait.is_zero() {
            return Ok(rx.try_recv().ok());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            received = tokio::time::timeout(wait, rx.recv()) => {
                Ok(received.ok().flatten())
            }
        }
    }

    // --- Lifecycle ---

    /// Graceful stop: cancel, wait for the workers to drain up to `timeout`,
    /// then force-terminate the stragglers.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(
            timeout,
            futures_util::future::join_all(handles),
        )
        .await;
        if drained.is_err() {
            warn!(
                "[ChannelQueue:{}/{}] drain timeout, force-terminating workers",
                self.core.domain, self.core.queue
            );
            for abort in aborts {
                abort.abort();
            }
        }
        debug!("[ChannelQueue:{}/{}] stopped", self.core.domain, self.core.queue);
    }
}

// ==========================================
// DISPATCHER WORKERS
// ==========================================

async fn worker_loop(
    worker_id: usize,
    core: Arc<QueueCore>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueSignal>>>,
    cancel: CancellationToken,
) {
    loop {
        // Hold the shared receiver only while waiting for the next signal.
        let signal = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = guard.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            }
        };
        match signal {
            QueueSignal::Enqueue { msg, index } => core.dispatch(msg, index).await,
            QueueSignal::Pump { group, max } => core.pump(&group, max).await,
        }
    }
    debug!(
        "[ChannelQueue:{}/{}] worker {} exited",
        core.domain, core.queue, worker_id
    );
}

impl QueueCore {
    fn group_snapshot(&self) -> Vec<(String, Arc<GroupChannel>)> {
        let groups = self.groups.read();
        let mut snapshot: Vec<_> = groups
            .iter()
            .map(|(name, gc)| (name.clone(), gc.clone()))
            .collect();
        // deterministic rotation order
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    async fn dispatch(&self, msg: Arc<Message>, index: i64) {
        let targets = self.group_snapshot();
        if targets.is_empty() {
            // Nobody is listening yet; the repository holds the message and
            // the first pump will deliver it.
            return;
        }
        match self.config.delivery_mode {
            DeliveryMode::Broadcast => {
                for (group, gc) in &targets {
                    self.guarded_push(group, gc, msg.clone(), index, self.broadcast_send_timeout, false)
                        .await;
                }
            }
            DeliveryMode::RoundRobin => {
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % targets.len();
                for offset in 0..targets.len() {
                    let (group, gc) = &targets[(start + offset) % targets.len()];
                    match self
                        .guarded_push(group, gc, msg.clone(), index, Duration::ZERO, true)
                        .await
                    {
                        PushOutcome::Pushed | PushOutcome::Skipped => return,
                        // full or gone: rotation moves to the next group
                        PushOutcome::Full | PushOutcome::Closed => {}
                    }
                }
            }
            DeliveryMode::SingleConsumer => {
                if let Some((group, gc)) = targets.first() {
                    self.guarded_push(group, gc, msg, index, self.broadcast_send_timeout, false)
                        .await;
                }
            }
        }
    }

    /// Pull path: feed the requesting group from the repository at its own
    /// position, skipping what it already acked and what its channel already
    /// carries.
    async fn pump(&self, group: &str, max: usize) {
        let gc = { self.groups.read().get(group).cloned() };
        let gc = match gc {
            Some(gc) => gc,
            None => return,
        };
        let position = self.positions.get(group).map(|e| *e.value()).unwrap_or(0);
        let matrix = match self.repository.ack_matrix(&self.domain, &self.queue) {
            Ok(matrix) => matrix,
            Err(_) => return, // queue dropped underneath us
        };
        let batch = self
            .repository
            .messages_after_index(&self.domain, &self.queue, position, max);
        for (index, msg) in batch {
            if matrix.is_acked(group, &msg.id) {
                continue;
            }
            match self
                .guarded_push(group, &gc, msg, index, Duration::ZERO, true)
                .await
            {
                PushOutcome::Pushed | PushOutcome::Skipped => {}
                PushOutcome::Full => break,
                PushOutcome::Closed => return,
            }
        }
    }

    /// All pushes to one egress channel funnel through its gate. The ordered
    /// modes (`allow_gap == false`) only ever append the next contiguous
    /// index; gaps are the pump's to fill, in batch order, so a group's
    /// channel always carries increasing indices and never a duplicate.
    async fn guarded_push(
        &self,
        group: &str,
        gc: &GroupChannel,
        msg: Arc<Message>,
        index: i64,
        block: Duration,
        allow_gap: bool,
    ) -> PushOutcome {
        let _gate = gc.push_gate.lock().await;
        let last = gc.last_pushed.load(Ordering::SeqCst);
        if index <= last {
            return PushOutcome::Skipped;
        }
        if !allow_gap && index != last + 1 {
            return PushOutcome::Skipped;
        }
        match gc.tx.try_send(msg) {
            Ok(()) => {
                gc.last_pushed.store(index, Ordering::SeqCst);
                PushOutcome::Pushed
            }
            Err(TrySendError::Full(msg)) => {
                if block.is_zero() {
                    return PushOutcome::Full;
                }
                match tokio::time::timeout(block, gc.tx.send(msg)).await {
                    Ok(Ok(())) => {
                        gc.last_pushed.store(index, Ordering::SeqCst);
                        PushOutcome::Pushed
                    }
                    _ => {
                        warn!(
                            "[ChannelQueue:{}/{}] egress full for group '{}', dropped delivery of index {} (will re-pump)",
                            self.domain, self.queue, group, index
                        );
                        PushOutcome::Full
                    }
                }
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}
