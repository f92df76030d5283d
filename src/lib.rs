pub mod broker;
pub mod config;
pub mod error;
pub mod utils;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::snapshot::EngineSnapshot;
use crate::broker::MessageService;
use crate::config::Config;

// ========================================
// ENGINE (The Singleton)
// ========================================

#[derive(Clone)]
pub struct HermodEngine {
    pub service: Arc<MessageService>,
    pub start_time: Instant,
}

impl HermodEngine {
    pub fn new(config: &Config) -> Self {
        let service = Arc::new(MessageService::new(config));

        // Stale-group sweeper: every tick, drop groups idle past the
        // threshold (or past their own TTL) and settle their ack columns.
        {
            let service = service.clone();
            let cancel = service.shutdown_token().child_token();
            let tick = Duration::from_secs(config.sweeper.stale_group_sweep_secs);
            let threshold = config.sweeper.stale_group_ttl();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let removed = service.sweep_stale_groups(threshold);
                            if removed > 0 {
                                info!("[Engine] stale-group sweep removed {} groups", removed);
                            }
                        }
                    }
                }
            });
        }

        // Orphan-queue sweeper: owns its own observation map; queues with
        // zero groups past the threshold get bulk-deleted and index-wiped.
        {
            let service = service.clone();
            let cancel = service.shutdown_token().child_token();
            let tick = Duration::from_secs(config.sweeper.orphan_sweep_secs);
            let threshold = config.sweeper.orphan_threshold();
            tokio::spawn(async move {
                let mut observed: HashMap<(String, String), Instant> = HashMap::new();
                let mut interval = tokio::time::interval(tick);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let purged = service.sweep_orphan_queues(threshold, &mut observed);
                            if purged > 0 {
                                info!("[Engine] orphan-queue sweep purged {} queues", purged);
                            }
                        }
                    }
                }
            });
        }

        // Metrics tick: a one-line summary for the monitoring layer's logs.
        {
            let service = service.clone();
            let cancel = service.shutdown_token().child_token();
            let tick = Duration::from_secs(config.engine.metrics_tick_secs);
            let start_time = Instant::now();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let snapshot = service.snapshot(start_time.elapsed());
                            let queues: usize = snapshot.domains.iter().map(|d| d.queues.len()).sum();
                            let messages: usize = snapshot
                                .domains
                                .iter()
                                .flat_map(|d| d.queues.iter())
                                .map(|q| q.message_count)
                                .sum();
                            info!(
                                "[Engine] {} domains, {} queues, {} live messages",
                                snapshot.domains.len(), queues, messages
                            );
                        }
                    }
                }
            });
        }

        Self {
            service,
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.service.snapshot(self.start_time.elapsed())
    }

    /// Cancel the root token and drain every queue runtime, each bounded by
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) {
        info!("[Engine] shutting down");
        self.service.stop_all_queues().await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.service.shutdown_token().clone()
    }
}
