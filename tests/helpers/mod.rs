use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use hermod::broker::message::Message;
use hermod::broker::types::{ConsumeOptions, DeliveryMode, QueueConfig};
use hermod::broker::MessageService;
use hermod::config::Config;

// ==========================================
// SETUP HELPERS
// ==========================================

pub fn setup_service() -> Arc<MessageService> {
    Arc::new(MessageService::new(Config::global()))
}

pub fn setup_service_with(mutate: impl FnOnce(&mut Config)) -> Arc<MessageService> {
    let mut config = Config::global().clone();
    mutate(&mut config);
    Arc::new(MessageService::new(&config))
}

/// Domain + one queue with the given config.
pub fn setup_queue(service: &MessageService, domain: &str, queue: &str, config: QueueConfig) {
    service.create_domain(domain, None).unwrap();
    service.create_queue(domain, queue, config).unwrap();
}

pub fn broadcast_config() -> QueueConfig {
    QueueConfig {
        delivery_mode: DeliveryMode::Broadcast,
        is_persistent: true,
        ..QueueConfig::default()
    }
}

pub fn single_consumer_config() -> QueueConfig {
    QueueConfig {
        delivery_mode: DeliveryMode::SingleConsumer,
        ..QueueConfig::default()
    }
}

// ==========================================
// TRAFFIC HELPERS
// ==========================================

pub async fn publish_raw(service: &MessageService, domain: &str, queue: &str, id: &str, payload: &str) -> String {
    service
        .publish(domain, queue, Message::with_id(id, Bytes::from(payload.to_string())))
        .await
        .unwrap()
}

/// Consume with an explicit timeout and fresh cancellation token.
pub async fn consume(
    service: &MessageService,
    domain: &str,
    queue: &str,
    group: &str,
    timeout_ms: u64,
) -> Option<Arc<Message>> {
    let cancel = CancellationToken::new();
    service
        .consume_with_group(
            &cancel,
            domain,
            queue,
            group,
            ConsumeOptions {
                consumer_id: Some(format!("{}-consumer", group)),
                timeout: Some(Duration::from_millis(timeout_ms)),
                ..ConsumeOptions::default()
            },
        )
        .await
        .unwrap()
}
