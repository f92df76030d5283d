use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use hermod::broker::message::Message;
use hermod::broker::schema::{FieldType, Schema};
use hermod::broker::types::{ConsumeOptions, QueueConfig};
use hermod::error::BrokerError;

mod helpers;
use helpers::*;

#[cfg(test)]
mod publish_consume_tests {
    use super::*;

    // =========================================================================================
    // 1. FEATURE TESTS (Happy Path + Core Semantics)
    // =========================================================================================

    mod features {
        use super::*;

        #[tokio::test]
        async fn test_single_group_at_least_once() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            for payload in ["1", "2", "3"] {
                publish_raw(&service, "d", "q", &format!("m{}", payload), payload).await;
            }
            service.create_consumer_group("d", "q", "g", None).unwrap();

            // delivery is in index order, then exhaustion
            for expected in ["1", "2", "3"] {
                let msg = consume(&service, "d", "q", "g", 100).await.expect("message due");
                assert_eq!(msg.payload, Bytes::from(expected.to_string()));
            }
            assert!(consume(&service, "d", "q", "g", 100).await.is_none());

            // everything the group owed has been acked away
            assert!(service.pending_messages("d", "q", "g").unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_publish_assigns_id_and_enriches_metadata() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            let id = service
                .publish("d", "q", Message::new(Bytes::from("payload")))
                .await
                .unwrap();
            assert!(!id.is_empty(), "server must assign an id");

            service.create_consumer_group("d", "q", "g", None).unwrap();
            let msg = consume(&service, "d", "q", "g", 200).await.unwrap();
            assert_eq!(msg.id, id);
            assert_eq!(msg.metadata["domain"].as_str(), Some("d"));
            assert_eq!(msg.metadata["queue"].as_str(), Some("q"));
            assert!(msg.timestamp > 0, "timestamp is stamped at publish");
        }

        #[tokio::test]
        async fn test_duplicate_message_id_is_rejected() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            publish_raw(&service, "d", "q", "dup", "first").await;
            let second = service
                .publish("d", "q", Message::with_id("dup", Bytes::from("second")))
                .await;
            assert!(matches!(second, Err(BrokerError::MessageAlreadyExists(_))));
        }

        #[tokio::test]
        async fn test_two_groups_broadcast_independent_progress() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            for i in 1..=3 {
                publish_raw(&service, "d", "q", &format!("m{}", i), &format!("payload-{}", i)).await;
            }
            service.create_consumer_group("d", "q", "gA", None).unwrap();
            service.create_consumer_group("d", "q", "gB", None).unwrap();

            // gA drains the queue; gB has consumed nothing, so nothing is deleted
            for _ in 0..3 {
                assert!(consume(&service, "d", "q", "gA", 200).await.is_some());
            }
            assert_eq!(service.repository().message_count("d", "q"), 3);
            assert_eq!(service.pending_messages("d", "q", "gB").unwrap().len(), 3);

            // gB consumes the first message: now fully acked, now deleted
            let first = consume(&service, "d", "q", "gB", 200).await.unwrap();
            assert_eq!(first.id, "m1");
            assert_eq!(service.repository().message_count("d", "q"), 2);
            assert!(service.repository().get_message("d", "q", "m1").is_none());
        }

        #[tokio::test]
        async fn test_subscription_fanout_on_publish() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            let seen = Arc::new(AtomicUsize::new(0));
            let counter = seen.clone();
            let sub_id = service
                .subscribe("d", "q", Arc::new(move |msg| {
                    assert_eq!(msg.metadata["queue"].as_str(), Some("q"));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
            // a failing handler must not fail the publish
            service
                .subscribe("d", "q", Arc::new(|_| Err("observer crashed".to_string())))
                .unwrap();

            publish_raw(&service, "d", "q", "m1", "x").await;
            assert_eq!(seen.load(Ordering::SeqCst), 1);

            assert!(service.unsubscribe(&sub_id));
            publish_raw(&service, "d", "q", "m2", "y").await;
            assert_eq!(seen.load(Ordering::SeqCst), 1, "unsubscribed handler stays silent");
        }

        #[tokio::test]
        async fn test_schema_rejects_invalid_payload() {
            let service = setup_service();
            let mut fields = HashMap::new();
            fields.insert("amount".to_string(), FieldType::Number);
            service.create_domain("d", Some(Schema::fields(fields))).unwrap();
            service.create_queue("d", "q", broadcast_config()).unwrap();

            let bad = service
                .publish("d", "q", Message::new(Bytes::from(r#"{"amount":"not a number"}"#)))
                .await;
            assert!(matches!(bad, Err(BrokerError::InvalidMessage(_))));
            // an invalid publish leaves the queue unchanged
            assert_eq!(service.repository().message_count("d", "q"), 0);

            service
                .publish("d", "q", Message::new(Bytes::from(r#"{"amount":7}"#)))
                .await
                .unwrap();
            assert_eq!(service.repository().message_count("d", "q"), 1);
        }
    }

    // =========================================================================================
    // 2. DELIVERY MODES
    // =========================================================================================

    mod delivery_modes {
        use super::*;

        #[tokio::test]
        async fn test_single_consumer_deletes_on_consume() {
            let service = setup_service();
            setup_queue(&service, "d", "q", single_consumer_config());

            publish_raw(&service, "d", "q", "m1", "one").await;
            publish_raw(&service, "d", "q", "m2", "two").await;
            service.create_consumer_group("d", "q", "gX", None).unwrap();

            let msg = consume(&service, "d", "q", "gX", 200).await.unwrap();
            assert_eq!(msg.id, "m1");
            // deleted immediately, regardless of ack state
            assert!(service.repository().get_message("d", "q", "m1").is_none());
            assert_eq!(service.repository().message_count("d", "q"), 1);
        }

        #[tokio::test]
        async fn test_single_consumer_second_group_is_rejected() {
            let service = setup_service();
            setup_queue(&service, "d", "q", single_consumer_config());

            service.create_consumer_group("d", "q", "gX", None).unwrap();
            let bound = service.create_consumer_group("d", "q", "gY", None);
            assert!(matches!(bound, Err(BrokerError::AlreadyBound(_))));
        }

        #[tokio::test]
        async fn test_non_persistent_queue_deletes_on_consume() {
            let service = setup_service();
            let config = QueueConfig { is_persistent: false, ..broadcast_config() };
            setup_queue(&service, "d", "q", config);

            publish_raw(&service, "d", "q", "m1", "one").await;
            // a second group that never reads; non-persistent ignores it
            service.create_consumer_group("d", "q", "idle", None).unwrap();
            service.create_consumer_group("d", "q", "g", None).unwrap();

            let msg = consume(&service, "d", "q", "g", 200).await.unwrap();
            assert_eq!(msg.id, "m1");
            assert!(service.repository().get_message("d", "q", "m1").is_none());
        }

        #[tokio::test]
        async fn test_round_robin_spreads_messages_across_groups() {
            let service = setup_service();
            let config = QueueConfig {
                delivery_mode: hermod::broker::types::DeliveryMode::RoundRobin,
                ..QueueConfig::default()
            };
            setup_queue(&service, "d", "q", config);

            service.create_consumer_group("d", "q", "gA", None).unwrap();
            service.create_consumer_group("d", "q", "gB", None).unwrap();

            for i in 0..4 {
                publish_raw(&service, "d", "q", &format!("m{}", i), "x").await;
            }
            // let the dispatcher drain the ingress
            tokio::time::sleep(Duration::from_millis(100)).await;

            let mut ids_a = Vec::new();
            let mut ids_b = Vec::new();
            for _ in 0..2 {
                ids_a.push(consume(&service, "d", "q", "gA", 200).await.unwrap().id.clone());
                ids_b.push(consume(&service, "d", "q", "gB", 200).await.unwrap().id.clone());
            }
            for id in &ids_a {
                assert!(!ids_b.contains(id), "push-path delivery must not overlap");
            }
            let mut all: Vec<String> = ids_a.into_iter().chain(ids_b).collect();
            all.sort();
            assert_eq!(all, vec!["m0", "m1", "m2", "m3"]);
        }

        #[tokio::test]
        async fn test_broadcast_backpressure_drops_then_repumps() {
            let service = setup_service();
            let config = QueueConfig { max_size: 2, ..broadcast_config() };
            setup_queue(&service, "d", "q", config);
            service.create_consumer_group("d", "q", "g", None).unwrap();

            // 2 fill the egress channel; the third delivery is dropped after
            // the bounded block, but stays in the repository
            for i in 0..3 {
                publish_raw(&service, "d", "q", &format!("m{}", i), "x").await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            // the consumer still sees all three: the miss triggers a re-pump
            for expected in ["m0", "m1", "m2"] {
                let msg = consume(&service, "d", "q", "g", 300).await.expect("redelivered");
                assert_eq!(msg.id, expected);
            }
        }
    }

    // =========================================================================================
    // 3. BOUNDARIES & ERROR HANDLING
    // =========================================================================================

    mod error_handling {
        use super::*;

        #[tokio::test]
        async fn test_publish_to_missing_domain_or_queue() {
            let service = setup_service();
            let msg = || Message::new(Bytes::from("x"));

            let no_domain = service.publish("ghost", "q", msg()).await;
            assert!(matches!(no_domain, Err(BrokerError::DomainNotFound(_))));

            service.create_domain("d", None).unwrap();
            let no_queue = service.publish("d", "ghost", msg()).await;
            assert!(matches!(no_queue, Err(BrokerError::QueueNotFound(_, _))));
        }

        #[tokio::test]
        async fn test_consume_from_missing_queue() {
            let service = setup_service();
            let cancel = CancellationToken::new();
            let result = service
                .consume_with_group(&cancel, "d", "q", "g", ConsumeOptions::default())
                .await;
            assert!(matches!(result, Err(BrokerError::QueueNotFound(_, _))));
        }

        #[tokio::test]
        async fn test_consume_timeout_is_none_not_error() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());
            assert!(consume(&service, "d", "q", "g", 50).await.is_none());
        }

        #[tokio::test]
        async fn test_zero_timeout_returns_immediately() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            let started = std::time::Instant::now();
            let result = consume(&service, "d", "q", "g", 0).await;
            assert!(result.is_none());
            assert!(started.elapsed() < Duration::from_millis(250), "zero timeout must not block");
        }

        #[tokio::test]
        async fn test_cancelled_consume_returns_cancelled() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());

            let cancel = CancellationToken::new();
            cancel.cancel();
            let result = service
                .consume_with_group(
                    &cancel,
                    "d",
                    "q",
                    "g",
                    ConsumeOptions { timeout: Some(Duration::from_secs(5)), ..ConsumeOptions::default() },
                )
                .await;
            assert!(matches!(result, Err(BrokerError::Cancelled)));
        }

        #[tokio::test]
        async fn test_max_size_zero_uses_default_buffer() {
            let service = setup_service();
            setup_queue(&service, "d", "q", QueueConfig { max_size: 0, ..QueueConfig::default() });
            let config = service.queue_config("d", "q").unwrap();
            assert_eq!(config.max_size, 100);
            assert_eq!(config.worker_count, 2);
        }
    }

    // =========================================================================================
    // 4. LIFECYCLE
    // =========================================================================================

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_delete_queue_then_publish_fails() {
            let service = setup_service();
            setup_queue(&service, "d", "q", broadcast_config());
            publish_raw(&service, "d", "q", "m1", "x").await;

            service.delete_queue("d", "q").await.unwrap();
            assert!(service.list_queues("d").unwrap().is_empty());
            let gone = service.publish("d", "q", Message::new(Bytes::from("y"))).await;
            assert!(matches!(gone, Err(BrokerError::QueueNotFound(_, _))));
        }

        #[tokio::test]
        async fn test_engine_snapshot_and_shutdown() {
            let engine = hermod::HermodEngine::new(hermod::config::Config::global());
            engine.service.create_domain("d", None).unwrap();
            engine.service.create_queue("d", "q", broadcast_config()).unwrap();
            publish_raw(&engine.service, "d", "q", "m1", "x").await;
            engine.service.create_consumer_group("d", "q", "g", None).unwrap();

            let snapshot = engine.snapshot();
            assert_eq!(snapshot.domains.len(), 1);
            assert_eq!(snapshot.domains[0].queues.len(), 1);
            let queue = &snapshot.domains[0].queues[0];
            assert_eq!(queue.message_count, 1);
            assert_eq!(queue.groups.len(), 1);
            assert_eq!(queue.groups[0].pending, 1);
            // the monitoring layer gets it over the wire as JSON
            assert!(serde_json::to_string(&snapshot).unwrap().contains("\"broadcast\""));

            engine.shutdown().await;
            assert!(engine.shutdown_token().is_cancelled());
        }

        #[tokio::test]
        async fn test_delete_domain_stops_all_queues() {
            let service = setup_service();
            service.create_domain("d", None).unwrap();
            for q in ["q1", "q2", "q3"] {
                service.create_queue("d", q, broadcast_config()).unwrap();
                publish_raw(&service, "d", q, "m1", "x").await;
            }

            service.delete_domain("d").await.unwrap();
            assert!(service.list_domains().is_empty());
            let gone = service.publish("d", "q1", Message::new(Bytes::from("y"))).await;
            assert!(matches!(gone, Err(BrokerError::DomainNotFound(_))));
        }

        #[tokio::test]
        async fn test_delete_missing_domain() {
            let service = setup_service();
            assert!(matches!(
                service.delete_domain("ghost").await,
                Err(BrokerError::DomainNotFound(_))
            ));
        }
    }
}
