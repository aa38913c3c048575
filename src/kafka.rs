use crate::config::AppConfig;
use crate::intake::{AckLevel, Depot};
use crate::processor::message_processor;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Feeds intake events from Kafka into the depot, with SASL authentication and
/// a circuit breaker around broker errors.
///
/// Events are appended from the poll loop itself so the per-key order of the
/// topic is the order partitions apply them in.
pub async fn start_kafka_consumer(config: &AppConfig, depot: Depot) -> anyhow::Result<()> {
    info!("Initializing Kafka consumer for topic: {}", config.kafka_topic);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_bootstrap_servers)
        .set("group.id", &config.kafka_group_id)
        .set("auto.offset.reset", &config.kafka_auto_offset_reset)
        // SASL
        .set("security.protocol", &config.kafka_security_protocol)
        .set("sasl.mechanism", &config.kafka_sasl_mechanism)
        .set("sasl.username", &config.kafka_username)
        .set("sasl.password", &config.kafka_password);

    let consumer: StreamConsumer = client_config.create()?;

    consumer.subscribe(&[&config.kafka_topic])?;
    info!("Subscribed to topic: {}", config.kafka_topic);

    let mut consecutive_failures = 0;
    let max_retries = config.kafka_max_retries;
    let cooldown_duration = Duration::from_secs(config.kafka_circuit_breaker_cooldown);

    loop {
        if consecutive_failures >= max_retries {
            warn!(
                "Circuit breaker tripped ({} consecutive failures)! Sleeping for {} seconds...",
                consecutive_failures, config.kafka_circuit_breaker_cooldown
            );
            tokio::time::sleep(cooldown_duration).await;
            consecutive_failures = 0;
            info!("Circuit breaker reset. Resuming consumption.");
        }

        match consumer.recv().await {
            Ok(m) => {
                consecutive_failures = 0;

                let Some(payload) = m.payload() else {
                    warn!("Received empty payload from Kafka");
                    continue;
                };
                let Some(event) = message_processor::decode_event(payload) else {
                    continue;
                };

                debug!(
                    "Kafka offset {} on partition {}: {}",
                    m.offset(),
                    m.partition(),
                    event.kind()
                );
                if depot.append(event, AckLevel::Queued).await.is_err() {
                    warn!("Partitions stopped; Kafka consumer exiting");
                    return Ok(());
                }
            }
            Err(e) => {
                error!(
                    "Kafka error: {}. Incrementing failure count ({} / {})",
                    e,
                    consecutive_failures + 1,
                    max_retries
                );
                consecutive_failures += 1;

                // Avoid a tight loop on short network glitches.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
