//! Kafka delivery of bucket notification batches.
//!
//! One message is one batch. Offsets are committed manually: a batch that
//! failed to persist is never committed past. Its partition is rewound to
//! the message after a backoff so the batch is delivered again.

use crate::config::KafkaConfig;
use crate::pipeline::{BatchError, EnrichmentPipeline};
use anyhow::{Context, Result};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
#[cfg(test)]
use mockall::automock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with a message's offset after processing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Processed, or not processable at all; move past it
    Commit,
    /// Deliver the message again
    Retain,
}

/// Map a batch result to an offset decision. Rejected input will never
/// succeed on redelivery, persistence failures might.
pub fn commit_decision<T>(result: &Result<T, BatchError>) -> CommitDecision {
    match result {
        Ok(_) | Err(BatchError::InvalidInput(_)) => CommitDecision::Commit,
        Err(BatchError::Persistence { .. }) => CommitDecision::Retain,
    }
}

/// Where a consumed message sits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessagePosition {
    fn of(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }
}

/// Offset operations the consume loop needs from the client
#[cfg_attr(test, automock)]
pub trait OffsetControl: Send + Sync {
    /// Commit past the message
    fn commit_position(&self, position: &MessagePosition) -> KafkaResult<()>;

    /// Seek the partition back so the message is fetched again
    fn rewind_to(&self, position: &MessagePosition) -> KafkaResult<()>;
}

impl OffsetControl for StreamConsumer {
    fn commit_position(&self, position: &MessagePosition) -> KafkaResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        Consumer::commit(self, &offsets, CommitMode::Async)
    }

    fn rewind_to(&self, position: &MessagePosition) -> KafkaResult<()> {
        Consumer::seek(
            self,
            &position.topic,
            position.partition,
            Offset::Offset(position.offset),
            SEEK_TIMEOUT,
        )
    }
}

/// Apply a commit decision for one message. Returns `false` when shutdown
/// interrupted the redelivery backoff; the offset then stays uncommitted.
///
/// A retained message must be rewound rather than just left uncommitted,
/// otherwise the commit of the next message on the partition moves past it.
pub async fn settle(
    control: &dyn OffsetControl,
    decision: CommitDecision,
    position: &MessagePosition,
    redelivery: &mut ExponentialBackoff,
    shutdown: &CancellationToken,
) -> Result<bool> {
    match decision {
        CommitDecision::Commit => {
            redelivery.reset();
            if let Err(e) = control.commit_position(position) {
                warn!(error = %e, "Failed to commit offset");
            }
            Ok(true)
        }
        CommitDecision::Retain => {
            let delay = redelivery
                .next_backoff()
                .unwrap_or(redelivery.max_interval);

            warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                delay_ms = delay.as_millis(),
                "Redelivering notification batch"
            );
            metrics::counter!("enrichment.messages.redelivered").increment(1);

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }

            control
                .rewind_to(position)
                .context("Failed to rewind partition for redelivery")?;
            Ok(true)
        }
    }
}

/// Kafka consumer for bucket notifications
pub struct NotificationKafkaConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<EnrichmentPipeline>,
    redelivery: ExponentialBackoff,
}

impl NotificationKafkaConsumer {
    /// Create a new Kafka consumer for bucket notifications
    pub fn new(config: &KafkaConfig, pipeline: Arc<EnrichmentPipeline>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.notification_topic])
            .context("Failed to subscribe to notification topic")?;

        info!(
            topic = %config.notification_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            pipeline,
            redelivery: config.redelivery_backoff(),
        })
    }

    /// Consume notification batches until the token is cancelled.
    /// Fails when a retained batch cannot be rewound.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting notification Kafka consumer");

        let mut message_stream = self.consumer.stream();
        let mut redelivery = self.redelivery.clone();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => match next {
                    Some(message_result) => message_result,
                    None => break,
                },
            };

            let message = match message_result {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("enrichment.kafka.errors").increment(1);
                    continue;
                }
            };

            let decision = self.handle_message(&message).await;
            let position = MessagePosition::of(&message);

            if !settle(&self.consumer, decision, &position, &mut redelivery, &shutdown).await? {
                break;
            }
        }

        info!("Notification Kafka consumer stopped");
        Ok(())
    }

    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn handle_message(&self, message: &BorrowedMessage<'_>) -> CommitDecision {
        let payload = match message.payload() {
            Some(payload) => payload,
            None => {
                warn!("Message has no payload");
                metrics::counter!("enrichment.messages.empty").increment(1);
                return CommitDecision::Commit;
            }
        };

        let result = self.pipeline.process_payload(payload).await;

        match &result {
            Ok(report) => {
                debug!(
                    processed = report.processed,
                    persisted = report.persisted,
                    "Notification batch handled"
                );
                metrics::counter!("enrichment.messages.processed").increment(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to process notification batch");
                metrics::counter!("enrichment.messages.failed").increment(1);
            }
        }

        commit_decision(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::DecodeError;
    use crate::pipeline::BatchReport;
    use crate::record_store::StoreError;
    use rdkafka::error::KafkaError;

    fn position(offset: i64) -> MessagePosition {
        MessagePosition {
            topic: "images.bucket-notifications".to_string(),
            partition: 3,
            offset,
        }
    }

    fn redelivery() -> ExponentialBackoff {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "enrichment-service".to_string(),
            notification_topic: "images.bucket-notifications".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            redelivery_backoff_initial_ms: 1000,
            redelivery_backoff_max_ms: 60000,
        }
        .redelivery_backoff()
    }

    fn persistence_failure() -> Result<BatchReport, BatchError> {
        Err(BatchError::Persistence {
            failed: 1,
            source: StoreError::Unavailable("down".to_string()),
        })
    }

    #[test]
    fn test_successful_batch_is_committed() {
        let result: Result<BatchReport, BatchError> = Ok(BatchReport::default());
        assert_eq!(commit_decision(&result), CommitDecision::Commit);
    }

    #[test]
    fn test_rejected_batch_is_committed() {
        let result: Result<BatchReport, BatchError> =
            Err(BatchError::InvalidInput(DecodeError::EmptyBatch));
        assert_eq!(commit_decision(&result), CommitDecision::Commit);
    }

    #[test]
    fn test_persistence_failure_is_retained() {
        assert_eq!(
            commit_decision(&persistence_failure()),
            CommitDecision::Retain
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_moves_past_message() {
        let mut control = MockOffsetControl::new();
        control
            .expect_commit_position()
            .withf(|p| *p == position(41))
            .times(1)
            .returning(|_| Ok(()));
        control.expect_rewind_to().never();

        let keep_running = settle(
            &control,
            CommitDecision::Commit,
            &position(41),
            &mut redelivery(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(keep_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_rewound_not_committed() {
        let mut control = MockOffsetControl::new();
        control.expect_commit_position().never();
        control
            .expect_rewind_to()
            .withf(|p| *p == position(41))
            .times(1)
            .returning(|_| Ok(()));

        let started = tokio::time::Instant::now();
        let decision = commit_decision(&persistence_failure());
        let keep_running = settle(
            &control,
            decision,
            &position(41),
            &mut redelivery(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(keep_running);
        // first delay is 1s with default jitter of 50%
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_then_success_commits_same_offset() {
        let mut control = MockOffsetControl::new();
        let mut seq = mockall::Sequence::new();
        control
            .expect_rewind_to()
            .withf(|p| p.offset == 41)
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        control
            .expect_commit_position()
            .withf(|p| p.offset == 41)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut backoff = redelivery();
        let shutdown = CancellationToken::new();
        for decision in [
            CommitDecision::Retain,
            CommitDecision::Retain,
            CommitDecision::Commit,
        ] {
            assert!(settle(&control, decision, &position(41), &mut backoff, &shutdown)
                .await
                .unwrap());
        }
        assert_eq!(backoff.current_interval, backoff.initial_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewind_failure_stops_consumer() {
        let mut control = MockOffsetControl::new();
        control
            .expect_rewind_to()
            .returning(|_| Err(KafkaError::Seek("partition not assigned".to_string())));

        let result = settle(
            &control,
            CommitDecision::Retain,
            &position(7),
            &mut redelivery(),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_leaves_offset_uncommitted() {
        let mut control = MockOffsetControl::new();
        control.expect_commit_position().never();
        control.expect_rewind_to().never();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let keep_running = settle(
            &control,
            CommitDecision::Retain,
            &position(7),
            &mut redelivery(),
            &shutdown,
        )
        .await
        .unwrap();
        assert!(!keep_running);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_consuming() {
        let mut control = MockOffsetControl::new();
        control
            .expect_commit_position()
            .returning(|_| Err(KafkaError::Seek("coordinator unavailable".to_string())));

        let keep_running = settle(
            &control,
            CommitDecision::Commit,
            &position(7),
            &mut redelivery(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(keep_running);
    }
}
