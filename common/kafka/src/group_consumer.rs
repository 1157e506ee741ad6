use std::sync::{Arc, Weak};
use std::time::Duration;

use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Message, Statistics, TopicPartitionList};
use tracing::{error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::session::{SessionEvent, SessionState, SessionTracker};

/// Reports liveness from the statistics callback and turns rebalance
/// callbacks into session transitions.
pub struct SessionContext {
    tracker: SessionTracker,
    liveness: Option<HealthHandle>,
}

impl ClientContext for SessionContext {
    fn stats(&self, _stats: Statistics) {
        // librdkafka's main loop is alive and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "kafka_client", topic = %self.tracker.topic(), "{}: {}", error, reason);
    }
}

impl ConsumerContext for SessionContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if self.tracker.current().is_closing() {
            return;
        }
        match rebalance {
            Rebalance::Assign(_) => {
                if self.tracker.current() == SessionState::Unassigned {
                    self.tracker.apply(SessionEvent::Join);
                }
            }
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!(
                    topic = %self.tracker.topic(),
                    "revoking {} partitions",
                    partitions.count()
                );
                self.tracker.apply(SessionEvent::Rebalance);
            }
            Rebalance::Error(e) => {
                error!(topic = %self.tracker.topic(), "rebalance error: {}", e);
                self.tracker.apply(SessionEvent::Fail);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if self.tracker.current().is_closing() {
            return;
        }
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned = partitions_for(partitions, self.tracker.topic());
                info!(topic = %self.tracker.topic(), partitions = ?assigned, "partitions assigned");
                self.tracker.apply(SessionEvent::Assign(assigned));
            }
            Rebalance::Revoke(partitions) => {
                if partitions.count() > 0 {
                    self.tracker.apply(SessionEvent::Revoke);
                }
            }
            Rebalance::Error(e) => {
                error!(topic = %self.tracker.topic(), "post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(
                topic = %self.tracker.topic(),
                "failed to commit offsets for {} partitions: {}",
                offsets.count(),
                e
            );
        }
    }
}

fn partitions_for(list: &TopicPartitionList, topic: &str) -> Vec<i32> {
    let mut partitions: Vec<i32> = list
        .elements_for_topic(topic)
        .iter()
        .map(|element| element.partition())
        .collect();
    partitions.sort_unstable();
    partitions
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} not found in cluster metadata")]
    UnknownTopic(String),
    #[error("topic {topic} unavailable: {code}")]
    Topic {
        topic: String,
        code: RDKafkaErrorCode,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// A consumer-group member bound to one topic.
///
/// Offsets are stored explicitly through `Offset::store` once a message has
/// been handled, and committed in the background by librdkafka.
#[derive(Clone)]
pub struct GroupConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<SessionContext>,
    topic: String,
    tracker: SessionTracker,
}

/// A message detached from the consumer, along with its offset handle.
pub struct Delivery {
    pub payload: Option<Vec<u8>>,
    pub offset: Offset,
}

impl GroupConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.group_id)
            .set("statistics.interval.ms", "10000")
            .set(
                "session.timeout.ms",
                common_config.kafka_session_timeout_ms.to_string(),
            )
            .set("auto.offset.reset", &consumer_config.offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        let tracker = SessionTracker::new(&consumer_config.topic);
        let context = SessionContext {
            tracker: tracker.clone(),
            liveness,
        };
        let consumer: StreamConsumer<SessionContext> =
            client_config.create_with_context(context)?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.topic.clone(),
                tracker,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn session(&self) -> &SessionTracker {
        &self.inner.tracker
    }

    /// Fetches the topic's metadata. Fails if the brokers cannot be reached
    /// or refuse our credentials, or if the topic does not exist. Returns the
    /// partition count.
    pub fn probe(&self, timeout: Duration) -> Result<usize, ProbeError> {
        let metadata = self
            .inner
            .consumer
            .fetch_metadata(Some(&self.inner.topic), Timeout::After(timeout))?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.inner.topic)
            .ok_or_else(|| ProbeError::UnknownTopic(self.inner.topic.clone()))?;

        if let Some(err) = topic.error() {
            return Err(ProbeError::Topic {
                topic: self.inner.topic.clone(),
                code: RDKafkaErrorCode::from(err),
            });
        }

        Ok(topic.partitions().len())
    }

    pub fn subscribe(&self) -> Result<(), KafkaError> {
        self.inner.tracker.apply(SessionEvent::Join);
        self.inner.consumer.subscribe(&[self.inner.topic.as_str()])
    }

    pub async fn recv(&self) -> Result<Delivery, KafkaError> {
        let message = self.inner.consumer.recv().await?;

        let delivery = Delivery {
            payload: message.payload().map(<[u8]>::to_vec),
            offset: Offset {
                handle: Arc::downgrade(&self.inner),
                partition: message.partition(),
                offset: message.offset(),
            },
        };
        self.inner.tracker.mark_consuming();
        Ok(delivery)
    }

    /// Marks the current session as failed.
    pub fn fail(&self) {
        self.inner.tracker.apply(SessionEvent::Fail);
    }

    /// Starts a new session after a failure. librdkafka keeps the group
    /// membership alive on its own, so an assignment that survived the
    /// failure is picked straight back up.
    pub fn rejoin(&self) {
        self.inner.tracker.apply(SessionEvent::Join);
        match self.inner.consumer.assignment() {
            Ok(assignment) => {
                let partitions = partitions_for(&assignment, &self.inner.topic);
                if !partitions.is_empty() {
                    self.inner.tracker.apply(SessionEvent::Assign(partitions));
                }
            }
            Err(e) => warn!(topic = %self.inner.topic, "failed to read assignment: {}", e),
        }
    }

    /// Leaves the group. Stored offsets are committed on the way out.
    pub fn close(&self) {
        self.inner.tracker.apply(SessionEvent::Close);
        self.inner.consumer.unsubscribe();
        self.inner.tracker.apply(SessionEvent::Finish);
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}
