use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use uuid::Uuid;

use crate::config::KafkaConfig;

/// Reads a topic one partition at a time from the oldest retained offset,
/// outside of any consumer group.
///
/// Each scanner gets a throwaway `group.id`, which librdkafka needs for
/// `assign()`. Partitions are assigned directly and nothing is committed, so
/// a scan never disturbs the offsets or the membership of the group
/// consumers on the same topic. Create one per scan and drop it when done.
pub struct PartitionScanner {
    consumer: StreamConsumer,
    topic: String,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScannedMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl PartitionScanner {
    /// `timeout` bounds each metadata call.
    pub fn new(
        common_config: &KafkaConfig,
        topic: &str,
        timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", format!("{topic}-backfill-{}", Uuid::new_v4()))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        let consumer: StreamConsumer = client_config.create()?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            timeout,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition ids of the topic, in ascending order.
    pub fn partitions(&self) -> Result<Vec<i32>, KafkaError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), Timeout::After(self.timeout))?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            ))?;
        if let Some(err) = topic.error() {
            return Err(KafkaError::MetadataFetch(err.into()));
        }

        let mut partitions: Vec<i32> = topic.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    /// Replaces the current assignment with `partition`, read from its oldest
    /// retained offset.
    pub fn seek_to_beginning(&self, partition: i32) -> Result<(), KafkaError> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(&self.topic, partition, Offset::Beginning)?;
        self.consumer.assign(&assignment)
    }

    /// Waits for the next message of the assigned partition. Never returns
    /// on a drained partition, callers put their own idle timeout around it.
    pub async fn recv(&self) -> Result<ScannedMessage, KafkaError> {
        let message = self.consumer.recv().await?;
        Ok(ScannedMessage {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProtocol;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;

    fn config(hosts: String) -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: hosts,
            kafka_security_protocol: SecurityProtocol::Plaintext,
            kafka_sasl_mechanism: "PLAIN".to_string(),
            kafka_sasl_username: String::new(),
            kafka_sasl_password: String::new(),
            kafka_request_timeout_ms: 10000,
            kafka_session_timeout_ms: 10000,
        }
    }

    #[tokio::test]
    async fn reads_a_partition_from_the_beginning() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("execution.analytics", 2, 1)
            .expect("failed to create topic");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .create()
            .unwrap();
        for i in 0..3 {
            let payload = format!("message-{i}");
            producer
                .send(
                    FutureRecord::<(), _>::to("execution.analytics")
                        .partition(1)
                        .payload(&payload),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
        }

        let scanner = PartitionScanner::new(
            &config(cluster.bootstrap_servers()),
            "execution.analytics",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(scanner.partitions().unwrap(), vec![0, 1]);

        scanner.seek_to_beginning(1).unwrap();
        for i in 0..3 {
            let message = tokio::time::timeout(Duration::from_secs(10), scanner.recv())
                .await
                .expect("timed out waiting for message")
                .unwrap();
            assert_eq!(message.partition, 1);
            assert_eq!(message.offset, i);
            assert_eq!(message.payload, Some(format!("message-{i}").into_bytes()));
        }
    }
}
