use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{KafkaConfig, PartitionScanner, ScannedMessage};
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TopicIngester;
use crate::events::TopicEvent;
use crate::metrics_consts::{BACKFILL_INSERTED, BACKFILL_PARTITION_ERRORS, BACKFILL_RUNS};
use crate::store::Upsert;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("failed to create partition reader: {0}")]
    Source(#[source] KafkaError),
    #[error("failed to list partitions of {topic}: {error}")]
    Partitions { topic: String, error: KafkaError },
    #[error("none of the {partitions} partitions of {topic} could be opened")]
    NoReadablePartitions { topic: String, partitions: usize },
    #[error("blocking broker call panicked: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Reads the partitions of one topic, one at a time.
#[async_trait]
pub trait PartitionSource: Send {
    /// Partition ids, in scan order.
    fn partitions(&mut self) -> Result<Vec<i32>, KafkaError>;

    /// Moves the cursor to the oldest retained message of `partition`.
    fn open(&mut self, partition: i32) -> Result<(), KafkaError>;

    /// Waits for the next message. May wait forever on a drained partition.
    async fn next_message(&mut self) -> Result<ScannedMessage, KafkaError>;
}

#[async_trait]
impl PartitionSource for PartitionScanner {
    fn partitions(&mut self) -> Result<Vec<i32>, KafkaError> {
        PartitionScanner::partitions(self)
    }

    fn open(&mut self, partition: i32) -> Result<(), KafkaError> {
        self.seek_to_beginning(partition)
    }

    async fn next_message(&mut self) -> Result<ScannedMessage, KafkaError> {
        self.recv().await
    }
}

/// Builds a fresh source for every scan.
pub trait SourceFactory: Send + Sync + 'static {
    type Source: PartitionSource + 'static;

    fn create(&self) -> Result<Self::Source, KafkaError>;
}

/// Creates group-less `PartitionScanner`s for one topic.
#[derive(Clone)]
pub struct ScannerFactory {
    config: KafkaConfig,
    topic: String,
    metadata_timeout: Duration,
}

impl ScannerFactory {
    pub fn new(config: KafkaConfig, topic: &str, metadata_timeout: Duration) -> Self {
        Self {
            config,
            topic: topic.to_string(),
            metadata_timeout,
        }
    }
}

impl SourceFactory for ScannerFactory {
    type Source = PartitionScanner;

    fn create(&self) -> Result<PartitionScanner, KafkaError> {
        PartitionScanner::new(&self.config, &self.topic, self.metadata_timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Records stored for the first time by this scan
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Partitions that were opened and read
    pub partitions: usize,
    pub cancelled: bool,
}

/// Something that can run a backfill scan on demand.
#[async_trait]
pub trait BackfillTrigger: Send + Sync {
    async fn trigger(&self) -> Result<BackfillReport, BackfillError>;
}

/// Recovers records the streaming consumer missed by reading a whole topic
/// from its oldest retained offsets.
///
/// Partitions are read sequentially. A partition counts as drained once no
/// message arrives for `idle_timeout`, so a broker that stalls for longer
/// than that ends the partition early. Re-running a scan is always safe,
/// already stored records come back as duplicates.
pub struct Backfill<E: TopicEvent, F> {
    ingester: TopicIngester<E>,
    factory: F,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<E: TopicEvent, F: SourceFactory> Backfill<E, F> {
    pub fn new(
        ingester: TopicIngester<E>,
        factory: F,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ingester,
            factory,
            idle_timeout,
            shutdown,
        }
    }

    pub async fn scan(&self, cancel: &CancellationToken) -> Result<BackfillReport, BackfillError> {
        let topic = self.ingester.topic();
        let source = self.factory.create().map_err(BackfillError::Source)?;
        let (mut source, partitions) = off_runtime(source, |source| source.partitions()).await?;
        let partitions = partitions.map_err(|error| BackfillError::Partitions {
            topic: topic.to_string(),
            error,
        })?;

        info!(topic, partitions = partitions.len(), "starting backfill scan");
        let listed = partitions.len();
        let mut report = BackfillReport::default();

        'partitions: for partition in partitions {
            let (returned, opened) =
                off_runtime(source, move |source| source.open(partition)).await?;
            source = returned;
            if let Err(e) = opened {
                metrics::counter!(BACKFILL_PARTITION_ERRORS, "topic" => topic.to_string())
                    .increment(1);
                warn!(topic, partition, "failed to open partition, skipping: {}", e);
                continue;
            }
            report.partitions += 1;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break 'partitions;
                    }
                    next = tokio::time::timeout(self.idle_timeout, source.next_message()) => next,
                };

                let message = match next {
                    Err(_) => {
                        debug!(topic, partition, "partition idle, moving on");
                        break;
                    }
                    Ok(Err(e)) => {
                        metrics::counter!(BACKFILL_PARTITION_ERRORS, "topic" => topic.to_string())
                            .increment(1);
                        warn!(topic, partition, "error reading partition, skipping rest: {}", e);
                        break;
                    }
                    Ok(Ok(message)) => message,
                };

                if message.partition != partition {
                    continue;
                }

                match self
                    .ingester
                    .handle(message.payload.as_deref(), message.partition, message.offset)
                    .await
                {
                    Ok(Upsert::Inserted) => report.inserted += 1,
                    Ok(Upsert::Duplicate) => report.duplicates += 1,
                    Err(_) => report.rejected += 1,
                }
            }
        }

        info!(
            topic,
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            cancelled = report.cancelled,
            "backfill scan finished"
        );

        if listed > 0 && report.partitions == 0 && !report.cancelled {
            return Err(BackfillError::NoReadablePartitions {
                topic: topic.to_string(),
                partitions: listed,
            });
        }
        Ok(report)
    }
}

/// Runs a broker call that may block (metadata fetch, assignment) on the
/// blocking pool, handing the source back afterwards.
async fn off_runtime<S, T, Op>(mut source: S, op: Op) -> Result<(S, T), BackfillError>
where
    S: PartitionSource + 'static,
    T: Send + 'static,
    Op: FnOnce(&mut S) -> T + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(move || {
        let value = op(&mut source);
        (source, value)
    });
    Ok(handle.await?)
}

#[async_trait]
impl<E: TopicEvent, F: SourceFactory> BackfillTrigger for Backfill<E, F> {
    async fn trigger(&self) -> Result<BackfillReport, BackfillError> {
        metrics::counter!(BACKFILL_RUNS, "topic" => self.ingester.topic().to_string()).increment(1);
        let report = self.scan(&self.shutdown).await?;
        metrics::counter!(BACKFILL_INSERTED, "topic" => self.ingester.topic().to_string())
            .increment(report.inserted);
        Ok(report)
    }
}
