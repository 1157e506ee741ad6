//! The ingestion engine. Both the streaming consumer and the backfill scan
//! hand every message to a `TopicIngester`, so validation and idempotency
//! behave the same on either path.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::DomainError;
use crate::events::TopicEvent;
use crate::metrics_consts::{
    MESSAGE_HANDLING_DURATION, RECORDS_DUPLICATE, RECORDS_INSERTED, RECORDS_REJECTED,
    RECORDS_STORE_FAILED,
};
use crate::store::{RecordStore, StoreError, Upsert};

pub mod backfill;
pub mod streaming;

pub use backfill::{
    Backfill, BackfillError, BackfillReport, BackfillTrigger, PartitionSource, SourceFactory,
};
pub use streaming::{BackoffPolicy, StreamingConsumer};

/// Why a single message was not stored.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message has no payload")]
    Empty,
    #[error("failed to decode payload: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    fn reason(&self) -> &'static str {
        match self {
            IngestError::Empty => "empty",
            IngestError::Deserialize(_) => "deserialize",
            IngestError::Invalid(_) => "invalid",
            IngestError::Store(_) => "store",
        }
    }
}

/// Decodes, validates and stores the messages of one topic.
pub struct TopicIngester<E: TopicEvent> {
    topic: Arc<str>,
    store: Arc<dyn RecordStore<E::Record>>,
    _event: PhantomData<fn() -> E>,
}

impl<E: TopicEvent> Clone for TopicIngester<E> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            store: self.store.clone(),
            _event: PhantomData,
        }
    }
}

impl<E: TopicEvent> TopicIngester<E> {
    pub fn new(topic: &str, store: Arc<dyn RecordStore<E::Record>>) -> Self {
        Self {
            topic: Arc::from(topic),
            store,
            _event: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Handles one message. Failures are logged here with the message
    /// coordinates, callers only decide whether to acknowledge.
    pub async fn handle(
        &self,
        payload: Option<&[u8]>,
        partition: i32,
        offset: i64,
    ) -> Result<Upsert, IngestError> {
        let start = Instant::now();
        let result = self.process(payload).await;
        metrics::histogram!(MESSAGE_HANDLING_DURATION, "topic" => self.topic.to_string())
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(Upsert::Inserted) => {
                metrics::counter!(RECORDS_INSERTED, "topic" => self.topic.to_string()).increment(1);
                debug!(topic = %self.topic, partition, offset, kind = E::KIND, "stored new record");
            }
            Ok(Upsert::Duplicate) => {
                metrics::counter!(RECORDS_DUPLICATE, "topic" => self.topic.to_string()).increment(1);
                debug!(topic = %self.topic, partition, offset, kind = E::KIND, "record already stored");
            }
            Err(IngestError::Store(e)) => {
                metrics::counter!(RECORDS_STORE_FAILED, "topic" => self.topic.to_string())
                    .increment(1);
                warn!(topic = %self.topic, partition, offset, kind = E::KIND, "failed to store record: {}", e);
            }
            Err(e) => {
                metrics::counter!(
                    RECORDS_REJECTED,
                    "topic" => self.topic.to_string(),
                    "reason" => e.reason()
                )
                .increment(1);
                warn!(topic = %self.topic, partition, offset, kind = E::KIND, "skipping message: {}", e);
            }
        }

        result
    }

    async fn process(&self, payload: Option<&[u8]>) -> Result<Upsert, IngestError> {
        let payload = payload.filter(|p| !p.is_empty()).ok_or(IngestError::Empty)?;
        let event: E = serde_json::from_slice(payload)?;
        let record = event.into_record()?;
        Ok(self.store.upsert_if_absent(&record).await?)
    }
}
