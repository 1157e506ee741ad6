use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use analytics_ingest::domain::{ExecutionId, ExecutionRecord, RegistrationRecord};
use analytics_ingest::events::{ExecutionEvent, RegistrationEvent};
use analytics_ingest::ingest::{
    Backfill, BackfillTrigger, IngestError, PartitionSource, SourceFactory, TopicIngester,
};
use analytics_ingest::store::{ExecutionQueries, MemoryStore, RecordStore, Upsert};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use common_kafka::ScannedMessage;
use rdkafka::error::KafkaError;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TOPIC: &str = "execution.analytics";

/// A single-partition topic whose retained log never changes.
#[derive(Clone)]
struct RetainedLog {
    messages: Vec<ScannedMessage>,
}

struct LogReader {
    pending: VecDeque<ScannedMessage>,
    log: Vec<ScannedMessage>,
}

#[async_trait]
impl PartitionSource for LogReader {
    fn partitions(&mut self) -> Result<Vec<i32>, KafkaError> {
        Ok(vec![0])
    }

    fn open(&mut self, _partition: i32) -> Result<(), KafkaError> {
        self.pending = self.log.clone().into();
        Ok(())
    }

    async fn next_message(&mut self) -> Result<ScannedMessage, KafkaError> {
        match self.pending.pop_front() {
            Some(message) => Ok(message),
            None => std::future::pending().await,
        }
    }
}

impl SourceFactory for RetainedLog {
    type Source = LogReader;

    fn create(&self) -> Result<LogReader, KafkaError> {
        Ok(LogReader {
            pending: VecDeque::new(),
            log: self.messages.clone(),
        })
    }
}

fn execution_event(execution_id: Uuid, total: i32, passed: i32, failed: i32) -> Value {
    json!({
        "execution_id": execution_id.to_string(),
        "challenge_id": Uuid::new_v4().to_string(),
        "student_id": Uuid::new_v4().to_string(),
        "language": "rust",
        "status": "completed",
        "timestamp": "2024-03-01T10:00:00Z",
        "execution_time_ms": 800,
        "exit_code": 0,
        "total_tests": total,
        "passed_tests": passed,
        "failed_tests": failed,
        "success": true,
        "server_instance": "runner-2",
        "test_results": [
            { "test_id": Uuid::new_v4().to_string(), "test_name": "valid", "passed": true },
            { "test_id": "bogus", "test_name": "invalid id", "passed": true }
        ]
    })
}

fn ingester(store: &MemoryStore) -> TopicIngester<ExecutionEvent> {
    let store: Arc<dyn RecordStore<ExecutionRecord>> = Arc::new(store.clone());
    TopicIngester::new(TOPIC, store)
}

#[tokio::test(start_paused = true)]
async fn repeated_events_and_backfill_store_one_record() {
    let store = MemoryStore::new();
    let ingester = ingester(&store);
    let execution_id = Uuid::new_v4();
    let payload = serde_json::to_vec(&execution_event(execution_id, 10, 7, 3)).unwrap();

    assert_eq!(
        ingester.handle(Some(payload.as_slice()), 0, 0).await.unwrap(),
        Upsert::Inserted
    );
    assert_eq!(
        ingester.handle(Some(payload.as_slice()), 0, 1).await.unwrap(),
        Upsert::Duplicate
    );

    let log = RetainedLog {
        messages: vec![
            ScannedMessage {
                partition: 0,
                offset: 0,
                payload: Some(payload.clone()),
            },
            ScannedMessage {
                partition: 0,
                offset: 1,
                payload: Some(payload),
            },
        ],
    };
    let backfill = Backfill::new(
        ingester,
        log,
        Duration::from_secs(10),
        CancellationToken::new(),
    );

    let report = backfill.trigger().await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.duplicates, 2);
    assert_eq!(store.execution_count(), 1);

    let stored = store
        .find_by_execution_id(ExecutionId::from(execution_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.record.success_rate(), 70.0);
    assert_eq!(stored.record.test_outcomes().len(), 1);
    assert_eq!(stored.record.test_outcomes()[0].test_name, "valid");
}

#[tokio::test]
async fn mismatched_counts_never_reach_the_store() {
    let store = MemoryStore::new();
    let payload = serde_json::to_vec(&execution_event(Uuid::new_v4(), 10, 7, 2)).unwrap();

    let result = ingester(&store).handle(Some(payload.as_slice()), 0, 0).await;

    assert!(matches!(result, Err(IngestError::Invalid(_))));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn malformed_messages_are_rejected() {
    let store = MemoryStore::new();
    let ingester = ingester(&store);

    assert!(matches!(
        ingester.handle(None, 0, 0).await,
        Err(IngestError::Empty)
    ));
    assert!(matches!(
        ingester.handle(Some(b"not json".as_slice()), 0, 1).await,
        Err(IngestError::Deserialize(_))
    ));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn future_registrations_are_rejected() {
    let store = MemoryStore::new();
    let registrations: Arc<dyn RecordStore<RegistrationRecord>> = Arc::new(store.clone());
    let ingester = TopicIngester::<RegistrationEvent>::new("iam.user.registered", registrations);

    let next_year = i64::from(Utc::now().year() + 1);
    let payload = serde_json::to_vec(&json!({
        "userId": Uuid::new_v4().to_string(),
        "profileId": Uuid::new_v4().to_string(),
        "username": "linus",
        "occurredOn": [next_year, 1, 1, 0, 0, 0],
    }))
    .unwrap();

    assert!(matches!(
        ingester.handle(Some(payload.as_slice()), 0, 0).await,
        Err(IngestError::Invalid(_))
    ));
    assert_eq!(store.registration_count(), 0);
}
