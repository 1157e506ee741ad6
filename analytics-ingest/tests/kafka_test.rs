//! Ingestion against an in-process mock broker.

use std::sync::Arc;
use std::time::Duration;

use analytics_ingest::domain::{ExecutionRecord, RegistrationRecord};
use analytics_ingest::events::{ExecutionEvent, RegistrationEvent};
use analytics_ingest::ingest::backfill::ScannerFactory;
use analytics_ingest::ingest::{
    Backfill, BackfillTrigger, BackoffPolicy, StreamingConsumer, TopicIngester,
};
use analytics_ingest::store::{MemoryStore, RecordStore};
use common_kafka::{ConsumerConfig, GroupConsumer, KafkaConfig, SecurityProtocol, SessionState};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn kafka_config(hosts: String) -> KafkaConfig {
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

async fn produce(hosts: &str, topic: &str, payloads: &[Vec<u8>]) {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", hosts)
        .create()
        .unwrap();
    for payload in payloads {
        producer
            .send(
                FutureRecord::<(), _>::to(topic).partition(0).payload(payload),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
    }
}

async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn execution(execution_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "execution_id": execution_id.to_string(),
        "challenge_id": Uuid::new_v4().to_string(),
        "student_id": Uuid::new_v4().to_string(),
        "language": "java",
        "status": "completed",
        "timestamp": "2024-03-01T10:00:00Z",
        "execution_time_ms": 300,
        "exit_code": 0,
        "total_tests": 10,
        "passed_tests": 7,
        "failed_tests": 3,
        "success": true,
        "server_instance": "runner-1"
    }))
    .unwrap()
}

fn registration() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "userId": Uuid::new_v4().to_string(),
        "profileId": Uuid::new_v4().to_string(),
        "username": "barbara",
        "occurredOn": [2024, 1, 15, 8, 30, 0, 500]
    }))
    .unwrap()
}

#[tokio::test]
async fn streaming_skips_bad_messages_and_duplicates() {
    let topic = "execution.analytics";
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(topic, 2, 1)
        .expect("failed to create topic");
    let hosts = cluster.bootstrap_servers();

    let repeated = Uuid::new_v4();
    produce(
        &hosts,
        topic,
        &[
            execution(repeated),
            b"{not json".to_vec(),
            execution(repeated),
            execution(Uuid::new_v4()),
        ],
    )
    .await;

    let store = MemoryStore::new();
    let records: Arc<dyn RecordStore<ExecutionRecord>> = Arc::new(store.clone());
    let consumer = GroupConsumer::new(
        &kafka_config(hosts),
        &ConsumerConfig::new("analytics-consumer-group", topic).with_offset_reset("earliest"),
        None,
    )
    .unwrap();
    let streaming = StreamingConsumer::new(
        consumer,
        TopicIngester::<ExecutionEvent>::new(topic, records),
        BackoffPolicy::doubling(Duration::from_millis(100), Duration::from_secs(1)),
        None,
    );
    let session = streaming.session().clone();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(streaming.run(shutdown.clone()));

    // The last message only lands once the bad one and the duplicate are behind it
    eventually(|| store.execution_count() == 2).await;
    match session.current() {
        SessionState::Consuming(partitions) => assert!(partitions.contains(&0)),
        other => panic!("unexpected session state {other}"),
    }

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(session.current(), SessionState::Closed);
    assert_eq!(store.execution_count(), 2);
}

#[tokio::test]
async fn backfill_reads_the_topic_from_the_beginning() {
    let topic = "iam.user.registered";
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(topic, 1, 1)
        .expect("failed to create topic");
    let hosts = cluster.bootstrap_servers();
    produce(&hosts, topic, &[registration(), registration(), registration()]).await;

    let store = MemoryStore::new();
    let records: Arc<dyn RecordStore<RegistrationRecord>> = Arc::new(store.clone());
    let backfill = Backfill::new(
        TopicIngester::<RegistrationEvent>::new(topic, records),
        ScannerFactory::new(kafka_config(hosts), topic, Duration::from_secs(5)),
        Duration::from_secs(3),
        CancellationToken::new(),
    );

    let report = backfill.trigger().await.unwrap();
    assert_eq!(report.partitions, 1);
    assert_eq!(report.inserted, 3);
    assert_eq!(store.registration_count(), 3);

    let report = backfill.trigger().await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.duplicates, 3);
}
