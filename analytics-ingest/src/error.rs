use common_kafka::ProbeError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Conditions that stop the service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to load config: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to connect to Postgres: {0}")]
    Database(#[source] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrations(#[from] sqlx::migrate::MigrateError),
    #[error("failed to create consumer for {topic}: {error}")]
    Consumer { topic: String, error: KafkaError },
    #[error("broker probe failed for {topic}: {error}")]
    Probe { topic: String, error: ProbeError },
    #[error("failed to bind {bind}: {error}")]
    Bind {
        bind: String,
        error: std::io::Error,
    },
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}
