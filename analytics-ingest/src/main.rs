use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common_kafka::GroupConsumer;
use envconfig::Envconfig;
use health::HealthRegistry;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use analytics_ingest::api::{create_router, metrics::setup_metrics_recorder, AppState};
use analytics_ingest::events::{ExecutionEvent, RegistrationEvent, TopicEvent};
use analytics_ingest::ingest::backfill::ScannerFactory;
use analytics_ingest::ingest::{Backfill, StreamingConsumer, TopicIngester};
use analytics_ingest::store::{PgStore, RecordStore};
use analytics_ingest::{Config, StartupError};

// Broker statistics arrive every 10s, leave room for a couple of misses
const CONSUMER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

async fn shutdown_signal(shutdown: CancellationToken) {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for SIGINT: {}", e);
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => {},
    }
    shutdown.cancel();
}

async fn listen(app: Router, bind: String, shutdown: CancellationToken) -> Result<(), StartupError> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|error| StartupError::Bind {
            bind: bind.clone(),
            error,
        })?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(StartupError::Serve)
}

/// Creates the group consumer for `E`'s topic, probes the broker and starts
/// the streaming loop.
async fn spawn_consumer<E: TopicEvent>(
    config: &Config,
    consumer_config: common_kafka::ConsumerConfig,
    store: Arc<dyn RecordStore<E::Record>>,
    liveness: &HealthRegistry,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, StartupError> {
    let topic = consumer_config.topic.clone();
    let handle = liveness
        .register(format!("{}-consumer", E::KIND), CONSUMER_LIVENESS_DEADLINE)
        .await;

    let consumer = GroupConsumer::new(&config.kafka, &consumer_config, Some(handle.clone()))
        .map_err(|error| StartupError::Consumer {
            topic: topic.clone(),
            error,
        })?;
    let partitions = consumer
        .probe(config.kafka_probe_timeout.0)
        .map_err(|error| StartupError::Probe {
            topic: topic.clone(),
            error,
        })?;
    info!(topic = %topic, partitions, "broker probe succeeded");

    let ingester = TopicIngester::<E>::new(&topic, store);
    let streaming = StreamingConsumer::new(
        consumer,
        ingester,
        config.consumer_backoff(),
        Some(handle),
    );

    Ok(tokio::spawn(async move {
        if let Err(e) = streaming.run(shutdown).await {
            error!(topic = %topic, "streaming consumer exited: {}", e);
        }
    }))
}

async fn run() -> Result<(), StartupError> {
    let config = Config::init_from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(config.pg_acquire_timeout.0)
        .connect(&config.database_url)
        .await
        .map_err(StartupError::Database)?;

    if config.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("migrations applied");
    }

    let store = Arc::new(PgStore::new(pool));
    let liveness = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();

    let execution_task = spawn_consumer::<ExecutionEvent>(
        &config,
        config.execution_consumer(),
        store.clone(),
        &liveness,
        shutdown.clone(),
    )
    .await?;
    let registration_task = spawn_consumer::<RegistrationEvent>(
        &config,
        config.registration_consumer(),
        store.clone(),
        &liveness,
        shutdown.clone(),
    )
    .await?;

    let execution_backfill = Backfill::new(
        TopicIngester::<ExecutionEvent>::new(&config.execution_topic, store.clone()),
        ScannerFactory::new(
            config.kafka.clone(),
            &config.execution_topic,
            config.kafka_probe_timeout.0,
        ),
        config.execution_backfill_idle_timeout.0,
        shutdown.clone(),
    );
    let registration_backfill = Backfill::new(
        TopicIngester::<RegistrationEvent>::new(&config.registration_topic, store.clone()),
        ScannerFactory::new(
            config.kafka.clone(),
            &config.registration_topic,
            config.kafka_probe_timeout.0,
        ),
        config.registration_backfill_idle_timeout.0,
        shutdown.clone(),
    );

    let recorder = setup_metrics_recorder()?;
    let state = AppState {
        executions: store.clone(),
        registrations: store.clone(),
        execution_backfill: Arc::new(execution_backfill),
        registration_backfill: Arc::new(registration_backfill),
        readiness: store,
        liveness,
        service_name: config.service_name.clone(),
    };
    let app = create_router(state, Some(recorder));

    let served = listen(app, config.bind(), shutdown.clone()).await;

    // The server may also stop on its own error, consumers follow it down
    shutdown.cancel();
    for task in [execution_task, registration_task] {
        if let Err(e) = task.await {
            error!("consumer task failed: {}", e);
        }
    }
    info!("shutdown complete");

    served
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .init();

    if let Err(e) = run().await {
        error!("analytics-ingest failed: {}", e);
        std::process::exit(1);
    }
}
