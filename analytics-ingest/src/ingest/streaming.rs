use std::time::Duration;

use common_kafka::{Delivery, GroupConsumer, SessionTracker};
use health::HealthHandle;
use rdkafka::error::KafkaError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::TopicIngester;
use crate::events::TopicEvent;
use crate::metrics_consts::{CONSUMER_RECV_ERRORS, OFFSET_STORE_FAILED};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Doubling backoff between `initial_delay` and `max_delay`.
    pub const fn doubling(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(initial_delay, 2.0, max_delay)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self
            .multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let secs = self.initial_delay.as_secs_f64() * pow;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Long-lived group member feeding one topic into its ingester.
///
/// A message's offset is stored for commit only once the ingester has
/// stored it or found it already stored. Receive errors fail the session,
/// back off and rejoin, the loop only ends on cancellation.
pub struct StreamingConsumer<E: TopicEvent> {
    consumer: GroupConsumer,
    ingester: TopicIngester<E>,
    backoff: BackoffPolicy,
    liveness: Option<HealthHandle>,
}

impl<E: TopicEvent> StreamingConsumer<E> {
    pub fn new(
        consumer: GroupConsumer,
        ingester: TopicIngester<E>,
        backoff: BackoffPolicy,
        liveness: Option<HealthHandle>,
    ) -> Self {
        Self {
            consumer,
            ingester,
            backoff,
            liveness,
        }
    }

    pub fn session(&self) -> &SessionTracker {
        self.consumer.session()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), KafkaError> {
        let topic = self.consumer.topic().to_string();
        self.consumer.subscribe()?;
        info!(topic = %topic, "streaming consumer started");

        let mut failures: u32 = 0;
        loop {
            // In-flight handling below is never interrupted, only the wait
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(delivery) => {
                    if failures > 0 {
                        info!(topic = %topic, "session recovered after {} failures", failures);
                        failures = 0;
                        if let Some(liveness) = &self.liveness {
                            liveness.report_healthy().await;
                        }
                    }
                    self.process(delivery).await;
                }
                Err(e) => {
                    metrics::counter!(CONSUMER_RECV_ERRORS, "topic" => topic.clone()).increment(1);
                    self.consumer.fail();
                    if let Some(liveness) = &self.liveness {
                        liveness.report_unhealthy(e.to_string()).await;
                    }

                    let delay = self.backoff.next_delay(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        topic = %topic,
                        attempt = failures,
                        "failed to receive message, rejoining in {:?}: {}",
                        delay,
                        e
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.consumer.rejoin();
                }
            }
        }

        self.consumer.close();
        info!(topic = %topic, "streaming consumer stopped");
        Ok(())
    }

    async fn process(&self, delivery: Delivery) {
        let Delivery { payload, offset } = delivery;
        let (partition, position) = (offset.partition(), offset.offset());

        // Only handled messages are acknowledged
        if self
            .ingester
            .handle(payload.as_deref(), partition, position)
            .await
            .is_err()
        {
            return;
        }

        if let Err(e) = offset.store() {
            metrics::counter!(OFFSET_STORE_FAILED, "topic" => self.ingester.topic().to_string())
                .increment(1);
            warn!(
                topic = %self.ingester.topic(),
                partition,
                offset = position,
                "failed to store offset: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy::doubling(Duration::from_millis(500), Duration::from_secs(30));
        let cases = [
            (0, 500),
            (1, 1000),
            (2, 2000),
            (5, 16000),
            (6, 30000),
            (40, 30000),
            (u32::MAX, 30000),
        ];
        for (attempt, expected_ms) in cases {
            assert_eq!(
                policy.next_delay(attempt).as_millis(),
                expected_ms,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn custom_multiplier() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 3.0, Duration::from_secs(20));
        assert_eq!(policy.next_delay(2), Duration::from_secs(9));
        assert_eq!(policy.next_delay(3), Duration::from_secs(20));
    }
}
