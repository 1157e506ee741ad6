use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of a service.
///
/// Every streaming consumer registers itself as a component and must keep
/// reporting before its deadline. The process is live only while every
/// registered component is live:
///   - a component that never reported is still `Starting` and fails the check
///   - a component that reported unhealthy fails the check with its reason
///   - a component whose last healthy report expired is `Stalled`
///
/// Readiness is a different question (can we reach the database?) and is
/// answered elsewhere.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let components: BTreeMap<&str, String> = self
            .components
            .iter()
            .map(|(name, status)| (name.as_str(), status.to_string()))
            .collect();
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = json!({ "healthy": self.healthy, "components": components });
        (code, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report
    Starting,
    /// Healthy as long as the deadline is in the future
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, with the reason given by the component
    Unhealthy(String),
    /// The HealthyUntil deadline passed without a new report
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentStatus::Starting => write!(f, "starting"),
            ComponentStatus::HealthyUntil(_) => write!(f, "healthy"),
            ComponentStatus::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
            ComponentStatus::Stalled => write!(f, "stalled"),
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Must be called more often than the registration deadline.
    pub async fn report_healthy(&self) {
        self.report_status(self.healthy_until()).await
    }

    pub async fn report_unhealthy(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Unhealthy(reason.into()))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Same as `report_healthy`, callable from librdkafka's own threads.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(self.healthy_until())
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        // Inside a runtime blocking_send would panic, hand it to a task instead
        if let Ok(handle) = runtime::Handle::try_current() {
            let this = self.clone();
            handle.spawn(async move { this.report_status(status).await });
            return;
        }
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.blocking_send(message) {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    fn healthy_until(&self) -> ComponentStatus {
        ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc().add(self.deadline))
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime: status updates are applied
    /// by a background task.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    // The probe will keep failing and the process gets restarted
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// The returned handle goes to the component, which reports through it.
    pub async fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status, usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            // Nothing registered yet means nothing is running yet
            healthy: !components.is_empty(),
            components: BTreeMap::new(),
        };

        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(current, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !check() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn consumer_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("executions-consumer", Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("executions-consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_unhealthy("broker unreachable").await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("executions-consumer"),
            Some(&ComponentStatus::Unhealthy("broker unreachable".to_string()))
        );
    }

    #[tokio::test]
    async fn expired_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("registrations-consumer", Duration::from_secs(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| {
            registry.get_status().components.get("registrations-consumer")
                == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn every_consumer_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let executions = registry
            .register("executions-consumer", Duration::from_secs(30))
            .await;
        let registrations = registry
            .register("registrations-consumer", Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        executions.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("executions-consumer")
                != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        registrations.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn response_carries_component_states() {
        let mut status = HealthStatus::default();
        let response = HealthStatus::default().into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        status.healthy = true;
        status.components.insert(
            "executions-consumer".to_string(),
            ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc()),
        );
        let response = status.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["components"]["executions-consumer"], "healthy");
    }
}
