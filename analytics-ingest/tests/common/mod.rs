#![allow(dead_code)]

use std::sync::Arc;

use analytics_ingest::api::{create_router, AppState};
use analytics_ingest::ingest::{BackfillError, BackfillReport, BackfillTrigger};
use analytics_ingest::store::MemoryStore;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use health::HealthRegistry;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Answers every trigger with a fixed report, or fails like a scan that
/// could not open any partition.
pub struct StubBackfill {
    pub inserted: Option<u64>,
}

#[async_trait]
impl BackfillTrigger for StubBackfill {
    async fn trigger(&self) -> Result<BackfillReport, BackfillError> {
        match self.inserted {
            Some(inserted) => Ok(BackfillReport {
                inserted,
                partitions: 1,
                ..Default::default()
            }),
            None => Err(BackfillError::NoReadablePartitions {
                topic: "execution.analytics".to_string(),
                partitions: 2,
            }),
        }
    }
}

pub struct TestApp {
    pub store: MemoryStore,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_backfill(Some(0))
    }

    pub fn with_backfill(inserted: Option<u64>) -> Self {
        let store = MemoryStore::new();
        let state = AppState {
            executions: Arc::new(store.clone()),
            registrations: Arc::new(store.clone()),
            execution_backfill: Arc::new(StubBackfill { inserted }),
            registration_backfill: Arc::new(StubBackfill { inserted }),
            readiness: Arc::new(store.clone()),
            liveness: HealthRegistry::new("liveness"),
            service_name: "analytics-service".to_string(),
        };

        Self {
            store,
            router: create_router(state, None),
        }
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri).await
    }

    pub async fn post(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::POST, uri).await
    }

    pub async fn get_text(&self, uri: &str) -> (StatusCode, String) {
        let (status, bytes) = self.call(Method::GET, uri).await;
        (status, String::from_utf8(bytes).unwrap())
    }

    async fn send(&self, method: Method, uri: &str) -> (StatusCode, Value) {
        let (status, bytes) = self.call(method, uri).await;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn call(&self, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }
}
