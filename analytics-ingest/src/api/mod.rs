use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use health::{HealthRegistry, HealthStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::ingest::BackfillTrigger;
use crate::store::{ExecutionQueries, Readiness, RegistrationQueries};

pub mod error;
pub mod executions;
pub mod metrics;
pub mod registrations;
pub mod sync;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub executions: Arc<dyn ExecutionQueries>,
    pub registrations: Arc<dyn RegistrationQueries>,
    pub execution_backfill: Arc<dyn BackfillTrigger>,
    pub registration_backfill: Arc<dyn BackfillTrigger>,
    pub readiness: Arc<dyn Readiness>,
    pub liveness: HealthRegistry,
    pub service_name: String,
}

pub fn create_router(state: AppState, recorder: Option<PrometheusHandle>) -> Router {
    let analytics_routes = Router::new()
        .route("/execution/:execution_id", get(executions::get_execution))
        .route("/student/:student_id", get(executions::get_by_student))
        .route("/challenge/:challenge_id", get(executions::get_by_challenge))
        .route("/date-range", get(executions::get_by_date_range))
        .route("/kpi/student/:student_id", get(executions::get_student_kpi))
        .route(
            "/kpi/challenge/:challenge_id",
            get(executions::get_challenge_kpi),
        )
        .route("/kpi/daily", get(executions::get_daily_kpi))
        .route("/kpi/languages", get(executions::get_language_kpi))
        .route(
            "/kpi/top-failed-challenges",
            get(executions::get_top_failed_challenges),
        );

    let registration_routes = Router::new()
        .route("/user/:user_id", get(registrations::get_by_user_id))
        .route("/email/:email", get(registrations::get_by_email))
        .route("/provider/:provider", get(registrations::get_by_provider))
        .route("/date-range", get(registrations::get_by_date_range))
        .route("/all", get(registrations::get_all))
        .route("/kpi/total-users", get(registrations::get_total_users))
        .route(
            "/kpi/daily-registrations",
            get(registrations::get_daily_registrations),
        )
        .route("/kpi/provider-stats", get(registrations::get_provider_stats))
        .route(
            "/kpi/top-email-domains",
            get(registrations::get_top_email_domains),
        )
        .route("/sync", post(sync::sync_registrations));

    let api_routes = Router::new()
        .nest("/analytics", analytics_routes)
        .nest("/user-registration-analytics", registration_routes)
        .route("/sync/events", post(sync::sync_executions));

    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        .route("/", get(index))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness));

    if let Some(recorder) = recorder {
        router = router.route(
            "/metrics",
            get(move || std::future::ready(recorder.render())),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> String {
    state.service_name
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "UP" }))
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    state
        .readiness
        .ping()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok("ok")
}

/// Numeric query values that fail to parse count as absent.
pub(crate) fn lenient(value: &Option<String>) -> Option<i64> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

pub(crate) fn parse_rfc3339(
    value: &str,
    code: &'static str,
    message: impl Into<String>,
) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lenient_numbers() {
        assert_eq!(lenient(&Some("3".to_string())), Some(3));
        assert_eq!(lenient(&Some("three".to_string())), None);
        assert_eq!(lenient(&None), None);
    }

    #[test]
    fn rfc3339_dates() {
        assert_eq!(
            parse_rfc3339("2024-03-01T12:00:00+02:00", "invalid_date", "bad").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert!(matches!(
            parse_rfc3339("2024-03-01", "invalid_start_date", "bad"),
            Err(ApiError::BadRequest {
                code: "invalid_start_date",
                ..
            })
        ));
    }
}
