use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{ApiError, Result};
use super::{lenient, parse_rfc3339, AppState};
use crate::domain::{
    ChallengeId, ExecutionId, ExecutionRecord, ExecutionStatus, ProgrammingLanguage, StudentId,
    TestId,
};
use crate::store::{ChallengeStats, LanguageStats, Page, Stored};

const DEFAULT_TOP_FAILED_LIMIT: i64 = 10;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    page: Option<String>,
    #[serde(rename = "pageSize")]
    page_size: Option<String>,
}

impl PageParams {
    fn page(&self) -> Page {
        Page::new(lenient(&self.page), lenient(&self.page_size))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DateRangeParams {
    #[serde(rename = "startDate")]
    start_date: Option<String>,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
    page: Option<String>,
    #[serde(rename = "pageSize")]
    page_size: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    limit: Option<String>,
}

#[derive(Serialize)]
pub struct TestResultView {
    test_id: TestId,
    test_name: String,
    passed: bool,
    error_message: Option<String>,
}

/// Everything stored about one execution.
#[derive(Serialize)]
pub struct ExecutionDetail {
    id: i64,
    execution_id: ExecutionId,
    challenge_id: ChallengeId,
    code_version_id: Option<String>,
    student_id: StudentId,
    language: ProgrammingLanguage,
    status: ExecutionStatus,
    timestamp: DateTime<Utc>,
    execution_time_ms: i64,
    exit_code: i32,
    total_tests: i32,
    passed_tests: i32,
    failed_tests: i32,
    success: bool,
    success_rate: f64,
    server_instance: String,
    test_results: Vec<TestResultView>,
    created_at: DateTime<Utc>,
}

impl From<Stored<ExecutionRecord>> for ExecutionDetail {
    fn from(stored: Stored<ExecutionRecord>) -> Self {
        let record = &stored.record;
        Self {
            id: stored.id,
            execution_id: record.execution_id(),
            challenge_id: record.challenge_id(),
            code_version_id: record.code_version_id().map(str::to_string),
            student_id: record.student_id(),
            language: record.language(),
            status: record.status(),
            timestamp: record.timestamp(),
            execution_time_ms: record.execution_time_ms(),
            exit_code: record.exit_code(),
            total_tests: record.total_tests(),
            passed_tests: record.passed_tests(),
            failed_tests: record.failed_tests(),
            success: record.success(),
            success_rate: record.success_rate(),
            server_instance: record.server_instance().to_string(),
            test_results: record
                .test_outcomes()
                .iter()
                .map(|outcome| TestResultView {
                    test_id: outcome.test_id,
                    test_name: outcome.test_name.clone(),
                    passed: outcome.passed,
                    error_message: outcome.error_message.clone(),
                })
                .collect(),
            created_at: stored.created_at,
        }
    }
}

/// An execution as shown in listings.
#[derive(Serialize)]
pub struct ExecutionSummary {
    id: i64,
    execution_id: ExecutionId,
    challenge_id: ChallengeId,
    student_id: StudentId,
    language: ProgrammingLanguage,
    status: ExecutionStatus,
    timestamp: DateTime<Utc>,
    execution_time_ms: i64,
    success: bool,
    success_rate: f64,
    passed_tests: i32,
    total_tests: i32,
}

impl From<Stored<ExecutionRecord>> for ExecutionSummary {
    fn from(stored: Stored<ExecutionRecord>) -> Self {
        let record = &stored.record;
        Self {
            id: stored.id,
            execution_id: record.execution_id(),
            challenge_id: record.challenge_id(),
            student_id: record.student_id(),
            language: record.language(),
            status: record.status(),
            timestamp: record.timestamp(),
            execution_time_ms: record.execution_time_ms(),
            success: record.success(),
            success_rate: record.success_rate(),
            passed_tests: record.passed_tests(),
            total_tests: record.total_tests(),
        }
    }
}

#[derive(Serialize)]
pub struct DailyKpi {
    date: NaiveDate,
    total_executions: i64,
    successful_executions: i64,
    failed_executions: i64,
    success_rate: f64,
    avg_execution_time_ms: f64,
}

fn paged(records: Vec<Stored<ExecutionRecord>>, page: Page) -> Json<Value> {
    let data: Vec<ExecutionSummary> = records.into_iter().map(ExecutionSummary::from).collect();
    Json(json!({
        "data": data,
        "page": page.page,
        "page_size": page.page_size,
    }))
}

fn invalid_request(e: impl ToString) -> ApiError {
    ApiError::bad_request("invalid_request", e.to_string())
}

/// An optional bound of a KPI window.
fn window_bound(value: &Option<String>, fallback: DateTime<Utc>, which: &str) -> Result<DateTime<Utc>> {
    match value.as_deref().filter(|v| !v.is_empty()) {
        Some(v) => parse_rfc3339(
            v,
            "invalid_date",
            format!("Invalid {which} date format. Use RFC3339"),
        ),
        None => Ok(fallback),
    }
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionDetail>> {
    let execution_id = ExecutionId::parse(&execution_id).map_err(invalid_request)?;

    let stored = state
        .executions
        .find_by_execution_id(execution_id)
        .await?
        .ok_or(ApiError::NotFound("Execution analytics not found"))?;

    Ok(Json(stored.into()))
}

pub async fn get_by_student(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>> {
    let student_id = StudentId::parse(&student_id).map_err(invalid_request)?;
    let page = params.page();

    let records = state.executions.find_by_student(student_id, page).await?;
    Ok(paged(records, page))
}

pub async fn get_by_challenge(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>> {
    let challenge_id = ChallengeId::parse(&challenge_id).map_err(invalid_request)?;
    let page = params.page();

    let records = state.executions.find_by_challenge(challenge_id, page).await?;
    Ok(paged(records, page))
}

pub async fn get_by_date_range(
    State(state): State<AppState>,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Value>> {
    let start = parse_rfc3339(
        params.start_date.as_deref().unwrap_or_default(),
        "invalid_date",
        "Invalid start date format. Use RFC3339",
    )?;
    let end = parse_rfc3339(
        params.end_date.as_deref().unwrap_or_default(),
        "invalid_date",
        "Invalid end date format. Use RFC3339",
    )?;
    let page = Page::new(lenient(&params.page), lenient(&params.page_size));

    let records = state.executions.find_by_date_range(start, end, page).await?;
    Ok(paged(records, page))
}

pub async fn get_student_kpi(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
) -> Result<Json<Value>> {
    let student_id = StudentId::parse(&student_id).map_err(invalid_request)?;

    let total = state.executions.count_by_student(student_id).await?;
    let success_rate = state.executions.success_rate_by_student(student_id).await?;

    Ok(Json(json!({
        "student_id": student_id,
        "total_executions": total,
        "success_rate": success_rate,
    })))
}

pub async fn get_challenge_kpi(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
) -> Result<Json<Value>> {
    let challenge_id = ChallengeId::parse(&challenge_id).map_err(invalid_request)?;

    let total = state.executions.count_by_challenge(challenge_id).await?;
    let success_rate = state
        .executions
        .success_rate_by_challenge(challenge_id)
        .await?;
    let avg_time = state
        .executions
        .average_execution_time_by_challenge(challenge_id)
        .await?;

    Ok(Json(json!({
        "challenge_id": challenge_id,
        "total_executions": total,
        "success_rate": success_rate,
        "avg_execution_time_ms": avg_time,
    })))
}

pub async fn get_daily_kpi(
    State(state): State<AppState>,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Vec<DailyKpi>>> {
    let now = Utc::now();
    let start = window_bound(&params.start_date, now - Duration::days(7), "start")?;
    let end = window_bound(&params.end_date, now, "end")?;

    let stats = state.executions.daily_stats(start, end).await?;
    Ok(Json(
        stats
            .into_iter()
            .map(|day| DailyKpi {
                success_rate: day.success_rate(),
                date: day.date,
                total_executions: day.total_executions,
                successful_executions: day.successful_executions,
                failed_executions: day.failed_executions,
                avg_execution_time_ms: day.avg_execution_time_ms,
            })
            .collect(),
    ))
}

pub async fn get_language_kpi(
    State(state): State<AppState>,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Vec<LanguageStats>>> {
    let now = Utc::now();
    let start = window_bound(&params.start_date, now - Duration::days(30), "start")?;
    let end = window_bound(&params.end_date, now, "end")?;

    Ok(Json(state.executions.language_stats(start, end).await?))
}

pub async fn get_top_failed_challenges(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<ChallengeStats>>> {
    let limit = lenient(&params.limit)
        .filter(|l| *l >= 1)
        .unwrap_or(DEFAULT_TOP_FAILED_LIMIT);

    Ok(Json(state.executions.top_failed_challenges(limit).await?))
}
