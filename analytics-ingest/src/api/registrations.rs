use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::error::{ApiError, Result};
use super::{lenient, parse_rfc3339, AppState};
use crate::domain::{Email, ProfileId, Provider, RegistrationRecord, UserId};
use crate::store::{DailyRegistrations, Stored, Window};

#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    limit: Option<String>,
    offset: Option<String>,
}

impl WindowParams {
    fn window(&self) -> Window {
        Window::new(lenient(&self.limit), lenient(&self.offset))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DateRangeParams {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

impl DateRangeParams {
    fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = parse_rfc3339(
            self.start_date.as_deref().unwrap_or_default(),
            "invalid_start_date",
            "start_date must be in RFC3339 format",
        )?;
        let end = parse_rfc3339(
            self.end_date.as_deref().unwrap_or_default(),
            "invalid_end_date",
            "end_date must be in RFC3339 format",
        )?;
        Ok((start, end))
    }
}

#[derive(Serialize)]
pub struct RegistrationView {
    id: i64,
    user_id: UserId,
    profile_id: ProfileId,
    username: String,
    profile_url: Option<String>,
    registered_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Stored<RegistrationRecord>> for RegistrationView {
    fn from(stored: Stored<RegistrationRecord>) -> Self {
        let record = stored.record;
        Self {
            id: stored.id,
            user_id: record.user_id(),
            profile_id: record.profile_id(),
            username: record.username().to_string(),
            profile_url: record.profile_url().map(str::to_string),
            registered_at: record.registered_at(),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }
}

fn listing(records: Vec<Stored<RegistrationRecord>>, window: Window) -> Json<Value> {
    let data: Vec<RegistrationView> = records.into_iter().map(RegistrationView::from).collect();
    Json(json!({
        "total": data.len(),
        "limit": window.limit,
        "offset": window.offset,
        "data": data,
    }))
}

pub async fn get_by_user_id(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<RegistrationView>> {
    let user_id =
        UserId::parse(&user_id).map_err(|e| ApiError::bad_request("invalid_user_id", e.to_string()))?;

    let stored = state
        .registrations
        .find_by_user_id(user_id)
        .await?
        .ok_or(ApiError::NotFound("User registration not found"))?;

    Ok(Json(stored.into()))
}

/// Registration events carry no e-mail, so a valid address never matches.
pub async fn get_by_email(Path(email): Path<String>) -> Result<Json<RegistrationView>> {
    let email =
        Email::parse(&email).map_err(|e| ApiError::bad_request("invalid_email", e.to_string()))?;
    debug!(domain = email.domain(), "registration lookup by email");

    Err(ApiError::NotFound("User registration not found"))
}

/// Registration events carry no provider, so a valid provider lists nothing.
pub async fn get_by_provider(
    Path(provider): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Value>> {
    let provider = Provider::parse(&provider)
        .map_err(|e| ApiError::bad_request("invalid_provider", e.to_string()))?;
    debug!(provider = %provider, oauth = provider.is_oauth(), "registration lookup by provider");

    Ok(listing(Vec::new(), params.window()))
}

pub async fn get_by_date_range(
    State(state): State<AppState>,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Value>> {
    let (start, end) = params.bounds()?;
    let window = Window::new(lenient(&params.limit), lenient(&params.offset));

    let records = state
        .registrations
        .find_by_date_range(start, end, window)
        .await?;
    Ok(listing(records, window))
}

pub async fn get_all(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Value>> {
    let window = params.window();
    let records = state.registrations.find_all(window).await?;
    Ok(listing(records, window))
}

pub async fn get_total_users(State(state): State<AppState>) -> Result<Json<Value>> {
    let total = state.registrations.count_total().await?;
    Ok(Json(json!({ "total_users": total })))
}

pub async fn get_daily_registrations(
    State(state): State<AppState>,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Vec<DailyRegistrations>>> {
    let (start, end) = params.bounds()?;
    Ok(Json(state.registrations.daily_registrations(start, end).await?))
}

/// Registration events carry no provider, so there is nothing to group by.
pub async fn get_provider_stats() -> Json<Value> {
    Json(json!([]))
}

/// Registration events carry no e-mail, so there are no domains to rank.
pub async fn get_top_email_domains() -> Json<Value> {
    Json(json!([]))
}
