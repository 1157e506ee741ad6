use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    ChallengeId, DomainError, ExecutionId, ExecutionRecord, RegistrationRecord, StudentId, UserId,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("stored row failed validation: {0}")]
    Corrupt(#[from] DomainError),
}

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// A record with the same natural key already exists. Nothing was written.
    Duplicate,
}

/// Persists records at most once per natural key.
///
/// Implementations write the record and all of its children atomically, and
/// must treat a concurrent insert of the same key losing a uniqueness race
/// as `Upsert::Duplicate`.
#[async_trait]
pub trait RecordStore<R>: Send + Sync {
    async fn upsert_if_absent(&self, record: &R) -> Result<Upsert, StoreError>;
}

/// Whether the backing store can currently serve requests.
#[async_trait]
pub trait Readiness: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A record as read back, with its storage bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<R> {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record: R,
}

/// 1-based page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub const DEFAULT_PAGE: i64 = 1;
    pub const DEFAULT_PAGE_SIZE: i64 = 20;

    /// Missing values, and values below 1, fall back to the defaults.
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page: page.filter(|p| *p >= 1).unwrap_or(Self::DEFAULT_PAGE),
            page_size: page_size
                .filter(|s| *s >= 1)
                .unwrap_or(Self::DEFAULT_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Limit/offset slice of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub limit: i64,
    pub offset: i64,
}

impl Window {
    pub const DEFAULT_LIMIT: i64 = 50;

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit.filter(|l| *l >= 1).unwrap_or(Self::DEFAULT_LIMIT),
            offset: offset.filter(|o| *o >= 0).unwrap_or(0),
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub avg_execution_time_ms: f64,
}

impl DailyStats {
    pub fn success_rate(&self) -> f64 {
        percentage(self.successful_executions, self.total_executions)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct LanguageStats {
    pub language: String,
    pub total_executions: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ChallengeStats {
    pub challenge_id: Uuid,
    pub total_executions: i64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DailyRegistrations {
    pub date: NaiveDate,
    pub total_registrations: i64,
}

pub(crate) fn percentage(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// Read side of the execution store.
#[async_trait]
pub trait ExecutionQueries: Send + Sync {
    async fn find_by_execution_id(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Stored<ExecutionRecord>>, StoreError>;

    /// Newest first.
    async fn find_by_student(
        &self,
        id: StudentId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError>;

    /// Newest first.
    async fn find_by_challenge(
        &self,
        id: ChallengeId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError>;

    /// Both bounds inclusive, newest first.
    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError>;

    async fn count_by_student(&self, id: StudentId) -> Result<i64, StoreError>;

    async fn count_by_challenge(&self, id: ChallengeId) -> Result<i64, StoreError>;

    /// Percentage of successful executions, 0 without executions.
    async fn success_rate_by_student(&self, id: StudentId) -> Result<f64, StoreError>;

    async fn success_rate_by_challenge(&self, id: ChallengeId) -> Result<f64, StoreError>;

    async fn average_execution_time_by_challenge(&self, id: ChallengeId)
        -> Result<f64, StoreError>;

    /// One row per UTC day, newest first.
    async fn daily_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyStats>, StoreError>;

    /// Most used language first.
    async fn language_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LanguageStats>, StoreError>;

    /// Lowest success rate first, ties broken by execution count.
    async fn top_failed_challenges(&self, limit: i64) -> Result<Vec<ChallengeStats>, StoreError>;
}

/// Read side of the registration store.
#[async_trait]
pub trait RegistrationQueries: Send + Sync {
    async fn find_by_user_id(
        &self,
        id: UserId,
    ) -> Result<Option<Stored<RegistrationRecord>>, StoreError>;

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Window,
    ) -> Result<Vec<Stored<RegistrationRecord>>, StoreError>;

    async fn find_all(&self, window: Window) -> Result<Vec<Stored<RegistrationRecord>>, StoreError>;

    async fn count_total(&self) -> Result<i64, StoreError>;

    async fn daily_registrations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyRegistrations>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_fall_back_to_defaults() {
        assert_eq!(Page::default(), Page { page: 1, page_size: 20 });
        assert_eq!(Page::new(Some(0), Some(-3)), Page::default());

        let page = Page::new(Some(3), Some(25));
        assert_eq!(page.limit(), 25);
        assert_eq!(page.offset(), 50);
    }

    #[test]
    fn windows_fall_back_to_defaults() {
        assert_eq!(Window::default(), Window { limit: 50, offset: 0 });
        assert_eq!(Window::new(Some(0), Some(-1)), Window::default());
        assert_eq!(
            Window::new(Some(5), Some(10)),
            Window { limit: 5, offset: 10 }
        );
    }

    #[test]
    fn daily_success_rate() {
        let stats = DailyStats {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            total_executions: 4,
            successful_executions: 3,
            failed_executions: 1,
            avg_execution_time_ms: 100.0,
        };
        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(percentage(0, 0), 0.0);
    }
}
