use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::{
    percentage, ChallengeStats, DailyRegistrations, DailyStats, ExecutionQueries, LanguageStats,
    Page, Readiness, RecordStore, RegistrationQueries, StoreError, Stored, Upsert, Window,
};
use crate::domain::{
    ChallengeId, ExecutionId, ExecutionRecord, RegistrationRecord, StudentId, UserId,
};

/// Keeps everything in process. Used by tests and local runs without
/// Postgres.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    executions: Vec<Stored<ExecutionRecord>>,
    registrations: Vec<Stored<RegistrationRecord>>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    pub fn registration_count(&self) -> usize {
        self.lock().registrations.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written record
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn executions_where(
        &self,
        page: Page,
        filter: impl Fn(&ExecutionRecord) -> bool,
    ) -> Vec<Stored<ExecutionRecord>> {
        let inner = self.lock();
        let mut matching: Vec<_> = inner
            .executions
            .iter()
            .filter(|stored| filter(&stored.record))
            .cloned()
            .collect();
        matching.sort_by_key(|stored| std::cmp::Reverse(stored.record.timestamp()));
        paginate(matching, page.offset(), page.limit())
    }

    fn success_rate_where(&self, filter: impl Fn(&ExecutionRecord) -> bool) -> f64 {
        let inner = self.lock();
        let (total, successful) = inner
            .executions
            .iter()
            .filter(|stored| filter(&stored.record))
            .fold((0, 0), |(total, successful), stored| {
                (total + 1, successful + i64::from(stored.record.success()))
            });
        percentage(successful, total)
    }

    fn registrations_where(
        &self,
        window: Window,
        filter: impl Fn(&RegistrationRecord) -> bool,
    ) -> Vec<Stored<RegistrationRecord>> {
        let inner = self.lock();
        let mut matching: Vec<_> = inner
            .registrations
            .iter()
            .filter(|stored| filter(&stored.record))
            .cloned()
            .collect();
        matching.sort_by_key(|stored| std::cmp::Reverse(stored.record.registered_at()));
        paginate(matching, window.offset, window.limit)
    }
}

fn paginate<T>(items: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    items.into_iter().skip(offset).take(limit).collect()
}

fn in_range(at: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    start <= at && at <= end
}

fn mean(sum: i64, count: i64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

#[async_trait]
impl Readiness for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RecordStore<ExecutionRecord> for MemoryStore {
    async fn upsert_if_absent(&self, record: &ExecutionRecord) -> Result<Upsert, StoreError> {
        let mut inner = self.lock();
        if inner
            .executions
            .iter()
            .any(|stored| stored.record.execution_id() == record.execution_id())
        {
            return Ok(Upsert::Duplicate);
        }

        let now = Utc::now();
        let id = inner.next_id();
        inner.executions.push(Stored {
            id,
            created_at: now,
            updated_at: now,
            record: record.clone(),
        });
        Ok(Upsert::Inserted)
    }
}

#[async_trait]
impl RecordStore<RegistrationRecord> for MemoryStore {
    async fn upsert_if_absent(&self, record: &RegistrationRecord) -> Result<Upsert, StoreError> {
        let mut inner = self.lock();
        if inner
            .registrations
            .iter()
            .any(|stored| stored.record.user_id() == record.user_id())
        {
            return Ok(Upsert::Duplicate);
        }

        let now = Utc::now();
        let id = inner.next_id();
        inner.registrations.push(Stored {
            id,
            created_at: now,
            updated_at: now,
            record: record.clone(),
        });
        Ok(Upsert::Inserted)
    }
}

#[async_trait]
impl ExecutionQueries for MemoryStore {
    async fn find_by_execution_id(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Stored<ExecutionRecord>>, StoreError> {
        Ok(self
            .lock()
            .executions
            .iter()
            .find(|stored| stored.record.execution_id() == id)
            .cloned())
    }

    async fn find_by_student(
        &self,
        id: StudentId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        Ok(self.executions_where(page, |record| record.student_id() == id))
    }

    async fn find_by_challenge(
        &self,
        id: ChallengeId,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        Ok(self.executions_where(page, |record| record.challenge_id() == id))
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Stored<ExecutionRecord>>, StoreError> {
        Ok(self.executions_where(page, |record| {
            in_range(record.timestamp(), start, end)
        }))
    }

    async fn count_by_student(&self, id: StudentId) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .executions
            .iter()
            .filter(|stored| stored.record.student_id() == id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn count_by_challenge(&self, id: ChallengeId) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .executions
            .iter()
            .filter(|stored| stored.record.challenge_id() == id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn success_rate_by_student(&self, id: StudentId) -> Result<f64, StoreError> {
        Ok(self.success_rate_where(|record| record.student_id() == id))
    }

    async fn success_rate_by_challenge(&self, id: ChallengeId) -> Result<f64, StoreError> {
        Ok(self.success_rate_where(|record| record.challenge_id() == id))
    }

    async fn average_execution_time_by_challenge(
        &self,
        id: ChallengeId,
    ) -> Result<f64, StoreError> {
        let inner = self.lock();
        let (count, sum) = inner
            .executions
            .iter()
            .filter(|stored| stored.record.challenge_id() == id)
            .fold((0, 0), |(count, sum), stored| {
                (count + 1, sum + stored.record.execution_time_ms())
            });
        Ok(mean(sum, count))
    }

    async fn daily_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyStats>, StoreError> {
        let inner = self.lock();
        // (total, successful, duration sum) per day
        let mut days: BTreeMap<NaiveDate, (i64, i64, i64)> = BTreeMap::new();
        for stored in &inner.executions {
            let record = &stored.record;
            if !in_range(record.timestamp(), start, end) {
                continue;
            }
            let day = days.entry(record.timestamp().date_naive()).or_default();
            day.0 += 1;
            day.1 += i64::from(record.success());
            day.2 += record.execution_time_ms();
        }

        Ok(days
            .into_iter()
            .rev()
            .map(|(date, (total, successful, sum))| DailyStats {
                date,
                total_executions: total,
                successful_executions: successful,
                failed_executions: total - successful,
                avg_execution_time_ms: mean(sum, total),
            })
            .collect())
    }

    async fn language_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LanguageStats>, StoreError> {
        let inner = self.lock();
        let mut languages: BTreeMap<&'static str, (i64, i64)> = BTreeMap::new();
        for stored in &inner.executions {
            let record = &stored.record;
            if !in_range(record.timestamp(), start, end) {
                continue;
            }
            let entry = languages.entry(record.language().as_str()).or_default();
            entry.0 += 1;
            entry.1 += i64::from(record.success());
        }

        let mut stats: Vec<LanguageStats> = languages
            .into_iter()
            .map(|(language, (total, successful))| LanguageStats {
                language: language.to_string(),
                total_executions: total,
                success_rate: percentage(successful, total),
            })
            .collect();
        // Stable, so ties keep alphabetical order
        stats.sort_by(|a, b| b.total_executions.cmp(&a.total_executions));
        Ok(stats)
    }

    async fn top_failed_challenges(&self, limit: i64) -> Result<Vec<ChallengeStats>, StoreError> {
        let inner = self.lock();
        let mut challenges: BTreeMap<Uuid, (i64, i64, i64)> = BTreeMap::new();
        for stored in &inner.executions {
            let record = &stored.record;
            let entry = challenges
                .entry(record.challenge_id().as_uuid())
                .or_default();
            entry.0 += 1;
            entry.1 += i64::from(record.success());
            entry.2 += record.execution_time_ms();
        }

        let mut stats: Vec<ChallengeStats> = challenges
            .into_iter()
            .map(|(challenge_id, (total, successful, sum))| ChallengeStats {
                challenge_id,
                total_executions: total,
                success_rate: percentage(successful, total),
                avg_execution_time_ms: mean(sum, total),
            })
            .collect();
        stats.sort_by(|a, b| {
            a.success_rate
                .total_cmp(&b.success_rate)
                .then(b.total_executions.cmp(&a.total_executions))
        });
        stats.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stats)
    }
}

#[async_trait]
impl RegistrationQueries for MemoryStore {
    async fn find_by_user_id(
        &self,
        id: UserId,
    ) -> Result<Option<Stored<RegistrationRecord>>, StoreError> {
        Ok(self
            .lock()
            .registrations
            .iter()
            .find(|stored| stored.record.user_id() == id)
            .cloned())
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Window,
    ) -> Result<Vec<Stored<RegistrationRecord>>, StoreError> {
        Ok(self.registrations_where(window, |record| {
            in_range(record.registered_at(), start, end)
        }))
    }

    async fn find_all(&self, window: Window) -> Result<Vec<Stored<RegistrationRecord>>, StoreError> {
        Ok(self.registrations_where(window, |_| true))
    }

    async fn count_total(&self) -> Result<i64, StoreError> {
        Ok(i64::try_from(self.registration_count()).unwrap_or(i64::MAX))
    }

    async fn daily_registrations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyRegistrations>, StoreError> {
        let inner = self.lock();
        let mut days: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for stored in &inner.registrations {
            let at = stored.record.registered_at();
            if in_range(at, start, end) {
                *days.entry(at.date_naive()).or_default() += 1;
            }
        }
        Ok(days
            .into_iter()
            .rev()
            .map(|(date, total_registrations)| DailyRegistrations {
                date,
                total_registrations,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStatus, NewExecution, ProgrammingLanguage};
    use chrono::{Duration, TimeZone};

    fn execution(
        challenge: ChallengeId,
        language: ProgrammingLanguage,
        success: bool,
        at: DateTime<Utc>,
    ) -> ExecutionRecord {
        ExecutionRecord::new(NewExecution {
            execution_id: Uuid::new_v4().into(),
            challenge_id: challenge,
            code_version_id: None,
            student_id: Uuid::new_v4().into(),
            language,
            status: if success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            },
            timestamp: at,
            execution_time_ms: if success { 100 } else { 300 },
            exit_code: i32::from(!success),
            total_tests: 1,
            passed_tests: i32::from(success),
            failed_tests: i32::from(!success),
            success,
            server_instance: "runner-1".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn inserts_once_per_execution_id() {
        let store = MemoryStore::new();
        let record = execution(
            Uuid::new_v4().into(),
            ProgrammingLanguage::Go,
            true,
            Utc::now(),
        );

        assert_eq!(store.upsert_if_absent(&record).await.unwrap(), Upsert::Inserted);
        assert_eq!(store.upsert_if_absent(&record).await.unwrap(), Upsert::Duplicate);
        assert_eq!(store.execution_count(), 1);
    }

    #[tokio::test]
    async fn aggregates_by_day_language_and_challenge() {
        let store = MemoryStore::new();
        let day_one = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let day_two = day_one + Duration::days(1);
        let easy: ChallengeId = Uuid::new_v4().into();
        let hard: ChallengeId = Uuid::new_v4().into();

        for record in [
            execution(easy, ProgrammingLanguage::Rust, true, day_one),
            execution(easy, ProgrammingLanguage::Rust, true, day_two),
            execution(hard, ProgrammingLanguage::Python, false, day_two),
            execution(hard, ProgrammingLanguage::Rust, true, day_two),
        ] {
            store.upsert_if_absent(&record).await.unwrap();
        }

        let daily = store
            .daily_stats(day_one, day_two + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, day_two.date_naive());
        assert_eq!(daily[0].total_executions, 3);
        assert_eq!(daily[0].failed_executions, 1);
        assert_eq!(daily[1].avg_execution_time_ms, 100.0);

        let languages = store
            .language_stats(day_one, day_two + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(languages[0].language, "rust");
        assert_eq!(languages[0].total_executions, 3);
        assert_eq!(languages[1].success_rate, 0.0);

        let worst = store.top_failed_challenges(1).await.unwrap();
        assert_eq!(worst.len(), 1);
        assert_eq!(worst[0].challenge_id, hard.as_uuid());
        assert_eq!(worst[0].success_rate, 50.0);

        assert_eq!(store.success_rate_by_challenge(easy).await.unwrap(), 100.0);
        assert_eq!(store.average_execution_time_by_challenge(hard).await.unwrap(), 200.0);
        assert_eq!(store.count_by_challenge(hard).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pages_newest_first() {
        let store = MemoryStore::new();
        let challenge: ChallengeId = Uuid::new_v4().into();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for minutes in 0..5 {
            let record = execution(
                challenge,
                ProgrammingLanguage::Java,
                true,
                start + Duration::minutes(minutes),
            );
            store.upsert_if_absent(&record).await.unwrap();
        }

        let page = store
            .find_by_challenge(challenge, Page::new(Some(2), Some(2)))
            .await
            .unwrap();
        let minutes: Vec<i64> = page
            .iter()
            .map(|stored| (stored.record.timestamp() - start).num_minutes())
            .collect();
        assert_eq!(minutes, vec![2, 1]);
    }
}
