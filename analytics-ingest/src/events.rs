//! Wire payloads of the ingested topics and their conversion into domain
//! records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{
    ChallengeId, DomainError, ExecutionId, ExecutionRecord, ExecutionStatus, NewExecution,
    ProfileId, ProgrammingLanguage, RegistrationRecord, StudentId, TestId, TestOutcome, UserId,
};

/// A JSON payload published on one topic, and how it becomes a record.
pub trait TopicEvent: DeserializeOwned + Send + 'static {
    type Record: Send + Sync + 'static;

    /// Label used in logs and metrics.
    const KIND: &'static str;

    fn into_record(self) -> Result<Self::Record, DomainError>;
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub challenge_id: String,
    pub code_version_id: Option<String>,
    pub student_id: String,
    pub language: String,
    pub status: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub execution_time_ms: i64,
    pub exit_code: i32,
    pub total_tests: i32,
    pub passed_tests: i32,
    pub failed_tests: i32,
    pub success: bool,
    pub test_results: Vec<TestResultEvent>,
    pub server_instance: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TestResultEvent {
    pub test_id: String,
    pub test_name: String,
    pub passed: bool,
    pub error_message: Option<String>,
}

impl TopicEvent for ExecutionEvent {
    type Record = ExecutionRecord;

    const KIND: &'static str = "execution";

    fn into_record(self) -> Result<ExecutionRecord, DomainError> {
        let execution_id = ExecutionId::parse(&self.execution_id)?;
        let fields = NewExecution {
            execution_id,
            challenge_id: ChallengeId::parse(&self.challenge_id)?,
            code_version_id: self.code_version_id,
            student_id: StudentId::parse(&self.student_id)?,
            language: self.language.parse::<ProgrammingLanguage>()?,
            status: self.status.parse::<ExecutionStatus>()?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            execution_time_ms: self.execution_time_ms,
            exit_code: self.exit_code,
            total_tests: self.total_tests,
            passed_tests: self.passed_tests,
            failed_tests: self.failed_tests,
            success: self.success,
            server_instance: self.server_instance,
        };
        let mut record = ExecutionRecord::new(fields)?;

        // A bad child never sinks its parent
        for result in self.test_results {
            match TestId::parse(&result.test_id) {
                Ok(test_id) => record.add_test_outcome(TestOutcome {
                    test_id,
                    test_name: result.test_name,
                    passed: result.passed,
                    error_message: result.error_message.filter(|m| !m.is_empty()),
                }),
                Err(e) => warn!(
                    execution_id = %execution_id,
                    test_name = %result.test_name,
                    "skipping test result: {}",
                    e
                ),
            }
        }

        Ok(record)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrationEvent {
    pub user_id: String,
    pub profile_id: String,
    pub username: String,
    pub profile_url: Option<String>,
    /// `[year, month, day, hour, minute, second, nanosecond?]`
    pub occurred_on: Vec<i64>,
}

impl TopicEvent for RegistrationEvent {
    type Record = RegistrationRecord;

    const KIND: &'static str = "registration";

    fn into_record(self) -> Result<RegistrationRecord, DomainError> {
        let user_id = UserId::parse(&self.user_id)?;
        let profile_id = ProfileId::parse(&self.profile_id)?;
        let registered_at = parse_occurred_on(&self.occurred_on)?;
        RegistrationRecord::new(
            user_id,
            profile_id,
            self.username,
            self.profile_url,
            registered_at,
        )
    }
}

/// Reads a date-time array in UTC. The seventh element, nanoseconds, is
/// optional. Out-of-range components are an error.
pub fn parse_occurred_on(parts: &[i64]) -> Result<DateTime<Utc>, DomainError> {
    if parts.len() < 6 {
        return Err(DomainError::InvalidOccurredOn(format!(
            "expected at least 6 elements, got {}",
            parts.len()
        )));
    }

    let component = |index: usize, name: &str| -> Result<u32, DomainError> {
        u32::try_from(parts[index])
            .map_err(|_| DomainError::InvalidOccurredOn(format!("{name} out of range: {}", parts[index])))
    };

    let year = i32::try_from(parts[0])
        .map_err(|_| DomainError::InvalidOccurredOn(format!("year out of range: {}", parts[0])))?;
    let month = component(1, "month")?;
    let day = component(2, "day")?;
    let hour = component(3, "hour")?;
    let minute = component(4, "minute")?;
    let second = component(5, "second")?;
    let nano = match parts.get(6) {
        Some(_) => component(6, "nanosecond")?,
        None => 0,
    };

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_nano_opt(hour, minute, second, nano))
        // and_hms_nano_opt accepts up to 2e9 nanos for leap seconds
        .filter(|_| nano < 1_000_000_000)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DomainError::InvalidOccurredOn(format!("not a valid date-time: {parts:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};
    use serde_json::json;

    fn execution_payload() -> serde_json::Value {
        json!({
            "execution_id": "1d3f6c0e-6a4b-4f7e-8d6b-0c9a1e2f3a4b",
            "challenge_id": "7f1c2d3e-4b5a-4c6d-8e9f-0a1b2c3d4e5f",
            "code_version_id": "v3",
            "student_id": "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d",
            "language": "python",
            "status": "completed",
            "timestamp": "2024-03-01T10:15:00Z",
            "execution_time_ms": 420,
            "exit_code": 0,
            "total_tests": 2,
            "passed_tests": 1,
            "failed_tests": 1,
            "success": false,
            "test_results": [
                {
                    "test_id": "0b0c0d0e-1f2a-4b3c-8d4e-5f6a7b8c9d0e",
                    "test_name": "sums a list",
                    "passed": true
                },
                {
                    "test_id": "not-a-uuid",
                    "test_name": "handles empty list",
                    "passed": false,
                    "error_message": "IndexError"
                }
            ],
            "server_instance": "runner-2"
        })
    }

    #[test]
    fn execution_event_skips_invalid_children() {
        let event: ExecutionEvent = serde_json::from_value(execution_payload()).unwrap();
        let record = event.into_record().unwrap();

        assert_eq!(record.language(), ProgrammingLanguage::Python);
        assert_eq!(record.code_version_id(), Some("v3"));
        assert_eq!(
            record.timestamp(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
        );
        assert_eq!(record.test_outcomes().len(), 1);
        assert_eq!(record.test_outcomes()[0].test_name, "sums a list");
        assert_eq!(record.success_rate(), 50.0);
    }

    #[test]
    fn execution_event_rejects_bad_parent_fields() {
        let mut payload = execution_payload();
        payload["failed_tests"] = json!(0);
        let event: ExecutionEvent = serde_json::from_value(payload).unwrap();
        assert!(matches!(
            event.into_record(),
            Err(DomainError::TestCountMismatch { .. })
        ));

        let mut payload = execution_payload();
        payload["language"] = json!("cobol");
        let event: ExecutionEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(
            event.into_record().unwrap_err(),
            DomainError::InvalidLanguage("cobol".to_string())
        );

        let mut payload = execution_payload();
        payload["student_id"] = json!("");
        let event: ExecutionEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(
            event.into_record().unwrap_err(),
            DomainError::EmptyId("student_id")
        );
    }

    #[test]
    fn registration_event_is_camel_case() {
        let event: RegistrationEvent = serde_json::from_value(json!({
            "userId": "3c4d5e6f-7a8b-4c9d-8e0f-1a2b3c4d5e6f",
            "profileId": "6f5e4d3c-2b1a-4f0e-9d8c-7b6a5f4e3d2c",
            "username": "ada",
            "profileUrl": "https://example.org/ada",
            "occurredOn": [2024, 2, 29, 23, 59, 58, 500000000]
        }))
        .unwrap();

        let record = event.into_record().unwrap();
        assert_eq!(record.username(), "ada");
        assert!(record.has_profile_url());
        let at = record.registered_at();
        assert_eq!((at.year(), at.month(), at.day()), (2024, 2, 29));
        assert_eq!(at.nanosecond(), 500_000_000);
    }

    #[test]
    fn occurred_on_requires_six_valid_components() {
        assert_eq!(
            parse_occurred_on(&[2024, 1, 1, 0, 0, 0]).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(matches!(
            parse_occurred_on(&[2024, 1, 1, 0, 0]),
            Err(DomainError::InvalidOccurredOn(_))
        ));
        // Not normalised into March
        assert!(parse_occurred_on(&[2023, 2, 30, 0, 0, 0]).is_err());
        assert!(parse_occurred_on(&[2024, 1, 1, 24, 0, 0]).is_err());
        assert!(parse_occurred_on(&[2024, -1, 1, 0, 0, 0]).is_err());
        assert!(parse_occurred_on(&[2024, 1, 1, 0, 0, 0, 1_500_000_000]).is_err());
    }
}
