use chrono::{DateTime, Utc};

use super::{ChallengeId, DomainError, ExecutionId, ExecutionStatus, ProgrammingLanguage, StudentId, TestId};

const SLOW_EXECUTION_MS: i64 = 5000;

/// Already-typed fields of an execution, checked together by
/// `ExecutionRecord::new`.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_id: ExecutionId,
    pub challenge_id: ChallengeId,
    pub code_version_id: Option<String>,
    pub student_id: StudentId,
    pub language: ProgrammingLanguage,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub exit_code: i32,
    pub total_tests: i32,
    pub passed_tests: i32,
    pub failed_tests: i32,
    pub success: bool,
    pub server_instance: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub test_id: TestId,
    pub test_name: String,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// One code execution and the outcomes of its tests.
///
/// `passed_tests + failed_tests == total_tests` holds for every value of
/// this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
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
    server_instance: String,
    test_outcomes: Vec<TestOutcome>,
}

impl ExecutionRecord {
    pub fn new(fields: NewExecution) -> Result<Self, DomainError> {
        if fields.execution_time_ms < 0 {
            return Err(DomainError::NegativeExecutionTime(fields.execution_time_ms));
        }
        for (field, value) in [
            ("total_tests", fields.total_tests),
            ("passed_tests", fields.passed_tests),
            ("failed_tests", fields.failed_tests),
        ] {
            if value < 0 {
                return Err(DomainError::NegativeTestCount { field, value });
            }
        }
        if fields.passed_tests.checked_add(fields.failed_tests) != Some(fields.total_tests) {
            return Err(DomainError::TestCountMismatch {
                total: fields.total_tests,
                passed: fields.passed_tests,
                failed: fields.failed_tests,
            });
        }

        Ok(Self {
            execution_id: fields.execution_id,
            challenge_id: fields.challenge_id,
            code_version_id: fields.code_version_id.filter(|v| !v.is_empty()),
            student_id: fields.student_id,
            language: fields.language,
            status: fields.status,
            timestamp: fields.timestamp,
            execution_time_ms: fields.execution_time_ms,
            exit_code: fields.exit_code,
            total_tests: fields.total_tests,
            passed_tests: fields.passed_tests,
            failed_tests: fields.failed_tests,
            success: fields.success,
            server_instance: fields.server_instance,
            test_outcomes: Vec::new(),
        })
    }

    pub fn add_test_outcome(&mut self, outcome: TestOutcome) {
        self.test_outcomes.push(outcome);
    }

    pub fn with_test_outcomes(mut self, outcomes: impl IntoIterator<Item = TestOutcome>) -> Self {
        self.test_outcomes.extend(outcomes);
        self
    }

    /// Percentage of passed tests, 0 when the execution ran none.
    pub fn success_rate(&self) -> f64 {
        if self.total_tests == 0 {
            return 0.0;
        }
        f64::from(self.passed_tests) / f64::from(self.total_tests) * 100.0
    }

    pub fn is_slow(&self) -> bool {
        self.execution_time_ms > SLOW_EXECUTION_MS
    }

    pub fn has_test_failures(&self) -> bool {
        self.failed_tests > 0
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn challenge_id(&self) -> ChallengeId {
        self.challenge_id
    }

    pub fn code_version_id(&self) -> Option<&str> {
        self.code_version_id.as_deref()
    }

    pub fn student_id(&self) -> StudentId {
        self.student_id
    }

    pub fn language(&self) -> ProgrammingLanguage {
        self.language
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn execution_time_ms(&self) -> i64 {
        self.execution_time_ms
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn total_tests(&self) -> i32 {
        self.total_tests
    }

    pub fn passed_tests(&self) -> i32 {
        self.passed_tests
    }

    pub fn failed_tests(&self) -> i32 {
        self.failed_tests
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn server_instance(&self) -> &str {
        &self.server_instance
    }

    pub fn test_outcomes(&self) -> &[TestOutcome] {
        &self.test_outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fields(total: i32, passed: i32, failed: i32) -> NewExecution {
        NewExecution {
            execution_id: Uuid::new_v4().into(),
            challenge_id: Uuid::new_v4().into(),
            code_version_id: Some(String::new()),
            student_id: Uuid::new_v4().into(),
            language: ProgrammingLanguage::Rust,
            status: ExecutionStatus::Completed,
            timestamp: Utc::now(),
            execution_time_ms: 120,
            exit_code: 0,
            total_tests: total,
            passed_tests: passed,
            failed_tests: failed,
            success: true,
            server_instance: "runner-1".to_string(),
        }
    }

    #[test]
    fn success_rate_is_a_percentage_of_passed_tests() {
        let record = ExecutionRecord::new(fields(10, 7, 3)).unwrap();
        assert_eq!(record.success_rate(), 70.0);
        assert!(record.has_test_failures());
        assert!(!record.is_slow());
        // Blank code versions are dropped
        assert_eq!(record.code_version_id(), None);

        let record = ExecutionRecord::new(fields(0, 0, 0)).unwrap();
        assert_eq!(record.success_rate(), 0.0);
        assert!(!record.has_test_failures());
    }

    #[test]
    fn counts_must_add_up() {
        assert_eq!(
            ExecutionRecord::new(fields(10, 7, 2)),
            Err(DomainError::TestCountMismatch {
                total: 10,
                passed: 7,
                failed: 2
            })
        );
        assert_eq!(
            ExecutionRecord::new(fields(-1, 0, -1)),
            Err(DomainError::NegativeTestCount {
                field: "total_tests",
                value: -1
            })
        );
    }

    #[test]
    fn rejects_negative_durations() {
        let mut input = fields(1, 1, 0);
        input.execution_time_ms = -5;
        assert_eq!(
            ExecutionRecord::new(input),
            Err(DomainError::NegativeExecutionTime(-5))
        );
    }

    #[test]
    fn slow_above_five_seconds() {
        let mut input = fields(1, 1, 0);
        input.execution_time_ms = 5000;
        assert!(!ExecutionRecord::new(input.clone()).unwrap().is_slow());
        input.execution_time_ms = 5001;
        assert!(ExecutionRecord::new(input).unwrap().is_slow());
    }

    #[test]
    fn owns_its_test_outcomes() {
        let outcome = TestOutcome {
            test_id: Uuid::new_v4().into(),
            test_name: "handles empty input".to_string(),
            passed: false,
            error_message: Some("expected 0, got 1".to_string()),
        };
        let mut record = ExecutionRecord::new(fields(2, 1, 1))
            .unwrap()
            .with_test_outcomes([outcome.clone()]);
        record.add_test_outcome(TestOutcome {
            passed: true,
            error_message: None,
            ..outcome.clone()
        });
        assert_eq!(record.test_outcomes().len(), 2);
        assert_eq!(record.test_outcomes()[0], outcome);
    }
}
