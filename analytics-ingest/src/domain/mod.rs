mod execution;
mod ids;
mod registration;
mod values;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use execution::{ExecutionRecord, NewExecution, TestOutcome};
pub use ids::{ChallengeId, ExecutionId, ProfileId, StudentId, TestId, UserId};
pub use registration::RegistrationRecord;
pub use values::{Email, ExecutionStatus, ProgrammingLanguage, Provider};

/// Why an inbound value or record was refused. Every variant names the
/// offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("{0} cannot be empty")]
    EmptyId(&'static str),
    #[error("invalid {field} format: must be a valid UUID, got {value:?}")]
    InvalidId { field: &'static str, value: String },
    #[error("invalid programming language: {0:?}")]
    InvalidLanguage(String),
    #[error("invalid execution status: {0:?}")]
    InvalidStatus(String),
    #[error("email cannot be empty")]
    EmptyEmail,
    #[error("invalid email format: {0:?}")]
    InvalidEmail(String),
    #[error("provider cannot be empty")]
    EmptyProvider,
    #[error("invalid provider: {0:?}")]
    InvalidProvider(String),
    #[error("execution_time_ms cannot be negative, got {0}")]
    NegativeExecutionTime(i64),
    #[error("{field} cannot be negative, got {value}")]
    NegativeTestCount { field: &'static str, value: i32 },
    #[error("passed_tests ({passed}) + failed_tests ({failed}) must equal total_tests ({total})")]
    TestCountMismatch { total: i32, passed: i32, failed: i32 },
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("registered_at {0} cannot be in the future")]
    RegisteredInFuture(DateTime<Utc>),
    #[error("invalid occurredOn: {0}")]
    InvalidOccurredOn(String),
}
