use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::DomainError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $field:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, DomainError> {
                if value.is_empty() {
                    return Err(DomainError::EmptyId($field));
                }
                Uuid::parse_str(value)
                    .map($name)
                    .map_err(|_| DomainError::InvalidId {
                        field: $field,
                        value: value.to_string(),
                    })
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                $name(value)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}

uuid_id!(
    /// Natural key of an execution record.
    ExecutionId,
    "execution_id"
);
uuid_id!(ChallengeId, "challenge_id");
uuid_id!(StudentId, "student_id");
uuid_id!(TestId, "test_id");
uuid_id!(
    /// Natural key of a registration record.
    UserId,
    "user_id"
);
uuid_id!(ProfileId, "profile_id");
