use chrono::{DateTime, Utc};

use super::{DomainError, ProfileId, UserId};

/// A user joining the community. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    user_id: UserId,
    profile_id: ProfileId,
    username: String,
    profile_url: Option<String>,
    registered_at: DateTime<Utc>,
}

impl RegistrationRecord {
    pub fn new(
        user_id: UserId,
        profile_id: ProfileId,
        username: String,
        profile_url: Option<String>,
        registered_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        Self::new_at(
            user_id,
            profile_id,
            username,
            profile_url,
            registered_at,
            Utc::now(),
        )
    }

    /// Validates against `now` instead of the wall clock.
    pub fn new_at(
        user_id: UserId,
        profile_id: ProfileId,
        username: String,
        profile_url: Option<String>,
        registered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if username.is_empty() {
            return Err(DomainError::EmptyUsername);
        }
        if registered_at > now {
            return Err(DomainError::RegisteredInFuture(registered_at));
        }

        Ok(Self {
            user_id,
            profile_id,
            username,
            profile_url,
            registered_at,
        })
    }

    pub fn has_profile_url(&self) -> bool {
        self.profile_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn profile_url(&self) -> Option<&str> {
        self.profile_url.as_deref()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}
