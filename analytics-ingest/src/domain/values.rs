use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgrammingLanguage {
    Cpp,
    Java,
    Python,
    JavaScript,
    Go,
    Rust,
}

impl ProgrammingLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgrammingLanguage::Cpp => "cpp",
            ProgrammingLanguage::Java => "java",
            ProgrammingLanguage::Python => "python",
            ProgrammingLanguage::JavaScript => "javascript",
            ProgrammingLanguage::Go => "go",
            ProgrammingLanguage::Rust => "rust",
        }
    }
}

impl FromStr for ProgrammingLanguage {
    type Err = DomainError;

    // Exact match only, producers send the canonical lowercase names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpp" => Ok(ProgrammingLanguage::Cpp),
            "java" => Ok(ProgrammingLanguage::Java),
            "python" => Ok(ProgrammingLanguage::Python),
            "javascript" => Ok(ProgrammingLanguage::JavaScript),
            "go" => Ok(ProgrammingLanguage::Go),
            "rust" => Ok(ProgrammingLanguage::Rust),
            other => Err(DomainError::InvalidLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for ProgrammingLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn is_successful(&self) -> bool {
        *self == ExecutionStatus::Completed
    }
}

impl FromStr for ExecutionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "error" => Ok(ExecutionStatus::Error),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$")
        .expect("email pattern is a valid regex")
});

/// A trimmed, lowercased e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let normalized = value.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::EmptyEmail);
        }
        if !EMAIL_PATTERN.is_match(&normalized) {
            return Err(DomainError::InvalidEmail(value.to_string()));
        }
        Ok(Email(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default()
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an account was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Facebook,
    Github,
    Twitter,
    Local,
    Apple,
    Microsoft,
}

impl Provider {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err(DomainError::EmptyProvider),
            "google" => Ok(Provider::Google),
            "facebook" => Ok(Provider::Facebook),
            "github" => Ok(Provider::Github),
            "twitter" => Ok(Provider::Twitter),
            "local" => Ok(Provider::Local),
            "apple" => Ok(Provider::Apple),
            "microsoft" => Ok(Provider::Microsoft),
            _ => Err(DomainError::InvalidProvider(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Facebook => "facebook",
            Provider::Github => "github",
            Provider::Twitter => "twitter",
            Provider::Local => "local",
            Provider::Apple => "apple",
            Provider::Microsoft => "microsoft",
        }
    }

    pub fn is_oauth(&self) -> bool {
        *self != Provider::Local
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
