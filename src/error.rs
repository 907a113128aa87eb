//! Error types for the compliance appliance.

use thiserror::Error;

/// Result type for appliance operations
pub type Result<T> = std::result::Result<T, ApplianceError>;

/// Errors that can occur across the appliance subsystems
#[derive(Error, Debug)]
pub enum ApplianceError {
    /// Transient remote failure (network, 5xx, timeout) - retryable
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    /// Authentication rejected by a remote (401/403) - not retryable this cycle
    #[error("Remote authentication error: {0}")]
    AuthRemote(String),

    /// Permanent remote rejection (400, malformed request)
    #[error("Permanent remote error: {0}")]
    PermanentRemote(String),

    /// A safety guardrail refused the requested action
    #[error("Policy refusal: {0}")]
    PolicyRefusal(String),

    /// LLM budget or rate limit exhausted
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Local database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Local filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Evidence signing failure
    #[error("Signing error: {0}")]
    Signing(String),

    /// Rule load/validation error
    #[error("Rule error: {0}")]
    Rule(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Order with an unrecognized type or malformed parameters
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Generic error
    #[error("Appliance error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ApplianceError {
    /// Whether the failed operation should be retried (with backoff / queue).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplianceError::TransientRemote(_))
    }
}

impl From<reqwest::Error> for ApplianceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return ApplianceError::AuthRemote(e.to_string());
            }
            if status.is_client_error() {
                return ApplianceError::PermanentRemote(e.to_string());
            }
        }
        ApplianceError::TransientRemote(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ApplianceError::TransientRemote("timeout".into()).is_retryable());
        assert!(!ApplianceError::AuthRemote("401".into()).is_retryable());
        assert!(!ApplianceError::PolicyRefusal("blocked".into()).is_retryable());
    }
}
