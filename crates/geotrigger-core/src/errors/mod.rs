//! Engine error taxonomy.
//!
//! Four families, surfaced differently:
//! - `ValidationError`: rejected before any network call, never retried.
//! - `AuthorizationError`: per-item; in batch mode excludes only that item.
//! - `SubmissionError`: per-item; the match event stays Pending and the
//!   execution may be retried safely.
//! - Reconciliation failures are not user-facing: they land in the durable
//!   outbox and are retried by the reconciliation pass.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Rule {rule_id} is inactive")]
    RuleInactive { rule_id: i64 },

    #[error("Rule {rule_id} not found")]
    RuleNotFound { rule_id: i64 },

    #[error("No pending match event with key {key}")]
    EventNotFound { key: String },

    #[error("Rule {rule_id} is missing required field: {field}")]
    MissingField { rule_id: i64, field: String },

    #[error("Quorum minimum {minimum} inconsistent with required set of {set_size}")]
    QuorumMinimumInconsistent { minimum: u32, set_size: usize },

    #[error("Quorum policy has a non-empty required set but no minimum wallet count")]
    QuorumMinimumMissing,

    #[error("Malformed event identity: {reason}")]
    MalformedEventKey { reason: String },

    #[error("Invalid signed payload: {reason}")]
    PayloadInvalid { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("No credential registered on-chain for {identity}; re-register the credential and retry")]
    NoRegisteredCredential { identity: String },

    #[error("Proof request denied by user for credential {credential_id}")]
    Denied { credential_id: String },

    #[error("Proof request timed out for credential {credential_id}")]
    Timeout { credential_id: String },

    #[error("Proof request cancelled")]
    Cancelled,

    #[error("Secret key required for write function '{function}' but none was provided")]
    SecretKeyRequired { function: String },

    #[error("Secret key does not match identity {identity}")]
    SecretKeyMismatch { identity: String },

    #[error("Credential auto-registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error("Proof covers a different payload than the one to be submitted")]
    ProofPayloadMismatch,
}

#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    #[error("Execution service rejected the call: {message}")]
    Rejected { message: String },

    #[error("Network error calling execution service: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Malformed event identity: {reason}")]
    MalformedKey { reason: String },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Combined error surfaced by `execute` / batch items.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution held: {0}")]
    Held(#[from] crate::gate::HoldReason),
}

impl EngineError {
    /// True when re-invoking execution for the same event is safe.
    /// Submission failures persist nothing as completed.
    pub fn retry_safe(&self) -> bool {
        matches!(self, EngineError::Submission(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_errors_are_retry_safe() {
        let e = EngineError::from(SubmissionError::Network("connection reset".into()));
        assert!(e.retry_safe());
        let e = EngineError::from(AuthorizationError::Cancelled);
        assert!(!e.retry_safe());
    }

    #[test]
    fn authorization_error_names_remediation() {
        let e = AuthorizationError::NoRegisteredCredential {
            identity: "W1".to_string(),
        };
        assert!(e.to_string().contains("re-register"));
    }
}
