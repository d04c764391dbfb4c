//! Error types for the update pipeline.
//!
//! [`UpdateError`] is the per-container taxonomy: it is carried inside plan
//! skips and update outcomes, so it is cloneable and serializable. Failures of
//! the engine adapter itself are [`EngineError`]s and get classified into the
//! taxonomy by the component that observed them. [`CycleError`] is the only
//! error that aborts a whole cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-container failure, grouped by the component that raises it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum UpdateError {
    /// Registry could not be reached after all retries.
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// Registry rejected the configured credentials.
    #[error("registry authentication failed: {0}")]
    AuthFailure(String),

    /// Registry does not serve the reference.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// A declared container does not match what the engine reports.
    #[error("scope mismatch: {0}")]
    ScopeMismatch(String),

    #[error("pull failed: {0}")]
    PullFailure(String),

    #[error("stop failed: {0}")]
    StopFailure(String),

    #[error("start failed: {0}")]
    StartFailure(String),

    #[error("health check timed out: {0}")]
    HealthCheckTimeout(String),

    /// The replacement failed and the previous container could not be
    /// restored. The managed service is down.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),
}

impl UpdateError {
    /// Whether this error leaves a managed service down and must be escalated.
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::RollbackFailure(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegistryUnreachable(_) => "RegistryUnreachable",
            Self::AuthFailure(_) => "AuthFailure",
            Self::ReferenceNotFound(_) => "ReferenceNotFound",
            Self::ScopeMismatch(_) => "ScopeMismatch",
            Self::PullFailure(_) => "PullFailure",
            Self::StopFailure(_) => "StopFailure",
            Self::StartFailure(_) => "StartFailure",
            Self::HealthCheckTimeout(_) => "HealthCheckTimeout",
            Self::RollbackFailure(_) => "RollbackFailure",
        }
    }
}

/// Failure reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("engine API error: {0}")]
    Api(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure that aborts a whole cycle. The next cycle runs on schedule.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("control socket unavailable: {0}")]
    Engine(#[from] EngineError),
}

/// Image reference or digest that cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,

    /// The container was created from a bare image id, so there is no tag to
    /// follow.
    #[error("{0} is an image id, not a reference")]
    ImageId(String),

    #[error("invalid digest: {0}")]
    Digest(String),

    #[error("malformed image reference: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rollback_failure_escalates() {
        assert!(UpdateError::RollbackFailure("web".into()).is_escalation());
        assert!(!UpdateError::StartFailure("web".into()).is_escalation());
        assert!(!UpdateError::RegistryUnreachable("web".into()).is_escalation());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(UpdateError::PullFailure("timeout".into())).unwrap();
        assert_eq!(json["kind"], "PullFailure");
        assert_eq!(json["detail"], "timeout");
    }
}
