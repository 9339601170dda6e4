//! Domain-level error taxonomy for Railyard.

use crate::domain::release::ReleaseState;

/// Railyard domain errors.
///
/// Every variant that originates inside a run carries the identifier of the
/// failing node or stage together with the rendered underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum RailyardError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("node '{node}' failed to converge: {cause}")]
    Convergence { node: String, cause: String },

    #[error("release stage {stage} failed: {cause}")]
    Release { stage: ReleaseState, cause: String },

    #[error("external service '{service}' failed: {cause}")]
    ExternalService { service: String, cause: String },

    #[error("run cancelled at {boundary}")]
    Cancelled { boundary: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RailyardError {
    /// The node or stage identifier the error is attributed to, if any.
    pub fn origin(&self) -> Option<String> {
        match self {
            RailyardError::Convergence { node, .. } => Some(node.clone()),
            RailyardError::Release { stage, .. } => Some(stage.to_string()),
            RailyardError::ExternalService { service, .. } => Some(service.clone()),
            RailyardError::Cancelled { boundary } => Some(boundary.clone()),
            _ => None,
        }
    }

    /// True for errors raised before any node ran.
    pub fn is_configuration(&self) -> bool {
        matches!(self, RailyardError::Configuration(_))
    }
}

/// Result type for Railyard domain operations.
pub type Result<T> = std::result::Result<T, RailyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_error_names_node_and_cause() {
        let err = RailyardError::Convergence {
            node: "create-account".to_string(),
            cause: "useradd exited with 9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("create-account"));
        assert!(msg.contains("useradd exited with 9"));
        assert_eq!(err.origin().as_deref(), Some("create-account"));
    }

    #[test]
    fn test_release_error_names_stage() {
        let err = RailyardError::Release {
            stage: ReleaseState::Migrating,
            cause: "rake aborted".to_string(),
        };
        assert!(err.to_string().contains("migrating"));
        assert_eq!(err.origin().as_deref(), Some("migrating"));
    }

    #[test]
    fn test_configuration_error_has_no_origin() {
        let err = RailyardError::Configuration("bad name".to_string());
        assert!(err.is_configuration());
        assert!(err.origin().is_none());
    }
}
