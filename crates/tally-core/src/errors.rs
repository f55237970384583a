use std::time::Duration;

/// Error taxonomy for reporting operations.
///
/// Only `Configuration` is fatal, and only at startup. Everything else is
/// logged against the affected item and never reaches the host test run.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReportError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    // Expected; session create downgrades it to success
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {waited:?} waiting for remote id of {key}")]
    RegistryTimeout { key: String, waited: Duration },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ReportError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) | Self::Timeout(_) => "transport",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::RegistryTimeout { .. } => "registry_timeout",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Classify a non-success HTTP status from the tracking service.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 => Self::NotFound(body),
            409 => Self::Conflict(body),
            _ => Self::Transport(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_counts_as_transport() {
        assert_eq!(ReportError::Timeout(Duration::from_secs(10)).kind(), "transport");
        assert_eq!(ReportError::Transport("reset".into()).kind(), "transport");
    }

    #[test]
    fn only_configuration_is_fatal() {
        assert!(ReportError::Configuration("missing endpoint".into()).is_fatal());
        assert!(!ReportError::Conflict("exists".into()).is_fatal());
        assert!(!ReportError::RegistryTimeout {
            key: "g".into(),
            waited: Duration::from_millis(5),
        }
        .is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(ReportError::from_status(409, "dup".into()).is_conflict());
        assert!(matches!(ReportError::from_status(404, "gone".into()), ReportError::NotFound(_)));
        assert!(matches!(ReportError::from_status(500, "boom".into()), ReportError::Transport(_)));
        assert!(matches!(ReportError::from_status(401, "auth".into()), ReportError::Transport(_)));
    }

    #[test]
    fn registry_timeout_display_names_key() {
        let err = ReportError::RegistryTimeout {
            key: "SuiteA".into(),
            waited: Duration::from_millis(200),
        };
        assert!(err.to_string().contains("SuiteA"));
        assert_eq!(err.kind(), "registry_timeout");
    }
}
