//! Settings error types.

use tally_core::ReportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

impl From<SettingsError> for ReportError {
    fn from(e: SettingsError) -> Self {
        ReportError::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_display() {
        let err = SettingsError::Missing("endpoint");
        assert_eq!(err.to_string(), "missing required setting: endpoint");
    }

    #[test]
    fn converts_to_fatal_configuration_error() {
        let err: ReportError = SettingsError::InvalidValue("callTimeoutMs must be > 0".into()).into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("callTimeoutMs"));
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(matches!(err, SettingsError::Json(_)));
    }
}
