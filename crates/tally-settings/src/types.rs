//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section implements
//! [`Default`] and is `#[serde(default)]`, so partial files are fine.

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings.
///
/// ```json
/// {
///   "endpoint": "https://reports.example.com",
///   "project": "mobile",
///   "apiToken": "…",
///   "session": { "name": "nightly", "id": "shared-launch-uuid" },
///   "limits": { "callTimeoutMs": 5000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    /// When false, events are accepted and logged but nothing is sent.
    pub enabled: bool,
    pub endpoint: String,
    pub project: String,
    /// Never written back out.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub session: SessionSettings,
    pub limits: LimitSettings,
    pub logging: LoggingSettings,
}

impl Default for TallySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            project: String::new(),
            api_token: None,
            session: SessionSettings::default(),
            limits: LimitSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub name: String,
    /// Externally supplied session id; lets several processes share one
    /// remote session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "tally".to_string(),
            id: None,
            attributes: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Advisory: a warning is logged once this many operations are in flight.
    pub max_recommended_concurrency: usize,
    pub call_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    /// How long finalization waits for in-flight finish calls.
    pub drain_timeout_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_recommended_concurrency: 10,
            call_timeout_ms: 10_000,
            ready_timeout_ms: 10_000,
            ready_poll_interval_ms: 25,
            drain_timeout_ms: 30_000,
        }
    }
}

impl LimitSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist warn+ lines to SQLite for post-run inspection.
    pub persist_warnings: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            persist_warnings: false,
        }
    }
}

/// Bearer token for the tracking service. Redacted in Debug.
#[derive(Clone)]
pub struct ApiToken(pub SecretString);

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken([REDACTED])")
    }
}

/// Where to send reports. Only present when reporting is enabled.
#[derive(Clone, Debug)]
pub struct Connection {
    pub endpoint: String,
    pub project: String,
    pub token: ApiToken,
}

/// Settings that passed validation.
#[derive(Clone, Debug)]
pub struct ValidatedSettings {
    pub connection: Option<Connection>,
    pub session: SessionSettings,
    pub limits: LimitSettings,
    pub logging: LoggingSettings,
}

impl TallySettings {
    /// Check required fields and ranges.
    pub fn validate(self) -> Result<ValidatedSettings> {
        let limits = self.limits;
        for (name, value) in [
            ("callTimeoutMs", limits.call_timeout_ms),
            ("readyTimeoutMs", limits.ready_timeout_ms),
            ("readyPollIntervalMs", limits.ready_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be > 0")));
            }
        }
        if limits.ready_poll_interval_ms > limits.ready_timeout_ms {
            return Err(SettingsError::InvalidValue(
                "readyPollIntervalMs must not exceed readyTimeoutMs".into(),
            ));
        }
        if self.session.id.as_deref().is_some_and(str::is_empty) {
            return Err(SettingsError::InvalidValue("session.id must not be empty".into()));
        }

        let connection = if self.enabled {
            if self.endpoint.trim().is_empty() {
                return Err(SettingsError::Missing("endpoint"));
            }
            if self.project.trim().is_empty() {
                return Err(SettingsError::Missing("project"));
            }
            let token = self
                .api_token
                .filter(|t| !t.is_empty())
                .ok_or(SettingsError::Missing("apiToken"))?;
            Some(Connection {
                endpoint: self.endpoint.trim_end_matches('/').to_string(),
                project: self.project,
                token: ApiToken(SecretString::from(token)),
            })
        } else {
            None
        };

        Ok(ValidatedSettings {
            connection,
            session: self.session,
            limits,
            logging: self.logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn enabled() -> TallySettings {
        TallySettings {
            endpoint: "https://reports.example.com/".into(),
            project: "mobile".into(),
            api_token: Some("tok-123".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let s = TallySettings::default();
        assert!(s.enabled);
        assert_eq!(s.limits.max_recommended_concurrency, 10);
        assert_eq!(s.limits.call_timeout(), Duration::from_secs(10));
        assert_eq!(s.limits.ready_poll_interval(), Duration::from_millis(25));
        assert_eq!(s.session.name, "tally");
    }

    #[test]
    fn enabled_requires_endpoint_project_and_token() {
        let mut s = enabled();
        s.endpoint.clear();
        assert!(matches!(s.validate(), Err(SettingsError::Missing("endpoint"))));

        let mut s = enabled();
        s.api_token = None;
        assert!(matches!(s.validate(), Err(SettingsError::Missing("apiToken"))));
    }

    #[test]
    fn disabled_needs_no_connection() {
        let s = TallySettings {
            enabled: false,
            ..Default::default()
        };
        let v = s.validate().unwrap();
        assert!(v.connection.is_none());
    }

    #[test]
    fn validate_trims_endpoint_and_wraps_token() {
        let v = enabled().validate().unwrap();
        let conn = v.connection.unwrap();
        assert_eq!(conn.endpoint, "https://reports.example.com");
        assert_eq!(conn.token.0.expose_secret(), "tok-123");
        assert_eq!(format!("{:?}", conn.token), "ApiToken([REDACTED])");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut s = enabled();
        s.limits.call_timeout_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn token_is_not_serialized() {
        let json = serde_json::to_string(&enabled()).unwrap();
        assert!(!json.contains("tok-123"));
        assert!(json.contains("\"maxRecommendedConcurrency\":10"));
    }
}
