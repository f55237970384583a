use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use tally_core::gateway::{ItemFinish, ItemStart, LogEntry, ReportingGateway, SessionFinish, SessionStart};
use tally_core::ids::SessionId;
use tally_core::ReportError;

/// Wraps a gateway so no call can hang a worker indefinitely.
///
/// An expired call resolves to [`ReportError::Timeout`]; the underlying
/// request future is dropped.
pub struct TimeoutGateway<G: ReportingGateway> {
    inner: G,
    timeout: Duration,
    timeouts: AtomicU64,
}

impl<G: ReportingGateway> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls that hit the deadline so far.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ReportError>>,
    ) -> Result<T, ReportError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "gateway call timed out"
                );
                Err(ReportError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<G: ReportingGateway> ReportingGateway for TimeoutGateway<G> {
    async fn create_session(&self, start: &SessionStart) -> Result<(), ReportError> {
        self.bounded("create_session", self.inner.create_session(start)).await
    }

    async fn finish_session(&self, id: &SessionId, finish: &SessionFinish) -> Result<(), ReportError> {
        self.bounded("finish_session", self.inner.finish_session(id, finish)).await
    }

    async fn create_item(&self, start: &ItemStart) -> Result<String, ReportError> {
        self.bounded("create_item", self.inner.create_item(start)).await
    }

    async fn finish_item(&self, remote_id: &str, finish: &ItemFinish) -> Result<(), ReportError> {
        self.bounded("finish_item", self.inner.finish_item(remote_id, finish)).await
    }

    async fn post_log(&self, entry: &LogEntry) -> Result<(), ReportError> {
        self.bounded("post_log", self.inner.post_log(entry)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use tally_core::TestStatus;

    use crate::mock::{MockGateway, MockResponse};

    fn session_start() -> SessionStart {
        SessionStart {
            id: SessionId::from_raw("launch-1"),
            name: "nightly".into(),
            start_time: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_call_becomes_timeout() {
        let mock = MockGateway::new();
        mock.script_session(MockResponse::Hang);
        let gateway = TimeoutGateway::new(mock, Duration::from_millis(200));

        let err = gateway.create_session(&session_start()).await.unwrap_err();
        assert!(matches!(err, ReportError::Timeout(d) if d == Duration::from_millis(200)));
        assert_eq!(err.kind(), "transport");
        assert_eq!(gateway.timeout_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_call_passes_through() {
        let gateway = TimeoutGateway::new(MockGateway::new(), Duration::from_secs(1));
        gateway.create_session(&session_start()).await.unwrap();

        let finish = SessionFinish {
            end_time: Utc::now(),
            status: TestStatus::Passed,
        };
        gateway
            .finish_session(&SessionId::from_raw("launch-1"), &finish)
            .await
            .unwrap();
        assert_eq!(gateway.timeout_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_errors_are_not_rewritten() {
        let mock = MockGateway::new();
        mock.script_session(MockResponse::Error(ReportError::Transport("reset".into())));
        let gateway = TimeoutGateway::new(mock, Duration::from_secs(1));

        let err = gateway.create_session(&session_start()).await.unwrap_err();
        assert!(matches!(err, ReportError::Transport(_)));
    }
}
