//! Log lines tagged with the correlation id of the operation they concern.
//!
//! Every reporting operation (session create, item create/finish, log post)
//! carries a [`CorrelationId`]. Grepping a run's output for one id gives the
//! full timeline of that operation even when hundreds run concurrently.
//! Timestamps are stamped by the subscriber installed in `init_telemetry`.

use std::fmt::Display;

use tally_core::ids::CorrelationId;
use tally_core::ReportError;
use tracing::{Level, Span};

/// Stateless logger; cheap to copy into every spawned task.
#[derive(Clone, Copy, Debug)]
pub struct CorrelatedLogger {
    component: &'static str,
}

impl CorrelatedLogger {
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn log(&self, level: Level, correlation: &CorrelationId, message: impl Display) {
        let component = self.component;
        match level {
            Level::ERROR => tracing::error!(correlation_id = %correlation, component, "{message}"),
            Level::WARN => tracing::warn!(correlation_id = %correlation, component, "{message}"),
            Level::INFO => tracing::info!(correlation_id = %correlation, component, "{message}"),
            Level::DEBUG => tracing::debug!(correlation_id = %correlation, component, "{message}"),
            Level::TRACE => tracing::trace!(correlation_id = %correlation, component, "{message}"),
        }
    }

    pub fn debug(&self, correlation: &CorrelationId, message: impl Display) {
        self.log(Level::DEBUG, correlation, message);
    }

    pub fn info(&self, correlation: &CorrelationId, message: impl Display) {
        self.log(Level::INFO, correlation, message);
    }

    pub fn warn(&self, correlation: &CorrelationId, message: impl Display) {
        self.log(Level::WARN, correlation, message);
    }

    pub fn error(&self, correlation: &CorrelationId, message: impl Display) {
        self.log(Level::ERROR, correlation, message);
    }

    /// Report a failed operation at error level with its taxonomy kind.
    pub fn failure(&self, correlation: &CorrelationId, err: &ReportError, message: impl Display) {
        tracing::error!(
            correlation_id = %correlation,
            component = self.component,
            error_kind = err.kind(),
            error = %err,
            "{message}"
        );
    }

    /// Span for instrumenting a spawned task; events inside it inherit the id.
    pub fn span(&self, correlation: &CorrelationId, operation: &'static str) -> Span {
        tracing::info_span!(
            "report_op",
            correlation_id = %correlation,
            component = self.component,
            operation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Debug, Clone)]
    struct Captured {
        level: Level,
        fields: HashMap<String, String>,
    }

    #[derive(Clone, Default)]
    struct CaptureLayer {
        events: Arc<Mutex<Vec<Captured>>>,
    }

    struct MapVisitor<'a>(&'a mut HashMap<String, String>);

    impl Visit for MapVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = HashMap::new();
            event.record(&mut MapVisitor(&mut fields));
            self.events.lock().push(Captured {
                level: *event.metadata().level(),
                fields,
            });
        }
    }

    fn capture<F: FnOnce()>(f: F) -> Vec<Captured> {
        let layer = CaptureLayer::default();
        let events = layer.events.clone();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
        let captured = events.lock().clone();
        captured
    }

    #[test]
    fn events_carry_correlation_id_and_component() {
        let logger = CorrelatedLogger::new("registry");
        let corr = CorrelationId::from_raw("corr_fixed");
        let events = capture(|| logger.warn(&corr, "active operations above threshold"));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert_eq!(events[0].fields["correlation_id"], "corr_fixed");
        assert_eq!(events[0].fields["component"], "registry");
        assert_eq!(events[0].fields["message"], "active operations above threshold");
    }

    #[test]
    fn failure_records_error_kind() {
        let logger = CorrelatedLogger::new("orchestrator");
        let corr = CorrelationId::new();
        let err = ReportError::NotFound("item-3".into());
        let events = capture(|| logger.failure(&corr, &err, "finish item failed"));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::ERROR);
        assert_eq!(events[0].fields["error_kind"], "not_found");
        assert!(events[0].fields["error"].contains("item-3"));
    }

    #[test]
    fn levels_map_through() {
        let logger = CorrelatedLogger::new("test");
        let corr = CorrelationId::new();
        let events = capture(|| {
            logger.error(&corr, "e");
            logger.info(&corr, "i");
            logger.debug(&corr, "d");
        });
        let levels: Vec<Level> = events.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![Level::ERROR, Level::INFO, Level::DEBUG]);
    }
}
