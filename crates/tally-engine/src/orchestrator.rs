//! Reporter: turns lifecycle events into gateway calls.
//!
//! Event handlers never block the caller. Each one does its bookkeeping
//! inline (so events for one key keep their order) and spawns the remote work
//! onto a task tracker. Reporting failures are logged with the affected
//! item's correlation id and never surface to the event source.
//!
//! Cases are registered under their correlation id, not their event key. The
//! event key only maps to the case while it is open; a finish detaches it, so
//! the finish task owns that context and a later start may reuse the key.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use tally_core::context::{CaseContext, GroupContext, ItemPhase, Tracked};
use tally_core::events::LifecycleEvent;
use tally_core::gateway::{
    Attachment, ItemFinish, ItemKind, ItemStart, LogEntry, LogLevel, ReportingGateway, SessionFinish, SessionStart,
};
use tally_core::ids::{CorrelationId, SessionId};
use tally_core::status::{merge_all, merge_optional};
use tally_core::{ReportError, TestStatus};
use tally_telemetry::CorrelatedLogger;

use crate::coordinator::SessionCoordinator;
use crate::registry::OperationRegistry;
use crate::timeout::TimeoutGateway;

const LOG: CorrelatedLogger = CorrelatedLogger::new("reporter");

/// Resolved runtime options for a [`Reporter`].
#[derive(Clone, Debug)]
pub struct ReporterOptions {
    pub session_name: String,
    /// Shared-launch mode: report into a session another process may own.
    pub session_id: Option<SessionId>,
    pub session_attributes: BTreeMap<String, String>,
    /// Advisory. One warning is logged when in-flight operations exceed it.
    pub max_recommended_concurrency: usize,
    pub call_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            session_name: "tally".to_string(),
            session_id: None,
            session_attributes: BTreeMap::new(),
            max_recommended_concurrency: 10,
            call_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(25),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct ReportStats {
    items_created: AtomicU64,
    items_finished: AtomicU64,
    gateway_failures: AtomicU64,
    registry_timeouts: AtomicU64,
    sessions_finalized: AtomicU64,
    logs_posted: AtomicU64,
}

impl ReportStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_created: self.items_created.load(Ordering::Relaxed),
            items_finished: self.items_finished.load(Ordering::Relaxed),
            gateway_failures: self.gateway_failures.load(Ordering::Relaxed),
            registry_timeouts: self.registry_timeouts.load(Ordering::Relaxed),
            sessions_finalized: self.sessions_finalized.load(Ordering::Relaxed),
            logs_posted: self.logs_posted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the reporter counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub items_created: u64,
    pub items_finished: u64,
    pub gateway_failures: u64,
    pub registry_timeouts: u64,
    pub sessions_finalized: u64,
    pub logs_posted: u64,
}

struct Inner {
    gateway: TimeoutGateway<Arc<dyn ReportingGateway>>,
    coordinator: SessionCoordinator,
    groups: OperationRegistry<GroupContext>,
    cases: OperationRegistry<CaseContext>,
    /// Event key of each open case to its registry slot.
    open_cases: DashMap<String, String>,
    options: ReporterOptions,
    stats: ReportStats,
    peak_operations: AtomicUsize,
    concurrency_warned: AtomicBool,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
    tasks: TaskTracker,
    runtime: Handle,
}

impl Reporter {
    /// Must be called from within a tokio runtime; background work is
    /// spawned onto it.
    pub fn new(gateway: Arc<dyn ReportingGateway>, options: ReporterOptions) -> Result<Self, ReportError> {
        let runtime = Handle::try_current()
            .map_err(|e| ReportError::Configuration(format!("reporter needs a tokio runtime: {e}")))?;
        let inner = Inner {
            gateway: TimeoutGateway::new(gateway, options.call_timeout),
            coordinator: SessionCoordinator::new(options.session_id.clone()),
            groups: OperationRegistry::with_poll_interval(options.ready_poll_interval),
            cases: OperationRegistry::with_poll_interval(options.ready_poll_interval),
            open_cases: DashMap::new(),
            options,
            stats: ReportStats::default(),
            peak_operations: AtomicUsize::new(0),
            concurrency_warned: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
            tasks: TaskTracker::new(),
            runtime,
        })
    }

    pub fn dispatch(&self, event: LifecycleEvent) {
        debug!(event_type = event.event_type(), "dispatching lifecycle event");
        match event {
            LifecycleEvent::BundleStart { bundle } => self.on_bundle_start(&bundle),
            LifecycleEvent::BundleFinish { bundle } => self.on_bundle_finish(&bundle),
            LifecycleEvent::GroupStart { key, name, parent_key } => {
                self.on_group_start(&key, &name, parent_key.as_deref());
            }
            LifecycleEvent::GroupFinish { key, result } => self.on_group_finish(&key, result),
            LifecycleEvent::CaseStart {
                key,
                name,
                group_key,
                metadata,
            } => self.on_case_start(&key, &name, &group_key, metadata),
            LifecycleEvent::CaseFinish { key, result, messages } => self.on_case_finish(&key, result, messages),
        }
    }

    pub fn on_bundle_start(&self, bundle: &str) {
        let coordinator = &self.inner.coordinator;
        let active_bundles = coordinator.increment_bundle_count();
        info!(bundle, active_bundles, "bundle started");
        if coordinator.is_ready() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let correlation = coordinator.correlation_id().clone();
        self.spawn(&correlation, "ensure_session", async move {
            inner.ensure_session().await;
        });
    }

    pub fn on_group_start(&self, key: &str, name: &str, parent_key: Option<&str>) {
        let group = GroupContext::new(name, parent_key.map(str::to_string));
        let correlation = group.correlation_id.clone();
        if !self.inner.groups.register(key, group) {
            LOG.warn(&correlation, format_args!("group {key} already in flight, ignoring duplicate start"));
            return;
        }
        self.inner.observe_concurrency();

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.spawn(&correlation, "create_group", async move {
            inner.create_group(&key).await;
        });
    }

    pub fn on_case_start(&self, key: &str, name: &str, group_key: &str, metadata: BTreeMap<String, String>) {
        let case = CaseContext::new(name, group_key, metadata);
        let correlation = case.correlation_id.clone();
        let slot = correlation.to_string();
        match self.inner.open_cases.entry(key.to_string()) {
            Entry::Occupied(_) => {
                LOG.warn(&correlation, format_args!("case {key} already in flight, ignoring duplicate start"));
                return;
            }
            Entry::Vacant(open) => {
                self.inner.cases.register(slot.clone(), case);
                open.insert(slot.clone());
            }
        }
        self.inner.observe_concurrency();

        let inner = Arc::clone(&self.inner);
        self.spawn(&correlation, "create_case", async move {
            inner.create_case(&slot).await;
        });
    }

    /// Record a case result. `messages` are posted as error logs before the
    /// remote item is finished.
    ///
    /// Only the first finish after a start is reported; a repeat finish for
    /// the same key only feeds the session status.
    pub fn on_case_finish(&self, key: &str, result: TestStatus, messages: Vec<String>) {
        let inner = &self.inner;
        inner.coordinator.update_status(result);

        let Some((_, slot)) = inner.open_cases.remove(key) else {
            warn!(case = key, status = %result, "finish for unknown or already finished case, status kept for the session only");
            return;
        };
        let Some(case) = inner.cases.get(&slot) else {
            return;
        };
        inner.cases.modify(&slot, |c| c.status = Some(merge_optional(c.status, result)));
        inner
            .groups
            .modify(&case.parent_group_key, |g| g.status = Some(merge_optional(g.status, result)));

        let inner = Arc::clone(&self.inner);
        self.spawn(&case.correlation_id, "finish_case", async move {
            inner.finish_case(&slot, result, messages).await;
        });
    }

    /// Close a group with the worst of its children's results and `hint`.
    pub fn on_group_finish(&self, key: &str, hint: Option<TestStatus>) {
        let inner = &self.inner;
        let Some(group) = inner.groups.get(key) else {
            if let Some(status) = hint {
                inner.coordinator.update_status(status);
            }
            warn!(group = key, "finish for unknown group");
            return;
        };

        let status = merge_all(group.status.into_iter().chain(hint)).unwrap_or_default();
        inner.groups.modify(key, |g| g.status = Some(status));
        if let Some(parent) = &group.parent_key {
            inner.groups.modify(parent, |p| p.status = Some(merge_optional(p.status, status)));
        }
        inner.coordinator.update_status(status);

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.spawn(&group.correlation_id, "finish_group", async move {
            inner.finish_group(&key, status).await;
        });
    }

    pub fn on_bundle_finish(&self, bundle: &str) {
        let coordinator = &self.inner.coordinator;
        if !coordinator.decrement_bundle_count() {
            debug!(bundle, remaining = coordinator.bundle_count(), "bundle finished");
            return;
        }
        if !coordinator.try_begin_finalize() {
            debug!(bundle, "finalize already claimed");
            return;
        }
        info!(bundle, "last bundle finished, finalizing session");
        let inner = Arc::clone(&self.inner);
        let correlation = coordinator.correlation_id().clone();
        self.spawn(&correlation, "finalize_session", async move {
            inner.finalize().await;
        });
    }

    /// Attach a log line to a case once its remote item exists.
    pub fn log_to_case(&self, key: &str, message: impl Into<String>, level: LogLevel, attachments: Vec<Attachment>) {
        let case = self
            .inner
            .open_cases
            .get(key)
            .map(|slot| slot.value().clone())
            .and_then(|slot| self.inner.cases.get(&slot).map(|case| (slot, case)));
        let Some((slot, case)) = case else {
            warn!(case = key, "log for unknown case dropped");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let message = message.into();
        let correlation = case.correlation_id.clone();
        self.spawn(&case.correlation_id, "post_log", async move {
            let timeout = inner.settle_timeout();
            match inner.cases.wait_until_ready(&slot, timeout).await {
                Ok(ready) => {
                    if let Some(remote_id) = ready.remote_id {
                        inner
                            .post_log(&correlation, remote_id, message, level, attachments)
                            .await;
                    }
                }
                Err(e) => {
                    ReportStats::bump(&inner.stats.registry_timeouts);
                    LOG.failure(&correlation, &e, "log dropped, case never became ready");
                }
            }
        });
    }

    /// Wait for every spawned operation to complete.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.inner.coordinator
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.coordinator.get_or_create_id()
    }

    /// Groups and cases currently registered.
    pub fn active_operations(&self) -> usize {
        self.inner.active_operations()
    }

    pub fn peak_operations(&self) -> usize {
        self.inner.peak_operations.load(Ordering::SeqCst)
    }

    fn spawn<F>(&self, correlation: &CorrelationId, operation: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = LOG.span(correlation, operation);
        self.tasks.spawn_on(task.instrument(span), &self.runtime);
    }
}

impl Inner {
    fn settle_timeout(&self) -> Duration {
        self.options.ready_timeout + self.options.call_timeout
    }

    fn active_operations(&self) -> usize {
        self.groups.active_count() + self.cases.active_count()
    }

    fn observe_concurrency(&self) {
        let active = self.active_operations();
        self.peak_operations.fetch_max(active, Ordering::SeqCst);
        let threshold = self.options.max_recommended_concurrency;
        if active > threshold && !self.concurrency_warned.swap(true, Ordering::SeqCst) {
            warn!(
                active,
                threshold, "in-flight reporting operations exceed the recommended maximum"
            );
        }
    }

    /// True once the remote session exists.
    async fn ensure_session(self: &Arc<Self>) -> bool {
        if self.coordinator.is_ready() {
            return true;
        }
        let start = SessionStart {
            id: self.coordinator.get_or_create_id(),
            name: self.options.session_name.clone(),
            start_time: Utc::now(),
            attributes: self.options.session_attributes.clone(),
        };
        let inner = Arc::clone(self);
        self.coordinator
            .ensure_session_started(move || async move {
                inner.gateway.create_session(&start).await.inspect_err(|e| {
                    if !e.is_conflict() {
                        ReportStats::bump(&inner.stats.gateway_failures);
                    }
                })
            })
            .await
            .is_ok()
    }

    /// Wait for a group to settle. Returns its remote id, or `None` when it
    /// failed to start or never became ready in time.
    async fn wait_for_group(&self, key: &str, waiter: &CorrelationId) -> Option<String> {
        let settled = |g: &GroupContext| g.is_ready() || g.phase == ItemPhase::StartFailed;
        match self.groups.wait_until(key, self.options.ready_timeout, settled).await {
            Ok(group) if group.phase == ItemPhase::StartFailed => {
                LOG.warn(waiter, format_args!("parent group {key} failed to start"));
                None
            }
            Ok(group) => group.remote_id,
            Err(e) => {
                ReportStats::bump(&self.stats.registry_timeouts);
                LOG.failure(waiter, &e, format_args!("parent group {key} not ready"));
                None
            }
        }
    }

    async fn create_group(self: &Arc<Self>, key: &str) {
        let Some(group) = self.groups.get(key) else {
            return;
        };
        let correlation = group.correlation_id.clone();
        self.groups.modify(key, |g| g.phase = ItemPhase::CreatePending);

        if !self.ensure_session().await {
            LOG.warn(&correlation, format_args!("session not ready, group {} not reported", group.name));
            self.groups.modify(key, |g| g.phase = ItemPhase::StartFailed);
            return;
        }

        let parent_remote_id = match &group.parent_key {
            None => None,
            Some(parent) => match self.wait_for_group(parent, &correlation).await {
                Some(remote_id) => Some(remote_id),
                None => {
                    self.groups.modify(key, |g| g.phase = ItemPhase::StartFailed);
                    return;
                }
            },
        };

        let request = ItemStart {
            session_id: self.coordinator.get_or_create_id(),
            parent_remote_id: parent_remote_id.clone(),
            name: group.name.clone(),
            kind: if group.is_root() { ItemKind::Suite } else { ItemKind::Test },
            start_time: group.start_time,
            attributes: BTreeMap::new(),
        };
        match self.gateway.create_item(&request).await {
            Ok(remote_id) => {
                ReportStats::bump(&self.stats.items_created);
                let recorded = self.groups.modify(key, |g| {
                    g.remote_id = Some(remote_id.clone());
                    g.parent_remote_id = parent_remote_id;
                    g.phase = ItemPhase::Ready;
                });
                if !recorded {
                    LOG.warn(&correlation, format_args!("group {key} finished before {remote_id} was created, left open"));
                    return;
                }
                if let Some(parent) = &group.parent_key {
                    self.groups.modify(parent, |p| p.child_remote_ids.push(remote_id.clone()));
                }
                LOG.debug(&correlation, format_args!("group {} created as {remote_id}", group.name));
            }
            Err(e) => {
                ReportStats::bump(&self.stats.gateway_failures);
                LOG.failure(&correlation, &e, format_args!("create group {} failed", group.name));
                self.groups.modify(key, |g| g.phase = ItemPhase::StartFailed);
            }
        }
    }

    async fn create_case(&self, slot: &str) {
        let Some(case) = self.cases.get(slot) else {
            return;
        };
        let correlation = case.correlation_id.clone();
        self.cases.modify(slot, |c| c.phase = ItemPhase::CreatePending);

        let Some(parent_remote_id) = self.wait_for_group(&case.parent_group_key, &correlation).await else {
            LOG.warn(&correlation, format_args!("case {} not reported", case.name));
            self.cases.modify(slot, |c| c.phase = ItemPhase::StartFailed);
            return;
        };

        let request = ItemStart {
            session_id: self.coordinator.get_or_create_id(),
            parent_remote_id: Some(parent_remote_id),
            name: case.name.clone(),
            kind: ItemKind::Step,
            start_time: case.start_time,
            attributes: case.metadata.clone(),
        };
        match self.gateway.create_item(&request).await {
            Ok(remote_id) => {
                ReportStats::bump(&self.stats.items_created);
                let recorded = self.cases.modify(slot, |c| {
                    c.remote_id = Some(remote_id.clone());
                    c.phase = ItemPhase::Ready;
                });
                if !recorded {
                    LOG.warn(&correlation, format_args!("case {} finished before {remote_id} was created, left open", case.name));
                    return;
                }
                self.groups
                    .modify(&case.parent_group_key, |g| g.child_remote_ids.push(remote_id.clone()));
                LOG.debug(&correlation, format_args!("case {} created as {remote_id}", case.name));
            }
            Err(e) => {
                ReportStats::bump(&self.stats.gateway_failures);
                LOG.failure(&correlation, &e, format_args!("create case {} failed", case.name));
                self.cases.modify(slot, |c| c.phase = ItemPhase::StartFailed);
            }
        }
    }

    async fn finish_case(&self, slot: &str, status: TestStatus, messages: Vec<String>) {
        let settled = |c: &CaseContext| c.is_ready() || c.phase == ItemPhase::StartFailed;
        let case = match self.cases.wait_until(slot, self.settle_timeout(), settled).await {
            Ok(case) => case,
            Err(e) => {
                ReportStats::bump(&self.stats.registry_timeouts);
                if let Some(case) = self.cases.unregister(slot) {
                    LOG.failure(&case.correlation_id, &e, "case never created, finish dropped");
                }
                return;
            }
        };
        let correlation = case.correlation_id.clone();
        let Some(remote_id) = case.remote_id.filter(|_| case.phase != ItemPhase::StartFailed) else {
            LOG.debug(&correlation, format_args!("case {} was not reported, dropping finish", case.name));
            self.cases.unregister(slot);
            return;
        };
        self.cases.modify(slot, |c| c.phase = ItemPhase::Finishing);

        for message in messages {
            self.post_log(&correlation, remote_id.clone(), message, LogLevel::Error, Vec::new())
                .await;
        }

        let finish = ItemFinish {
            session_id: self.coordinator.get_or_create_id(),
            end_time: Utc::now(),
            status: case.status.unwrap_or(status),
        };
        self.finish_item(&correlation, &remote_id, &finish).await;
        self.cases.unregister(slot);
    }

    async fn finish_group(&self, key: &str, status: TestStatus) {
        let settled = |g: &GroupContext| g.is_ready() || g.phase == ItemPhase::StartFailed;
        let group = match self.groups.wait_until(key, self.settle_timeout(), settled).await {
            Ok(group) => group,
            Err(e) => {
                ReportStats::bump(&self.stats.registry_timeouts);
                if let Some(group) = self.groups.unregister(key) {
                    LOG.failure(&group.correlation_id, &e, "group never created, finish dropped");
                }
                return;
            }
        };
        let correlation = group.correlation_id.clone();
        let Some(remote_id) = group.remote_id.filter(|_| group.phase != ItemPhase::StartFailed) else {
            LOG.debug(&correlation, format_args!("group {} was not reported, dropping finish", group.name));
            self.groups.unregister(key);
            return;
        };
        self.groups.modify(key, |g| g.phase = ItemPhase::Finishing);

        // Children still being created need the group's remote id, so it stays
        // registered until their creates settle.
        let timeout = self.settle_timeout();
        let children_settled = self
            .cases
            .wait_until_none(timeout, |c| c.parent_group_key == key && is_creating(c.phase))
            .await
            && self
                .groups
                .wait_until_none(timeout, |g| g.parent_key.as_deref() == Some(key) && is_creating(g.phase))
                .await;
        if !children_settled {
            LOG.warn(&correlation, format_args!("group {} finished with child creates still pending", group.name));
        }

        let finish = ItemFinish {
            session_id: self.coordinator.get_or_create_id(),
            end_time: Utc::now(),
            status,
        };
        self.finish_item(&correlation, &remote_id, &finish).await;
        self.groups.unregister(key);
    }

    async fn finish_item(&self, correlation: &CorrelationId, remote_id: &str, finish: &ItemFinish) {
        match self.gateway.finish_item(remote_id, finish).await {
            Ok(()) => {
                ReportStats::bump(&self.stats.items_finished);
                LOG.debug(correlation, format_args!("{remote_id} finished as {}", finish.status));
            }
            Err(e) => {
                ReportStats::bump(&self.stats.gateway_failures);
                LOG.failure(correlation, &e, format_args!("finish {remote_id} failed"));
            }
        }
    }

    async fn post_log(
        &self,
        correlation: &CorrelationId,
        item_remote_id: String,
        message: String,
        level: LogLevel,
        attachments: Vec<Attachment>,
    ) {
        let entry = LogEntry {
            session_id: self.coordinator.get_or_create_id(),
            item_remote_id,
            message,
            level,
            time: Utc::now(),
            attachments,
        };
        match self.gateway.post_log(&entry).await {
            Ok(()) => ReportStats::bump(&self.stats.logs_posted),
            Err(e) => {
                ReportStats::bump(&self.stats.gateway_failures);
                LOG.failure(correlation, &e, format_args!("post log to {} failed", entry.item_remote_id));
            }
        }
    }

    async fn finalize(self: &Arc<Self>) {
        let correlation = self.coordinator.correlation_id().clone();
        let deadline = Instant::now() + self.options.drain_timeout;
        let drained = self.cases.wait_until_empty(self.options.drain_timeout).await
            && self
                .groups
                .wait_until_empty(deadline.saturating_duration_since(Instant::now()))
                .await;
        if !drained {
            warn!(
                correlation_id = %correlation,
                groups = ?self.groups.keys(),
                cases = ?self.cases.keys(),
                "finalizing with operations still in flight"
            );
        }

        if !self.ensure_session().await {
            LOG.warn(&correlation, "session never started, nothing to finish");
            self.coordinator.complete_finalize(false);
            return;
        }

        let id = self.coordinator.get_or_create_id();
        let finish = SessionFinish {
            end_time: Utc::now(),
            status: self.coordinator.aggregated_status(),
        };
        match self.gateway.finish_session(&id, &finish).await {
            Err(e) if !e.is_conflict() => {
                ReportStats::bump(&self.stats.gateway_failures);
                LOG.failure(&correlation, &e, format_args!("finish session {id} failed"));
                self.coordinator.complete_finalize(false);
            }
            // Conflict: another process sharing the session finished it first
            _ => {
                ReportStats::bump(&self.stats.sessions_finalized);
                self.coordinator.complete_finalize(true);
                LOG.info(&correlation, format_args!("session {id} finished as {}", finish.status));
            }
        }
    }
}

fn is_creating(phase: ItemPhase) -> bool {
    matches!(phase, ItemPhase::Registered | ItemPhase::CreatePending)
}
