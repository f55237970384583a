//! Process-wide session state: identity, bundle reference count, aggregated
//! status and the finalize-once slot.
//!
//! Every method takes the internal lock for a single read-modify-write and
//! releases it before awaiting or logging anything.

use std::future::Future;
use std::sync::OnceLock;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use tally_core::ids::{CorrelationId, SessionId};
use tally_core::status::merge_optional;
use tally_core::{ReportError, TestStatus};
use tally_telemetry::CorrelatedLogger;

type CreateHandle = Shared<BoxFuture<'static, Result<(), ReportError>>>;

const LOG: CorrelatedLogger = CorrelatedLogger::new("session");

struct InFlight {
    generation: u64,
    handle: CreateHandle,
}

#[derive(Default)]
struct SessionState {
    bundle_count: usize,
    aggregated: Option<TestStatus>,
    ready: bool,
    finalizing: bool,
    finalized: bool,
    creation: Option<InFlight>,
    generation: u64,
}

pub struct SessionCoordinator {
    supplied_id: Option<SessionId>,
    id: OnceLock<SessionId>,
    correlation_id: CorrelationId,
    state: Mutex<SessionState>,
}

impl SessionCoordinator {
    /// `supplied_id` lets several processes report into one shared session.
    pub fn new(supplied_id: Option<SessionId>) -> Self {
        Self {
            supplied_id,
            id: OnceLock::new(),
            correlation_id: CorrelationId::new(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Session id, generated on first call unless one was supplied.
    pub fn get_or_create_id(&self) -> SessionId {
        self.id
            .get_or_init(|| self.supplied_id.clone().unwrap_or_default())
            .clone()
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Make sure the remote session exists.
    ///
    /// The first caller spawns `create`; concurrent callers await the same
    /// in-flight call. A conflict means another process created the session
    /// first and counts as success. Any other failure clears the in-flight
    /// call so the next caller retries.
    pub async fn ensure_session_started<F, Fut>(&self, create: F) -> Result<(), ReportError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), ReportError>> + Send + 'static,
    {
        let (generation, handle, started) = {
            let mut state = self.state.lock();
            if state.ready {
                return Ok(());
            }
            let joined = state
                .creation
                .as_ref()
                .map(|in_flight| (in_flight.generation, in_flight.handle.clone(), false));
            match joined {
                Some(joined) => joined,
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let task = tokio::spawn(create());
                    let handle = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(ReportError::Transport(format!("session create task failed: {e}"))),
                        }
                    }
                    .boxed()
                    .shared();
                    state.creation = Some(InFlight {
                        generation,
                        handle: handle.clone(),
                    });
                    (generation, handle, true)
                }
            }
        };
        if started {
            LOG.debug(&self.correlation_id, format_args!("creating session {}", self.get_or_create_id()));
        }

        let result = handle.await;

        let (owns_slot, became_ready) = {
            let mut state = self.state.lock();
            let owns_slot = state
                .creation
                .as_ref()
                .is_some_and(|in_flight| in_flight.generation == generation);
            if owns_slot {
                state.creation = None;
            }
            let failed = matches!(&result, Err(e) if !e.is_conflict());
            let became_ready = !failed && !state.ready;
            if became_ready {
                state.ready = true;
            }
            (owns_slot, became_ready)
        };

        match result {
            Err(e) if !e.is_conflict() => {
                if owns_slot {
                    LOG.failure(&self.correlation_id, &e, "session create failed");
                }
                Err(e)
            }
            _ => {
                if became_ready {
                    LOG.info(&self.correlation_id, format_args!("session {} ready", self.get_or_create_id()));
                }
                Ok(())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Returns the new count.
    pub fn increment_bundle_count(&self) -> usize {
        let mut state = self.state.lock();
        state.bundle_count += 1;
        state.bundle_count
    }

    /// Returns true exactly when this call moved the count from 1 to 0.
    pub fn decrement_bundle_count(&self) -> bool {
        let remaining = {
            let mut state = self.state.lock();
            if state.bundle_count > 0 {
                state.bundle_count -= 1;
                Some(state.bundle_count)
            } else {
                None
            }
        };
        match remaining {
            Some(remaining) => remaining == 0,
            None => {
                LOG.warn(&self.correlation_id, "bundle finish without matching start, ignoring");
                false
            }
        }
    }

    pub fn bundle_count(&self) -> usize {
        self.state.lock().bundle_count
    }

    pub fn update_status(&self, status: TestStatus) {
        let mut state = self.state.lock();
        state.aggregated = Some(merge_optional(state.aggregated, status));
    }

    /// Worst status seen so far, `passed` when nothing has been reported.
    pub fn aggregated_status(&self) -> TestStatus {
        self.state.lock().aggregated.unwrap_or_default()
    }

    /// Claim the finalize slot. Only one caller at a time gets `true`, and
    /// nobody does once finalization has succeeded.
    pub fn try_begin_finalize(&self) -> bool {
        let mut state = self.state.lock();
        if state.finalized || state.finalizing {
            return false;
        }
        state.finalizing = true;
        true
    }

    /// Release the slot; a failed finalize may be attempted again.
    pub fn complete_finalize(&self, succeeded: bool) {
        let mut state = self.state.lock();
        state.finalizing = false;
        state.finalized |= succeeded;
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }
}
