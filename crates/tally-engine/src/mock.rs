//! In-memory gateway for tests and dry runs.
//!
//! Behaves like the tracking service for the parts the engine relies on:
//! a second create of the same session is a conflict, finishing an unknown
//! item is not-found. Individual calls can be scripted to fail, stall or hang.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tally_core::gateway::{ItemFinish, ItemKind, ItemStart, LogEntry, LogLevel, ReportingGateway, SessionFinish, SessionStart};
use tally_core::ids::SessionId;
use tally_core::{ReportError, TestStatus};

/// Scripted outcome for one gateway call.
#[derive(Debug)]
pub enum MockResponse {
    Ok,
    Error(ReportError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Never resolve. Only useful behind a timeout.
    Hang,
}

impl MockResponse {
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One recorded call, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayCall {
    CreateSession { id: String, name: String },
    FinishSession { id: String, status: TestStatus },
    CreateItem { name: String, kind: ItemKind, parent: Option<String> },
    FinishItem { remote_id: String, status: TestStatus },
    PostLog { item: String, level: LogLevel, message: String },
}

#[derive(Clone, Debug)]
pub struct MockItem {
    pub remote_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub parent: Option<String>,
    pub status: Option<TestStatus>,
    pub logs: Vec<String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<GatewayCall>,
    /// Session id to final status, `None` while still running.
    sessions: HashMap<String, Option<TestStatus>>,
    items: HashMap<String, MockItem>,
    next_item: u64,
    session_script: VecDeque<MockResponse>,
    item_scripts: HashMap<String, VecDeque<MockResponse>>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    latency: Option<Duration>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before touching state.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Pretend another process already created `id`.
    pub fn with_existing_session(id: &str) -> Self {
        let gateway = Self::new();
        gateway.state.lock().sessions.insert(id.to_string(), None);
        gateway
    }

    /// Queue a response for the next `create_session` call.
    pub fn script_session(&self, response: MockResponse) {
        self.state.lock().session_script.push_back(response);
    }

    /// Queue a response for the next `create_item` call naming `name`.
    pub fn script_item(&self, name: &str, response: MockResponse) {
        self.state
            .lock()
            .item_scripts
            .entry(name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn session_creates(&self) -> usize {
        self.count_calls(|c| matches!(c, GatewayCall::CreateSession { .. }))
    }

    pub fn session_finishes(&self) -> Vec<(String, TestStatus)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::FinishSession { id, status } => Some((id.clone(), *status)),
                _ => None,
            })
            .collect()
    }

    /// Final status of a session, `None` if unknown or still running.
    pub fn session_status(&self, id: &str) -> Option<TestStatus> {
        self.state.lock().sessions.get(id).copied().flatten()
    }

    /// Items that were created, sorted by name.
    pub fn created_items(&self) -> Vec<MockItem> {
        let mut items: Vec<MockItem> = self.state.lock().items.values().cloned().collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn item_named(&self, name: &str) -> Option<MockItem> {
        self.state.lock().items.values().find(|i| i.name == name).cloned()
    }

    /// Names and statuses of finished items, sorted by name.
    pub fn finished_items(&self) -> Vec<(String, TestStatus)> {
        let mut finished: Vec<(String, TestStatus)> = self
            .state
            .lock()
            .items
            .values()
            .filter_map(|i| i.status.map(|s| (i.name.clone(), s)))
            .collect();
        finished.sort();
        finished
    }

    fn count_calls(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: GatewayCall) {
        self.state.lock().calls.push(call);
    }

    async fn settle(&self, scripted: Option<MockResponse>) -> Result<(), ReportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match scripted {
            Some(response) => resolve_response(response).await,
            None => Ok(()),
        }
    }
}

/// Resolve a scripted response, unrolling nested delays.
async fn resolve_response(response: MockResponse) -> Result<(), ReportError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Ok => return Ok(()),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            MockResponse::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl ReportingGateway for MockGateway {
    async fn create_session(&self, start: &SessionStart) -> Result<(), ReportError> {
        self.record(GatewayCall::CreateSession {
            id: start.id.to_string(),
            name: start.name.clone(),
        });
        let scripted = self.state.lock().session_script.pop_front();
        self.settle(scripted).await?;

        let mut state = self.state.lock();
        if state.sessions.contains_key(start.id.as_str()) {
            return Err(ReportError::Conflict(format!("launch {} already exists", start.id)));
        }
        state.sessions.insert(start.id.to_string(), None);
        Ok(())
    }

    async fn finish_session(&self, id: &SessionId, finish: &SessionFinish) -> Result<(), ReportError> {
        self.record(GatewayCall::FinishSession {
            id: id.to_string(),
            status: finish.status,
        });
        self.settle(None).await?;

        let mut state = self.state.lock();
        match state.sessions.get_mut(id.as_str()) {
            None => Err(ReportError::NotFound(format!("launch {id}"))),
            Some(Some(_)) => Err(ReportError::Conflict(format!("launch {id} already finished"))),
            Some(slot) => {
                *slot = Some(finish.status);
                Ok(())
            }
        }
    }

    async fn create_item(&self, start: &ItemStart) -> Result<String, ReportError> {
        self.record(GatewayCall::CreateItem {
            name: start.name.clone(),
            kind: start.kind,
            parent: start.parent_remote_id.clone(),
        });
        let scripted = self
            .state
            .lock()
            .item_scripts
            .get_mut(&start.name)
            .and_then(VecDeque::pop_front);
        self.settle(scripted).await?;

        let mut state = self.state.lock();
        if !state.sessions.contains_key(start.session_id.as_str()) {
            return Err(ReportError::NotFound(format!("launch {}", start.session_id)));
        }
        if let Some(parent) = &start.parent_remote_id {
            if !state.items.contains_key(parent) {
                return Err(ReportError::NotFound(format!("parent item {parent}")));
            }
        }
        state.next_item += 1;
        let remote_id = format!("item-{}", state.next_item);
        state.items.insert(
            remote_id.clone(),
            MockItem {
                remote_id: remote_id.clone(),
                name: start.name.clone(),
                kind: start.kind,
                parent: start.parent_remote_id.clone(),
                status: None,
                logs: Vec::new(),
            },
        );
        Ok(remote_id)
    }

    async fn finish_item(&self, remote_id: &str, finish: &ItemFinish) -> Result<(), ReportError> {
        self.record(GatewayCall::FinishItem {
            remote_id: remote_id.to_string(),
            status: finish.status,
        });
        self.settle(None).await?;

        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(remote_id)
            .ok_or_else(|| ReportError::NotFound(format!("item {remote_id}")))?;
        if item.status.is_some() {
            return Err(ReportError::Conflict(format!("item {remote_id} already finished")));
        }
        item.status = Some(finish.status);
        Ok(())
    }

    async fn post_log(&self, entry: &LogEntry) -> Result<(), ReportError> {
        self.record(GatewayCall::PostLog {
            item: entry.item_remote_id.clone(),
            level: entry.level,
            message: entry.message.clone(),
        });
        self.settle(None).await?;

        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(&entry.item_remote_id)
            .ok_or_else(|| ReportError::NotFound(format!("item {}", entry.item_remote_id)))?;
        item.logs.push(entry.message.clone());
        Ok(())
    }
}
