use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ReportError;
use crate::ids::SessionId;
use crate::status::TestStatus;

/// Kind of a remote item in the reporting hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    /// Root group, attached directly to the session.
    Suite,
    /// Nested group.
    Test,
    /// Leaf case.
    Step,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SessionStart {
    pub id: SessionId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct SessionFinish {
    pub end_time: DateTime<Utc>,
    pub status: TestStatus,
}

#[derive(Clone, Debug)]
pub struct ItemStart {
    pub session_id: SessionId,
    /// `None` attaches the item directly to the session.
    pub parent_remote_id: Option<String>,
    pub name: String,
    pub kind: ItemKind,
    pub start_time: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ItemFinish {
    pub session_id: SessionId,
    pub end_time: DateTime<Utc>,
    pub status: TestStatus,
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub session_id: SessionId,
    pub item_remote_id: String,
    pub message: String,
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

/// Operations the coordinator needs from the remote tracking service.
///
/// Implementations must be safe to call concurrently for different items.
/// A create that finds the resource already present reports
/// [`ReportError::Conflict`].
#[async_trait]
pub trait ReportingGateway: Send + Sync {
    async fn create_session(&self, start: &SessionStart) -> Result<(), ReportError>;

    async fn finish_session(&self, id: &SessionId, finish: &SessionFinish) -> Result<(), ReportError>;

    /// Returns the remote id assigned to the new item.
    async fn create_item(&self, start: &ItemStart) -> Result<String, ReportError>;

    async fn finish_item(&self, remote_id: &str, finish: &ItemFinish) -> Result<(), ReportError>;

    async fn post_log(&self, entry: &LogEntry) -> Result<(), ReportError>;
}

#[async_trait]
impl<G: ReportingGateway + ?Sized> ReportingGateway for std::sync::Arc<G> {
    async fn create_session(&self, start: &SessionStart) -> Result<(), ReportError> {
        (**self).create_session(start).await
    }

    async fn finish_session(&self, id: &SessionId, finish: &SessionFinish) -> Result<(), ReportError> {
        (**self).finish_session(id, finish).await
    }

    async fn create_item(&self, start: &ItemStart) -> Result<String, ReportError> {
        (**self).create_item(start).await
    }

    async fn finish_item(&self, remote_id: &str, finish: &ItemFinish) -> Result<(), ReportError> {
        (**self).finish_item(remote_id, finish).await
    }

    async fn post_log(&self, entry: &LogEntry) -> Result<(), ReportError> {
        (**self).post_log(entry).await
    }
}
