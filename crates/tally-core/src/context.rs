//! In-flight operation contexts held by the registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ids::CorrelationId;
use crate::status::TestStatus;

/// Where an item is in its reporting lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemPhase {
    Registered,
    CreatePending,
    Ready,
    Finishing,
    Finished,
    FinishFailed,
    /// Create failed or the parent never became ready. The item is never
    /// reported and its finish event only cleans up.
    StartFailed,
}

impl ItemPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::FinishFailed | Self::StartFailed)
    }
}

/// Anything the registry can wait on.
pub trait Tracked: Clone + Send + Sync + 'static {
    fn remote_id(&self) -> Option<&str>;

    /// True once the remote create call has assigned a non-empty id.
    fn is_ready(&self) -> bool {
        self.remote_id().is_some_and(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct GroupContext {
    pub correlation_id: CorrelationId,
    pub remote_id: Option<String>,
    pub parent_key: Option<String>,
    pub parent_remote_id: Option<String>,
    pub name: String,
    /// Worst status reported by children so far.
    pub status: Option<TestStatus>,
    pub start_time: DateTime<Utc>,
    pub child_remote_ids: Vec<String>,
    pub phase: ItemPhase,
}

impl GroupContext {
    pub fn new(name: impl Into<String>, parent_key: Option<String>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            remote_id: None,
            parent_key,
            parent_remote_id: None,
            name: name.into(),
            status: None,
            start_time: Utc::now(),
            child_remote_ids: Vec::new(),
            phase: ItemPhase::Registered,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_key.is_none()
    }
}

impl Tracked for GroupContext {
    fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }
}

#[derive(Clone, Debug)]
pub struct CaseContext {
    pub correlation_id: CorrelationId,
    pub remote_id: Option<String>,
    pub parent_group_key: String,
    pub name: String,
    pub status: Option<TestStatus>,
    pub start_time: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub phase: ItemPhase,
}

impl CaseContext {
    pub fn new(
        name: impl Into<String>,
        parent_group_key: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            remote_id: None,
            parent_group_key: parent_group_key.into(),
            name: name.into(),
            status: None,
            start_time: Utc::now(),
            metadata,
            phase: ItemPhase::Registered,
        }
    }
}

impl Tracked for CaseContext {
    fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }
}
