use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::TestStatus;

/// Start/finish callbacks from the host test runner, as delivered by the
/// event-source adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    BundleStart {
        bundle: String,
    },
    BundleFinish {
        bundle: String,
    },
    GroupStart {
        key: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_key: Option<String>,
    },
    GroupFinish {
        key: String,
        /// Hint merged with the worst status reported by the children.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TestStatus>,
    },
    CaseStart {
        key: String,
        name: String,
        group_key: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    CaseFinish {
        key: String,
        result: TestStatus,
        /// Failure messages, posted as error logs against the case.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        messages: Vec<String>,
    },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BundleStart { .. } => "bundle_start",
            Self::BundleFinish { .. } => "bundle_finish",
            Self::GroupStart { .. } => "group_start",
            Self::GroupFinish { .. } => "group_finish",
            Self::CaseStart { .. } => "case_start",
            Self::CaseFinish { .. } => "case_finish",
        }
    }
}
