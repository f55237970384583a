//! JSON bodies for the tracking service's REST API.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use tally_core::gateway::{ItemFinish, ItemKind, ItemStart, LogEntry, LogLevel, SessionFinish, SessionStart};
use tally_core::TestStatus;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

fn attributes(map: &BTreeMap<String, String>) -> Vec<Attribute> {
    map.iter()
        .map(|(key, value)| Attribute {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchStartRq {
    pub uuid: String,
    pub name: String,
    pub start_time: String,
    pub attributes: Vec<Attribute>,
}

impl From<&SessionStart> for LaunchStartRq {
    fn from(start: &SessionStart) -> Self {
        Self {
            uuid: start.id.to_string(),
            name: start.name.clone(),
            start_time: timestamp(&start.start_time),
            attributes: attributes(&start.attributes),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchFinishRq {
    pub end_time: String,
    pub status: TestStatus,
}

impl From<&SessionFinish> for LaunchFinishRq {
    fn from(finish: &SessionFinish) -> Self {
        Self {
            end_time: timestamp(&finish.end_time),
            status: finish.status,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStartRq {
    pub launch_uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub start_time: String,
    pub attributes: Vec<Attribute>,
}

impl From<&ItemStart> for ItemStartRq {
    fn from(start: &ItemStart) -> Self {
        Self {
            launch_uuid: start.session_id.to_string(),
            name: start.name.clone(),
            kind: start.kind,
            start_time: timestamp(&start.start_time),
            attributes: attributes(&start.attributes),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFinishRq {
    pub launch_uuid: String,
    pub end_time: String,
    pub status: TestStatus,
}

impl From<&ItemFinish> for ItemFinishRq {
    fn from(finish: &ItemFinish) -> Self {
        Self {
            launch_uuid: finish.session_id.to_string(),
            end_time: timestamp(&finish.end_time),
            status: finish.status,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRq {
    pub launch_uuid: String,
    pub item_uuid: String,
    pub message: String,
    pub level: LogLevel,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
}

/// One log request per entry, plus one per attachment beyond the first so
/// every file part is referenced by name.
pub fn log_requests(entry: &LogEntry) -> Vec<LogRq> {
    let base = |file: Option<FileRef>| LogRq {
        launch_uuid: entry.session_id.to_string(),
        item_uuid: entry.item_remote_id.clone(),
        message: entry.message.clone(),
        level: entry.level,
        time: timestamp(&entry.time),
        file,
    };
    if entry.attachments.is_empty() {
        return vec![base(None)];
    }
    entry
        .attachments
        .iter()
        .map(|a| base(Some(FileRef { name: a.name.clone() })))
        .collect()
}

/// Response to an item create.
#[derive(Debug, Deserialize)]
pub struct EntryCreatedRs {
    pub id: String,
}
