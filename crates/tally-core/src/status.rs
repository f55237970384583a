//! Worst-result-wins status aggregation.
//!
//! Precedence is `failed > skipped > passed`. The variant order below encodes
//! it, so merging is just `max`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a case, group or session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Passed,
    Skipped,
    Failed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Merge `other` into `self`, keeping the worse of the two.
    pub fn merge(self, other: Self) -> Self {
        merge(self, other)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the worse of `a` and `b`.
pub fn merge(a: TestStatus, b: TestStatus) -> TestStatus {
    a.max(b)
}

/// Merge into a status that may not have been set yet.
pub fn merge_optional(current: Option<TestStatus>, new: TestStatus) -> TestStatus {
    match current {
        Some(c) => merge(c, new),
        None => new,
    }
}

/// Worst status of an iterator, `None` when it is empty.
pub fn merge_all<I>(statuses: I) -> Option<TestStatus>
where
    I: IntoIterator<Item = TestStatus>,
{
    statuses.into_iter().reduce(merge)
}
