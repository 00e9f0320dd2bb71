use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a job in the live table.
///
/// `Dead` never appears on a live row: a job that exhausts its retries is
/// moved to the DLQ, and the state is only recorded on the DLQ snapshot.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

/// A queued shell command and its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Set while `processing`: when the claim lapses if no outcome is reported.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set while `failed`: when the owning worker's backoff ends.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

/// Result of `report_failure`: the post-increment attempt count and the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    pub attempts: u32,
    pub max_retries: u32,
}

/// Aggregate job counts per state, plus the DLQ size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub states: BTreeMap<JobState, u64>,
    pub dlq: u64,
}

impl QueueSummary {
    pub fn count(&self, state: JobState) -> u64 {
        self.states.get(&state).copied().unwrap_or(0)
    }
}
