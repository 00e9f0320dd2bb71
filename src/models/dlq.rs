use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::Job;

/// A job that exhausted its retry budget, kept for inspection and manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub command: String,
    pub moved_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_retries: u32,
    pub reason: String,
    /// Full field snapshot of the live job at the moment it was dead-lettered.
    pub original_job: Job,
}
