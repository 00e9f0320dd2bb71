use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobState;

/// Highest per-job retry ceiling accepted on submission.
pub const MAX_RETRY_CEILING: u32 = 100;

/// Job submission payload, as accepted by the CLI and the HTTP API.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(length(min = 1, max = 64), ascii)]
    pub id: Option<String>,

    #[garde(required, length(min = 1, max = 8192))]
    pub command: Option<String>,

    #[garde(range(max = MAX_RETRY_CEILING))]
    pub max_retries: Option<u32>,
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: Option<String>,
    pub command: String,
    pub max_retries: Option<u32>,
}

impl SubmitJobRequest {
    /// Parse a JSON submission such as `{"command":"echo hi","max_retries":2}`.
    pub fn from_json(payload: &str) -> Result<Self, SubmissionError> {
        serde_json::from_str(payload).map_err(|e| SubmissionError::Malformed(e.to_string()))
    }

    /// Run field validation and normalize into a [`NewJob`].
    pub fn into_new_job(self) -> Result<NewJob, SubmissionError> {
        if self.command.is_none() {
            return Err(SubmissionError::MissingCommand);
        }
        self.validate()
            .map_err(|e| SubmissionError::Invalid(e.to_string()))?;

        let command = self.command.unwrap_or_default();
        if command.trim().is_empty() {
            return Err(SubmissionError::MissingCommand);
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
                return Err(SubmissionError::Invalid(
                    "id: must not contain whitespace".to_string(),
                ));
            }
        }

        Ok(NewJob {
            id: self.id,
            command,
            max_retries: self.max_retries,
        })
    }
}

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub state: JobState,
}

/// Response after asking for a DLQ entry to be replayed.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryDlqResponse {
    pub job_id: String,
    pub requeued: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Invalid JSON payload: {0}")]
    Malformed(String),

    #[error("'command' field is required")]
    MissingCommand,

    #[error("Invalid submission: {0}")]
    Invalid(String),
}
