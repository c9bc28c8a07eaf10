//! Outcomes of job attempts as reported by workers.
//!
//! Every attempt produces exactly one [`JobResult`]. The variant is carried on the wire in the
//! `type` field, so a result with any other `type` fails to decode and never reaches the
//! scheduler.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    Success(JobSuccess),
    Failure(JobFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSuccess {
    #[serde(rename = "id")]
    pub job_id: JobId,
    pub finished_at: DateTime<Utc>,
    #[serde(default = "nil")]
    pub result: rmpv::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    #[serde(rename = "id")]
    pub job_id: JobId,
    pub finished_at: DateTime<Utc>,
    pub reason: FailureReason,
    /// A hint from the worker. The master logs it but retries until `max_retry` is reached.
    #[serde(default)]
    pub should_retry: bool,
    #[serde(default = "nil")]
    pub error: rmpv::Value,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ServerIssue,
    Unknown,
}

fn nil() -> rmpv::Value {
    rmpv::Value::Nil
}

impl JobResult {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Success(success) => &success.job_id,
            Self::Failure(failure) => &failure.job_id,
        }
    }

    pub fn success(job_id: impl Into<JobId>, result: rmpv::Value) -> Self {
        Self::Success(JobSuccess {
            job_id: job_id.into(),
            finished_at: Utc::now(),
            result,
        })
    }

    pub fn failure(
        job_id: impl Into<JobId>,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self::Failure(JobFailure {
            job_id: job_id.into(),
            finished_at: Utc::now(),
            reason,
            should_retry: true,
            error: rmpv::Value::Nil,
            message: message.into(),
        })
    }

    /// Drops the success payload. Used for jobs that did not ask for their result to be kept.
    pub(crate) fn without_payload(self) -> Self {
        match self {
            Self::Success(success) => Self::Success(JobSuccess {
                result: rmpv::Value::Nil,
                ..success
            }),
            failure @ Self::Failure(_) => failure,
        }
    }
}
