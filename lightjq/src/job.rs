//! Jobs as they travel through the queue.
//!
//! A producer submits a [`JobRegistration`] on the job registration queue. The master turns it
//! into a [`Job`] record, which is what is stored on the broker under the job's id and what the
//! worker loads once it has claimed the id from the global dispatch queue.
use std::{collections::HashMap, fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Arbitrary, string keyed job arguments.
pub type Argument = HashMap<String, rmpv::Value>;

/// The producer assigned identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work.
///
/// Lower `priority` values are served first. `current_retry` starts at zero and is incremented
/// each time a failed attempt is re-enqueued; it never exceeds `max_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub argument: Argument,
    pub priority: i32,
    pub max_retry: u32,
    #[serde(default)]
    pub current_retry: u32,
    #[serde(default)]
    pub keep_result: bool,
    /// Advisory: how long a worker may run the job before it is considered stuck.
    #[serde(default, with = "timeout_secs")]
    pub timeout: Duration,
    pub registered_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job with priority `0`, no retries and no arguments.
    pub fn new(id: impl Into<JobId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            argument: Default::default(),
            priority: 0,
            max_retry: 0,
            current_retry: 0,
            keep_result: false,
            timeout: Duration::ZERO,
            registered_at: Utc::now(),
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_retry(self, max_retry: u32) -> Self {
        Self { max_retry, ..self }
    }

    pub fn with_current_retry(self, current_retry: u32) -> Self {
        Self {
            current_retry,
            ..self
        }
    }

    pub fn with_argument(self, argument: Argument) -> Self {
        Self { argument, ..self }
    }

    pub fn with_keep_result(self, keep_result: bool) -> Self {
        Self {
            keep_result,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// The score of the job in the priority index.
    pub fn priority_score(&self) -> f64 {
        f64::from(self.priority)
    }

    pub(crate) fn is_final_attempt(&self) -> bool {
        self.current_retry >= self.max_retry
    }

    /// The record to re-enqueue after a failed, retryable attempt.
    pub(crate) fn next_attempt(self) -> Self {
        Self {
            current_retry: self.current_retry + 1,
            registered_at: Utc::now(),
            ..self
        }
    }
}

/// A job as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRegistration {
    pub id: JobId,
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub argument: Argument,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub keep_result: bool,
    #[serde(default, with = "timeout_secs")]
    pub timeout: Duration,
}

impl JobRegistration {
    pub fn into_job(self, registered_at: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            name: self.name,
            argument: self.argument,
            priority: self.priority,
            max_retry: self.max_retry,
            current_retry: 0,
            keep_result: self.keep_result,
            timeout: self.timeout,
            registered_at,
        }
    }
}

impl From<&Job> for JobRegistration {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            argument: job.argument.clone(),
            priority: job.priority,
            max_retry: job.max_retry,
            keep_result: job.keep_result,
            timeout: job.timeout,
        }
    }
}

/// Producers written against loosely typed encoders send `nil` for an empty argument map.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timeouts travel as whole seconds.
mod timeout_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(timeout: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(timeout.as_secs())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod test {
    use crate::codec;

    use super::*;

    #[test]
    fn registration_into_job_starts_at_first_attempt() {
        let registered_at = Utc::now();
        let registration = JobRegistration {
            id: "job-1".into(),
            name: "resize".to_owned(),
            argument: [("width".to_owned(), rmpv::Value::from(640))].into(),
            priority: 3,
            max_retry: 2,
            keep_result: true,
            timeout: Duration::from_secs(30),
        };

        let job = registration.into_job(registered_at);

        assert_eq!(job.id, JobId::from("job-1"));
        assert_eq!(job.current_retry, 0);
        assert_eq!(job.max_retry, 2);
        assert_eq!(job.priority, 3);
        assert_eq!(job.registered_at, registered_at);
        assert_eq!(job.argument["width"], rmpv::Value::from(640));
    }

    #[test]
    fn next_attempt_increments_retry_and_keeps_id() {
        let job = Job::new("job-1", "resize").with_max_retry(3);
        let registered_at = job.registered_at;

        let retried = job.next_attempt();

        assert_eq!(retried.id, JobId::from("job-1"));
        assert_eq!(retried.current_retry, 1);
        assert!(retried.registered_at >= registered_at);
    }

    #[test]
    fn final_attempt() {
        assert!(Job::new("a", "n").is_final_attempt());
        assert!(!Job::new("a", "n").with_max_retry(1).is_final_attempt());
        assert!(Job::new("a", "n")
            .with_max_retry(1)
            .with_current_retry(1)
            .is_final_attempt());
    }

    #[test]
    fn registration_accepts_nil_argument_and_missing_fields() {
        #[derive(Serialize)]
        struct Minimal {
            id: &'static str,
            name: &'static str,
            argument: Option<Argument>,
            timeout: u64,
        }

        let payload = codec::encode(&Minimal {
            id: "job-1",
            name: "noop",
            argument: None,
            timeout: 12,
        })
        .unwrap();

        let registration: JobRegistration = codec::decode(&payload).unwrap();

        assert!(registration.argument.is_empty());
        assert_eq!(registration.max_retry, 0);
        assert_eq!(registration.timeout, Duration::from_secs(12));
    }
}
