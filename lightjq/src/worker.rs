use std::{fmt::Display, num::NonZeroU32};

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerError;

/// The identifier a worker registers itself with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The message a worker pushes onto the worker registration queue when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: WorkerId,
    #[serde(default)]
    pub worker_name: String,
    pub processes: u32,
}

/// A capacity grant: the worker may run up to `max_processes` jobs concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    pub display_name: String,
    pub max_processes: NonZeroU32,
}

impl Worker {
    pub fn new(
        id: impl Into<WorkerId>,
        display_name: impl Into<String>,
        max_processes: NonZeroU32,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            max_processes,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_processes.get() as usize
    }
}

impl TryFrom<WorkerRegistration> for Worker {
    type Error = SchedulerError;

    fn try_from(value: WorkerRegistration) -> Result<Self, Self::Error> {
        let max_processes =
            NonZeroU32::new(value.processes).ok_or(SchedulerError::ZeroCapacity(value.id.clone()))?;
        Ok(Self {
            id: value.id,
            display_name: value.worker_name,
            max_processes,
        })
    }
}
