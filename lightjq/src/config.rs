use std::time::Duration;

/// Timings of the master's background tasks.
///
/// The defaults match what workers expect: a worker that has not pinged for ten seconds is
/// considered lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterConfig {
    /// How often the dispatcher re-checks capacity when nothing has woken it up.
    pub dispatch_poll_interval: Duration,
    /// How long a worker may stay silent before its capacity is withdrawn.
    pub ping_drop_interval: Duration,
    /// The longest a single blocking pop on the broker may wait.
    pub intake_wait: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            dispatch_poll_interval: Duration::from_secs(1),
            ping_drop_interval: Duration::from_secs(10),
            intake_wait: Duration::from_secs(1),
        }
    }
}

impl MasterConfig {
    pub fn with_dispatch_poll_interval(self, dispatch_poll_interval: Duration) -> Self {
        Self {
            dispatch_poll_interval,
            ..self
        }
    }

    pub fn with_ping_drop_interval(self, ping_drop_interval: Duration) -> Self {
        Self {
            ping_drop_interval,
            ..self
        }
    }

    pub fn with_intake_wait(self, intake_wait: Duration) -> Self {
        Self {
            intake_wait,
            ..self
        }
    }
}
