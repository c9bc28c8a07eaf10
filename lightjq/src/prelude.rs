//! The purpose of this module is to alleviate the need to import many of the `[lightjq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use lightjq::prelude::*;
//! ```
pub use crate::config::MasterConfig;
pub use crate::job::{Job, JobId, JobRegistration};
pub use crate::ping::{Ping, PingChecker, PingFailure, PingOutcome};
pub use crate::ratelimit::{Clock, RateLimiter, RateLimiterCollection, SystemClock, TokenBucket};
pub use crate::result::{FailureReason, JobFailure, JobResult, JobSuccess};
pub use crate::scheduler::{Scheduler, SchedulerError};
pub use crate::transport::{ReadyJobId, Transport, TransportError, TransportExt};
pub use crate::worker::{Worker, WorkerId, WorkerRegistration};
pub use crate::{Master, MasterError};
