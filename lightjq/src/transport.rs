//! The broker abstraction.
//!
//! Everything the master persists or communicates goes through a [`Transport`]: the job records,
//! the priority index of ready jobs, the set of jobs currently being processed, the intake queues
//! fed by producers and workers, the global dispatch queue, the result channel and the ping
//! channel.
//!
//! Implementations only deal with the broker primitives. Decoding the intake queues into typed
//! streams is shared by all implementations via [`TransportExt`].
//!
//! Blocking operations take a bounded `wait` and return `None` when it elapses. A pop that is in
//! flight is therefore always allowed to complete, and callers check for cancellation between
//! pops instead of dropping a pop half way through (which could lose the popped message).
use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    codec,
    job::{Job, JobId, JobRegistration},
    result::JobResult,
    worker::WorkerRegistration,
};

pub mod memory;
pub mod testing;

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = Result<T, TransportError>> + Send>>;

#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    /// Pops the oldest raw message from an intake queue, waiting at most `wait` for one.
    async fn pop_intake(
        &self,
        queue: IntakeQueue,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Subscribes to the raw heartbeat messages published by workers.
    ///
    /// The stream ends once `cancellation_token` is cancelled.
    async fn subscribe_pings(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<BoxedStream<Vec<u8>>, TransportError>;

    /// Writes the job record and inserts the id into the priority index with the job's priority
    /// as score. Both writes commit or neither does.
    async fn store_job(&self, job: &Job) -> Result<(), TransportError>;

    /// Removes and returns the id with the lowest score from the priority index, waiting at most
    /// `wait` for one to become available.
    async fn pop_ready_job_id(&self, wait: Duration) -> Result<Option<ReadyJobId>, TransportError>;

    /// Puts a popped id back into the priority index with the score it was popped with.
    ///
    /// An id that has been indexed again in the meantime keeps its current score.
    async fn restore_ready_job_id(&self, ready: &ReadyJobId) -> Result<(), TransportError>;

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, TransportError>;

    /// Atomically reads and deletes the job record.
    ///
    /// Of several concurrent calls for the same id at most one returns the record.
    async fn take_job(&self, id: &JobId) -> Result<Option<Job>, TransportError>;

    async fn mark_processing(&self, id: &JobId) -> Result<(), TransportError>;

    /// Returns whether the id was present in the processing set.
    async fn unmark_processing(&self, id: &JobId) -> Result<bool, TransportError>;

    async fn processing_count(&self) -> Result<usize, TransportError>;

    /// Hands the id to the workers via the global dispatch queue.
    async fn distribute_job(&self, id: &JobId) -> Result<(), TransportError>;

    /// Forwards a finalized result to the producers.
    async fn publish_result(&self, result: &JobResult) -> Result<(), TransportError>;
}

/// An id popped from the priority index, with the score it was indexed under.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyJobId {
    pub id: JobId,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Error encoding message")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Error decoding message")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Error communicating with the broker")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Transport in bad state")]
    BadState,
}

/// The queues producers and workers push onto and the master consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntakeQueue {
    WorkerRegistrations,
    JobRegistrations,
    Results,
}

/// A message consumed from one of the intake queues.
pub trait IntakeMessage: DeserializeOwned + Send + 'static {
    const QUEUE: IntakeQueue;
}

impl IntakeMessage for WorkerRegistration {
    const QUEUE: IntakeQueue = IntakeQueue::WorkerRegistrations;
}

impl IntakeMessage for JobRegistration {
    const QUEUE: IntakeQueue = IntakeQueue::JobRegistrations;
}

impl IntakeMessage for JobResult {
    const QUEUE: IntakeQueue = IntakeQueue::Results;
}

/// Typed intake streams for any [`Transport`].
///
/// Each stream yields one item per message popped from its queue: the decoded message, or the
/// error that prevented decoding it so that the consumer can report and skip it. Broker errors
/// are yielded as well, after which the stream waits `wait` before popping again. The streams
/// end once `cancellation_token` is cancelled and the pop in flight has completed.
pub trait TransportExt: Transport {
    fn intake<M: IntakeMessage>(
        &self,
        wait: Duration,
        cancellation_token: CancellationToken,
    ) -> BoxedStream<M> {
        let transport = self.clone();
        Box::pin(stream! {
            while !cancellation_token.is_cancelled() {
                match transport.pop_intake(M::QUEUE, wait).await {
                    Ok(Some(payload)) => yield codec::decode::<M>(&payload),
                    Ok(None) => {}
                    Err(error) => {
                        yield Err(error);
                        tokio::select! {
                            _ = cancellation_token.cancelled() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        })
    }

    fn worker_registrations(
        &self,
        wait: Duration,
        cancellation_token: CancellationToken,
    ) -> BoxedStream<WorkerRegistration> {
        self.intake(wait, cancellation_token)
    }

    /// Job registrations, already turned into job records registered now.
    fn job_registrations(
        &self,
        wait: Duration,
        cancellation_token: CancellationToken,
    ) -> BoxedStream<Job> {
        Box::pin(
            self.intake::<JobRegistration>(wait, cancellation_token)
                .map(|registration| registration.map(|reg| reg.into_job(Utc::now()))),
        )
    }

    fn results(
        &self,
        wait: Duration,
        cancellation_token: CancellationToken,
    ) -> BoxedStream<JobResult> {
        self.intake(wait, cancellation_token)
    }
}

impl<T: Transport> TransportExt for T {}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use fxhash::FxHashMap;

    use super::*;
    use crate::transport::memory::InMemoryTransport;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operation {
        LoadJob,
        RestoreReadyJobId,
        MarkProcessing,
        UnmarkProcessing,
        DistributeJob,
    }

    /// Delegates to an [`InMemoryTransport`], failing the operations it was told to fail.
    #[derive(Clone)]
    pub struct FailingTransport {
        inner: InMemoryTransport,
        failures: Arc<Mutex<FxHashMap<Operation, usize>>>,
    }

    impl FailingTransport {
        pub fn new(inner: InMemoryTransport) -> Self {
            Self {
                inner,
                failures: Default::default(),
            }
        }

        pub fn fail_next(&self, operation: Operation) {
            *self.failures.lock().unwrap().entry(operation).or_default() += 1;
        }

        fn check(&self, operation: Operation) -> Result<(), TransportError> {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(TransportError::Broker(
                        format!("{operation:?} failed").into(),
                    ))
                }
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn pop_intake(
            &self,
            queue: IntakeQueue,
            wait: Duration,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            self.inner.pop_intake(queue, wait).await
        }

        async fn subscribe_pings(
            &self,
            cancellation_token: CancellationToken,
        ) -> Result<BoxedStream<Vec<u8>>, TransportError> {
            self.inner.subscribe_pings(cancellation_token).await
        }

        async fn store_job(&self, job: &Job) -> Result<(), TransportError> {
            self.inner.store_job(job).await
        }

        async fn pop_ready_job_id(
            &self,
            wait: Duration,
        ) -> Result<Option<ReadyJobId>, TransportError> {
            self.inner.pop_ready_job_id(wait).await
        }

        async fn restore_ready_job_id(&self, ready: &ReadyJobId) -> Result<(), TransportError> {
            self.check(Operation::RestoreReadyJobId)?;
            self.inner.restore_ready_job_id(ready).await
        }

        async fn load_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
            self.check(Operation::LoadJob)?;
            self.inner.load_job(id).await
        }

        async fn take_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
            self.inner.take_job(id).await
        }

        async fn mark_processing(&self, id: &JobId) -> Result<(), TransportError> {
            self.check(Operation::MarkProcessing)?;
            self.inner.mark_processing(id).await
        }

        async fn unmark_processing(&self, id: &JobId) -> Result<bool, TransportError> {
            self.check(Operation::UnmarkProcessing)?;
            self.inner.unmark_processing(id).await
        }

        async fn processing_count(&self) -> Result<usize, TransportError> {
            self.inner.processing_count().await
        }

        async fn distribute_job(&self, id: &JobId) -> Result<(), TransportError> {
            self.check(Operation::DistributeJob)?;
            self.inner.distribute_job(id).await
        }

        async fn publish_result(&self, result: &JobResult) -> Result<(), TransportError> {
            self.inner.publish_result(result).await
        }
    }
}
