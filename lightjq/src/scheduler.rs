//! The priority job store, worker capacity accounting, dispatch and the result state machine.
//!
//! The [`Scheduler`] is owned by a single task, the master's owner loop, which applies worker
//! registrations, job registrations and results one at a time. Dispatch runs on its own task via
//! a [`Dispatcher`] obtained from the scheduler. The two only share the broker, the published
//! total capacity and a capacity-freed signal.
//!
//! Capacity is the cardinality of the broker resident processing set compared against the sum of
//! the registered workers' `max_processes`. The comparison is advisory: two dispatchers may both
//! observe the last free slot.
use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MasterConfig,
    job::{Job, JobId},
    result::JobResult,
    transport::{ReadyJobId, Transport, TransportError},
    worker::{Worker, WorkerId},
};

pub mod pool;

use pool::WorkerPool;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job id must not be empty")]
    EmptyJobId,
    #[error("Job record not found for {0}")]
    JobNotFound(JobId),
    #[error("Worker {0} registered with zero processes")]
    ZeroCapacity(WorkerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Scheduler<T: Transport> {
    transport: T,
    pool: WorkerPool,
    capacity_freed: Arc<Notify>,
    config: MasterConfig,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(transport: T, config: MasterConfig) -> Self {
        Self {
            transport,
            pool: Default::default(),
            capacity_freed: Default::default(),
            config,
        }
    }

    /// Stores the job record and indexes it by priority in a single broker transaction.
    ///
    /// Used for first submissions and for retries alike.
    pub async fn add_job(&self, job: &Job) -> Result<(), SchedulerError> {
        if job.id.is_empty() {
            return Err(SchedulerError::EmptyJobId);
        }
        self.transport.store_job(job).await?;
        Ok(())
    }

    /// Waits for the lowest priority ready job, removes it from the index and loads its record.
    ///
    /// Returns `Ok(None)` once `cancellation_token` is cancelled.
    pub async fn blocking_pop_ready_job(
        &self,
        cancellation_token: &CancellationToken,
    ) -> Result<Option<Job>, SchedulerError> {
        blocking_pop_ready_job(&self.transport, self.config.intake_wait, cancellation_token).await
    }

    pub async fn has_capacity(&self) -> Result<bool, SchedulerError> {
        let processing = self.transport.processing_count().await?;
        Ok(processing < self.pool.total_capacity())
    }

    pub fn add_worker(&mut self, worker: Worker) -> Option<Worker> {
        self.pool.add(worker)
    }

    /// Withdraws the worker's capacity. Unknown ids are ignored.
    pub fn remove_worker(&mut self, id: &WorkerId) -> Option<Worker> {
        self.pool.remove(id)
    }

    pub fn total_capacity(&self) -> usize {
        self.pool.total_capacity()
    }

    /// The dispatch loop for this scheduler, to be run on its own task.
    pub fn dispatcher(&self) -> Dispatcher<T> {
        Dispatcher {
            transport: self.transport.clone(),
            total_capacity: self.pool.subscribe(),
            capacity_freed: self.capacity_freed.clone(),
            poll_interval: self.config.dispatch_poll_interval,
            ready_wait: self.config.intake_wait,
        }
    }

    /// Applies a worker's report for one attempt.
    ///
    /// A success, or a failure with no retries left, finalizes the job: the record is deleted,
    /// the processing entry released and the result forwarded to producers. Any other failure
    /// releases the processing entry and re-enqueues the job for its next attempt.
    pub async fn process_result(&self, result: JobResult) -> Result<(), SchedulerError> {
        let JobResult::Failure(failure) = &result else {
            return self.finalize(result).await;
        };
        let job_id = failure.job_id.clone();

        let Some(job) = self.transport.load_job(&job_id).await? else {
            self.release(&job_id).await?;
            return Err(SchedulerError::JobNotFound(job_id));
        };

        if job.is_final_attempt() {
            tracing::warn!(
                %job_id,
                reason = ?failure.reason,
                detail = %failure.message,
                "Job {job_id} failed with no retries left"
            );
            return self.finalize(result).await;
        }

        if !failure.should_retry {
            tracing::debug!(%job_id, "Worker advised against retrying {job_id}, retrying anyway");
        }
        let next = job.next_attempt();
        tracing::warn!(
            %job_id,
            reason = ?failure.reason,
            attempt = next.current_retry,
            max_retry = next.max_retry,
            "Job {job_id} failed, retrying"
        );
        let released = self.release(&job_id).await.inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to release job {job_id} before retrying, error: {err:?}"
            )
        });
        self.add_job(&next).await?;
        released?;
        Ok(())
    }

    async fn finalize(&self, result: JobResult) -> Result<(), SchedulerError> {
        let job_id = result.job_id().clone();
        let taken = self.transport.take_job(&job_id).await;
        let released = self.release(&job_id).await;

        match taken? {
            Some(job) => {
                let result = if job.keep_result {
                    result
                } else {
                    result.without_payload()
                };
                self.transport
                    .publish_result(&result)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to publish result for job {job_id}, error: {err:?}"
                        )
                    })?;
                tracing::debug!(%job_id, "Job finalized {job_id}");
            }
            None => tracing::debug!(%job_id, "Ignoring result for already finalized job {job_id}"),
        }

        released?;
        Ok(())
    }

    async fn release(&self, job_id: &JobId) -> Result<bool, TransportError> {
        release(&self.transport, &self.capacity_freed, job_id).await
    }
}

/// Hands ready jobs to workers while there is capacity for them.
pub struct Dispatcher<T: Transport> {
    transport: T,
    total_capacity: watch::Receiver<usize>,
    capacity_freed: Arc<Notify>,
    poll_interval: Duration,
    ready_wait: Duration,
}

impl<T: Transport> Dispatcher<T> {
    pub async fn has_capacity(&self) -> Result<bool, TransportError> {
        let processing = self.transport.processing_count().await?;
        Ok(processing < *self.total_capacity.borrow())
    }

    /// Runs until `cancellation_token` is cancelled.
    ///
    /// Each iteration waits for capacity, then for a ready job, then marks the job as processing
    /// and pushes its id onto the global dispatch queue. A job that could not be delivered is
    /// released and put back into the ready index.
    ///
    /// Waits for a ready job are bounded, so capacity is checked again whenever no job arrived in
    /// time. A job popped after capacity was lost is put back into the index.
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        while self.wait_for_capacity(&cancellation_token).await {
            let (ready, job) = match pop_ready_job(&self.transport, self.ready_wait).await {
                Ok(Some(popped)) => popped,
                Ok(None) => continue,
                Err(err @ SchedulerError::JobNotFound(_)) => {
                    tracing::warn!(?err, "Skipping ready job, error: {err}");
                    continue;
                }
                Err(err) => {
                    tracing::error!(?err, "Failed to pop ready job, error: {err:?}");
                    self.pause(&cancellation_token).await;
                    continue;
                }
            };
            match self.has_capacity().await {
                Ok(true) => self.dispatch(job).await,
                Ok(false) => {
                    let job_id = &job.id;
                    tracing::debug!(%job_id, "Capacity lost, returning job {job_id}");
                    restore(&self.transport, &ready).await;
                }
                Err(err) => {
                    tracing::error!(?err, "Failed to read processing count, error: {err:?}");
                    restore(&self.transport, &ready).await;
                    self.pause(&cancellation_token).await;
                }
            }
        }
        tracing::debug!("Shutting down the dispatcher");
    }

    async fn dispatch(&self, job: Job) {
        let job_id = &job.id;
        if let Err(err) = self.transport.mark_processing(job_id).await {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to mark job {job_id} as processing, error: {err:?}"
            );
            self.requeue(&job).await;
            return;
        }

        match self.transport.distribute_job(job_id).await {
            Ok(()) => tracing::debug!(%job_id, "Distributed job {job_id}"),
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to distribute job {job_id}, error: {err:?}"
                );
                let _ = release(&self.transport, &self.capacity_freed, job_id)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to release job {job_id}, error: {err:?}"
                        )
                    });
                self.requeue(&job).await;
            }
        }
    }

    async fn requeue(&self, job: &Job) {
        let job_id = &job.id;
        let _ = self.transport.store_job(job).await.inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to requeue job {job_id}, error: {err:?}"
            )
        });
    }

    /// Returns `false` if cancelled before capacity became available.
    async fn wait_for_capacity(&mut self, cancellation_token: &CancellationToken) -> bool {
        let capacity_freed = self.capacity_freed.clone();
        loop {
            if cancellation_token.is_cancelled() {
                return false;
            }
            let notified = capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.has_capacity().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(?err, "Failed to read processing count, error: {err:?}")
                }
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => return false,
                _ = &mut notified => {}
                Ok(()) = self.total_capacity.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn pause(&self, cancellation_token: &CancellationToken) {
        tokio::select! {
            _ = cancellation_token.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

async fn blocking_pop_ready_job<T: Transport>(
    transport: &T,
    wait: Duration,
    cancellation_token: &CancellationToken,
) -> Result<Option<Job>, SchedulerError> {
    while !cancellation_token.is_cancelled() {
        if let Some((_, job)) = pop_ready_job(transport, wait).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

/// Pops the lowest priority ready job, waiting at most `wait` for one.
///
/// If the record cannot be read the id is put back into the index, unless the record is gone.
async fn pop_ready_job<T: Transport>(
    transport: &T,
    wait: Duration,
) -> Result<Option<(ReadyJobId, Job)>, SchedulerError> {
    let Some(ready) = transport.pop_ready_job_id(wait).await? else {
        return Ok(None);
    };
    match transport.load_job(&ready.id).await {
        Ok(Some(job)) => Ok(Some((ready, job))),
        Ok(None) => Err(SchedulerError::JobNotFound(ready.id)),
        Err(err) => {
            restore(transport, &ready).await;
            Err(err.into())
        }
    }
}

async fn restore<T: Transport>(transport: &T, ready: &ReadyJobId) {
    let job_id = &ready.id;
    let _ = transport
        .restore_ready_job_id(ready)
        .await
        .inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to return job {job_id} to the ready index, error: {err:?}"
            )
        });
}

async fn release<T: Transport>(
    transport: &T,
    capacity_freed: &Notify,
    job_id: &JobId,
) -> Result<bool, TransportError> {
    let released = transport.unmark_processing(job_id).await?;
    if released {
        capacity_freed.notify_one();
    }
    Ok(released)
}
