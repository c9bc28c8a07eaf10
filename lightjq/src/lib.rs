//! The master side of a distributed job queue.
//!
//! Producers push job registrations onto the broker, workers register themselves with a
//! capacity, claim job ids from a global dispatch queue and report a result for every attempt.
//! The [`Master`] ties this together:
//!
//! - it stores submitted jobs in a priority index,
//! - it hands the lowest priority ready job to the workers whenever they have spare capacity,
//! - it finalizes or retries jobs as results come in,
//! - and it withdraws the capacity of workers that stop sending heartbeats.
//!
//! All state lives on the broker behind a [`Transport`](transport::Transport). An in memory
//! implementation is provided in [`transport::memory`].
//!
//! ```no_run
//! use lightjq::prelude::*;
//! use lightjq::transport::memory::InMemoryTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), MasterError> {
//! let token = CancellationToken::new();
//! Master::new(InMemoryTransport::new())
//!     .with_config(MasterConfig::default())
//!     .run(token)
//!     .await
//! # }
//! ```
use fxhash::FxHashMap;
use futures::StreamExt;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

pub mod codec;
pub mod config;
pub mod job;
pub mod ping;
pub mod prelude;
pub mod ratelimit;
pub mod result;
pub mod scheduler;
pub mod transport;
pub mod worker;

use config::MasterConfig;
use job::Job;
use ping::{PingChecker, PingOutcome};
use result::JobResult;
use scheduler::{Scheduler, SchedulerError};
use transport::{BoxedStream, Transport, TransportError, TransportExt};
use worker::{Worker, WorkerId, WorkerRegistration};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the broker")]
    Transport(#[from] TransportError),
}

/// Every event the owner loop applies to the scheduler.
#[derive(Debug)]
enum Message {
    RegisterWorker(WorkerRegistration),
    RegisterJob(Job),
    Result(JobResult),
    WorkerLost { worker_id: WorkerId, generation: u64 },
}

pub struct Master<T: Transport> {
    transport: T,
    config: MasterConfig,
}

impl<T: Transport> Master<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: Default::default(),
        }
    }

    pub fn with_config(self, config: MasterConfig) -> Self {
        Self { config, ..self }
    }

    /// Runs the master until `cancellation_token` is cancelled.
    ///
    /// The intake loops, the dispatcher and the ping checkers each run on their own task. Worker
    /// and job registrations, results and evictions are funnelled through a single owner loop,
    /// which is the only place the scheduler is mutated. On cancellation every loop finishes the
    /// broker call it is in, messages already popped are still applied, and only then does this
    /// return.
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), MasterError> {
        let processing = self.transport.processing_count().await?;
        tracing::info!(processing, "Starting master with {processing} jobs in flight");

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(self.transport.clone(), self.config);
        let mut checkers = PingCheckers::new(
            self.transport.clone(),
            self.config,
            sender.clone(),
            cancellation_token.clone(),
        );

        let wait = self.config.intake_wait;
        let handles = vec![
            forward(
                "worker registration",
                self.transport
                    .worker_registrations(wait, cancellation_token.clone()),
                sender.clone(),
                Message::RegisterWorker,
            ),
            forward(
                "job registration",
                self.transport
                    .job_registrations(wait, cancellation_token.clone()),
                sender.clone(),
                Message::RegisterJob,
            ),
            forward(
                "result",
                self.transport.results(wait, cancellation_token.clone()),
                sender.clone(),
                Message::Result,
            ),
            tokio::spawn(scheduler.dispatcher().run(cancellation_token.clone())),
        ];
        drop(sender);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                Some(message) = receiver.recv() => {
                    handle(&mut scheduler, &mut checkers, message).await;
                }
                Some(joined) = checkers.tasks.join_next() => checkers.reap(joined),
            }
        }

        tracing::info!("Shutting down master");
        let joined = futures::future::join_all(handles).await;
        while let Ok(message) = receiver.try_recv() {
            handle(&mut scheduler, &mut checkers, message).await;
        }
        while let Some(joined) = checkers.tasks.join_next().await {
            checkers.reap(joined);
        }

        joined
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map_err(|err| {
                tracing::error!(?err, "Master task failed during shutdown, error: {err:?}");
                MasterError::GracefulShutdownFailed
            })?;
        Ok(())
    }
}

async fn handle<T: Transport>(
    scheduler: &mut Scheduler<T>,
    checkers: &mut PingCheckers<T>,
    message: Message,
) {
    match message {
        Message::RegisterWorker(registration) => {
            let worker = match Worker::try_from(registration) {
                Ok(worker) => worker,
                Err(err) => {
                    tracing::warn!(?err, "Rejecting worker registration, error: {err}");
                    return;
                }
            };
            let worker_id = worker.id.clone();
            let processes = worker.max_processes.get();
            if scheduler.add_worker(worker).is_some() {
                tracing::info!(%worker_id, processes, "Worker {worker_id} re-registered");
            } else {
                tracing::info!(%worker_id, processes, "Worker {worker_id} registered");
            }
            checkers.start(worker_id);
        }
        Message::RegisterJob(job) => {
            let job_id = &job.id;
            match scheduler.add_job(&job).await {
                Ok(()) => tracing::debug!(%job_id, "Job registered {job_id}"),
                Err(err) => tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to register job {job_id}, error: {err:?}"
                ),
            }
        }
        Message::Result(result) => {
            let job_id = result.job_id().clone();
            match scheduler.process_result(result).await {
                Ok(()) => {}
                Err(err @ SchedulerError::JobNotFound(_)) => {
                    tracing::warn!(?err, %job_id, "Dropping result for job {job_id}, error: {err}")
                }
                Err(err) => tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to process result for job {job_id}, error: {err:?}"
                ),
            }
        }
        Message::WorkerLost {
            worker_id,
            generation,
        } => {
            if !checkers.finish(&worker_id, generation) {
                tracing::debug!(%worker_id, "Ignoring eviction from superseded ping checker");
                return;
            }
            if let Some(worker) = scheduler.remove_worker(&worker_id) {
                let capacity = scheduler.total_capacity();
                tracing::info!(
                    %worker_id,
                    processes = worker.max_processes.get(),
                    capacity,
                    "Worker {worker_id} lost, remaining capacity {capacity}"
                );
            }
        }
    }
}

/// Forwards an intake stream to the owner loop, logging and skipping messages that fail.
fn forward<M, F>(
    kind: &'static str,
    mut stream: BoxedStream<M>,
    sender: mpsc::UnboundedSender<Message>,
    wrap: F,
) -> JoinHandle<()>
where
    M: Send + 'static,
    F: Fn(M) -> Message + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => {
                    if sender.send(wrap(message)).is_err() {
                        break;
                    }
                }
                Err(err @ TransportError::Decode(_)) => {
                    tracing::warn!(?err, "Dropping invalid {kind} message, error: {err}")
                }
                Err(err) => tracing::error!(?err, "Failed to read {kind} queue, error: {err:?}"),
            }
        }
        tracing::debug!("Shutting down {kind} intake");
    })
}

/// The running ping checkers, one per registered worker.
///
/// Each checker is tagged with a generation so that an eviction from a checker that was replaced
/// by a re-registration is not applied to the new registration.
struct PingCheckers<T: Transport> {
    transport: T,
    config: MasterConfig,
    sender: mpsc::UnboundedSender<Message>,
    cancellation_token: CancellationToken,
    running: FxHashMap<WorkerId, (u64, CancellationToken)>,
    generation: u64,
    tasks: JoinSet<PingOutcome>,
}

impl<T: Transport> PingCheckers<T> {
    fn new(
        transport: T,
        config: MasterConfig,
        sender: mpsc::UnboundedSender<Message>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            sender,
            cancellation_token,
            running: Default::default(),
            generation: 0,
            tasks: JoinSet::new(),
        }
    }

    fn start(&mut self, worker_id: WorkerId) {
        self.generation += 1;
        let generation = self.generation;
        let token = self.cancellation_token.child_token();
        if let Some((_, previous)) = self
            .running
            .insert(worker_id.clone(), (generation, token.clone()))
        {
            previous.cancel();
        }

        let checker = PingChecker::new(
            self.transport.clone(),
            worker_id,
            self.config.ping_drop_interval,
        );
        let sender = self.sender.clone();
        self.tasks.spawn(checker.run(token, move |failure| {
            let _ = sender.send(Message::WorkerLost {
                worker_id: failure.worker_id,
                generation,
            });
        }));
    }

    /// Forgets the checker if `generation` is the current one for the worker.
    fn finish(&mut self, worker_id: &WorkerId, generation: u64) -> bool {
        match self.running.get(worker_id) {
            Some((current, _)) if *current == generation => {
                self.running.remove(worker_id);
                true
            }
            _ => false,
        }
    }

    fn reap(&self, joined: Result<PingOutcome, tokio::task::JoinError>) {
        if let Err(err) = joined {
            tracing::error!(?err, "Ping checker failed, error: {err:?}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{
        job::{JobId, JobRegistration},
        ping::Ping,
        result::FailureReason,
        transport::{memory::InMemoryTransport, IntakeQueue},
    };

    use super::*;

    const SHORT_DROP_INTERVAL: Duration = Duration::from_millis(300);

    fn config() -> MasterConfig {
        MasterConfig::default()
            .with_intake_wait(Duration::from_millis(20))
            .with_dispatch_poll_interval(Duration::from_millis(20))
    }

    fn start(
        transport: &InMemoryTransport,
    ) -> (CancellationToken, JoinHandle<Result<(), MasterError>>) {
        start_with(transport, config())
    }

    fn start_with(
        transport: &InMemoryTransport,
        config: MasterConfig,
    ) -> (CancellationToken, JoinHandle<Result<(), MasterError>>) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            Master::new(transport.clone())
                .with_config(config)
                .run(token.clone()),
        );
        (token, handle)
    }

    fn register_worker(transport: &InMemoryTransport, id: &str, processes: u32) {
        transport
            .push_intake(&WorkerRegistration {
                id: id.into(),
                worker_name: "host".to_owned(),
                processes,
            })
            .unwrap();
    }

    fn submit(transport: &InMemoryTransport, job: Job) {
        transport
            .push_intake(&JobRegistration::from(&job))
            .unwrap();
    }

    fn report(transport: &InMemoryTransport, result: JobResult) {
        transport.push_intake(&result).unwrap();
    }

    async fn eventually<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn jobs_flow_from_registration_to_result() {
        let transport = InMemoryTransport::new();
        let (token, handle) = start(&transport);

        submit(&transport, Job::new("job-1", "resize").with_priority(2));
        submit(
            &transport,
            Job::new("job-2", "resize")
                .with_priority(1)
                .with_max_retry(1)
                .with_keep_result(true),
        );
        eventually(|| transport.ready_job_ids().unwrap().len() == 2).await;
        register_worker(&transport, "worker-1", 1);

        eventually(|| transport.dispatched().unwrap().len() == 1).await;
        assert_eq!(transport.dispatched().unwrap(), vec![JobId::from("job-2")]);

        report(
            &transport,
            JobResult::failure("job-2", FailureReason::ServerIssue, "retry me"),
        );
        eventually(|| transport.dispatched().unwrap().len() == 2).await;
        let retried = transport.load_job(&"job-2".into()).await.unwrap().unwrap();
        assert_eq!(retried.current_retry, 1);

        for reported in 1..3 {
            eventually(|| transport.dispatched().unwrap().len() > reported).await;
            let job_id = transport.dispatched().unwrap()[reported].clone();
            report(
                &transport,
                JobResult::success(job_id.clone(), rmpv::Value::from(job_id.as_str())),
            );
        }
        eventually(|| transport.published_results().unwrap().len() == 2).await;

        let mut published = transport.published_results().unwrap();
        published.sort_by(|a, b| a.job_id().cmp(b.job_id()));
        assert_matches::assert_matches!(
            published.as_slice(),
            [JobResult::Success(first), JobResult::Success(second)]
                if first.job_id.as_str() == "job-1"
                    && first.result == rmpv::Value::Nil
                    && second.result == rmpv::Value::from("job-2")
        );
        assert!(transport.ready_job_ids().unwrap().is_empty());
        assert!(!transport.is_processing(&"job-2".into()).unwrap());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_messages_are_skipped() {
        let transport = InMemoryTransport::new();
        let (token, handle) = start(&transport);

        transport
            .push_raw_intake(IntakeQueue::WorkerRegistrations, vec![0xc1])
            .unwrap();
        register_worker(&transport, "worker-0", 0);
        register_worker(&transport, "worker-1", 1);
        transport
            .push_raw_intake(IntakeQueue::JobRegistrations, b"not a job".to_vec())
            .unwrap();
        submit(&transport, Job::new("job-1", "resize"));

        eventually(|| transport.dispatched().unwrap().len() == 1).await;

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_worker_loses_its_capacity() {
        let transport = InMemoryTransport::new();
        let (token, handle) =
            start_with(&transport, config().with_ping_drop_interval(SHORT_DROP_INTERVAL));

        register_worker(&transport, "worker-1", 1);
        tokio::time::sleep(SHORT_DROP_INTERVAL * 2).await;
        submit(&transport, Job::new("job-1", "resize"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(transport.dispatched().unwrap().is_empty());
        assert_eq!(transport.ready_job_ids().unwrap(), vec![JobId::from("job-1")]);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pinging_worker_keeps_its_capacity() {
        let transport = InMemoryTransport::new();
        let (token, handle) =
            start_with(&transport, config().with_ping_drop_interval(SHORT_DROP_INTERVAL));
        let pinger = tokio::spawn({
            let transport = transport.clone();
            async move {
                loop {
                    transport
                        .publish_ping(&Ping {
                            worker_id: "worker-1".into(),
                        })
                        .unwrap();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        });

        register_worker(&transport, "worker-1", 1);
        tokio::time::sleep(SHORT_DROP_INTERVAL * 2).await;
        submit(&transport, Job::new("job-1", "resize"));

        eventually(|| transport.dispatched().unwrap().len() == 1).await;

        pinger.abort();
        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn messages_popped_before_shutdown_are_applied() {
        let transport = InMemoryTransport::new();
        let (token, handle) = start(&transport);
        tokio::time::sleep(Duration::from_millis(50)).await;

        submit(&transport, Job::new("job-1", "resize"));
        token.cancel();
        handle.await.unwrap().unwrap();

        let stored = transport.load_job(&"job-1".into()).await.unwrap();
        let queued = transport
            .pop_intake(IntakeQueue::JobRegistrations, Duration::ZERO)
            .await
            .unwrap();
        assert!(stored.is_some() || queued.is_some());
    }
}
