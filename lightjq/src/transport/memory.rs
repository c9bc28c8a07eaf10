//! Provides an in memory implementation of [`Transport`].
//!
//! Currently this is provided for testing purposes and for running a master without a broker in
//! a single process. It is not designed for use in a production system.
//!
//! Messages are kept encoded, exactly as a broker would hold them, so the producer and worker
//! helpers on [`InMemoryTransport`] exercise the same codec as a real deployment.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use fxhash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    codec,
    job::{Job, JobId},
    ping::Ping,
    result::JobResult,
};

use super::{BoxedStream, IntakeMessage, IntakeQueue, ReadyJobId, Transport, TransportError};

const PING_BUFFER: usize = 1024;

/// An in memory implementation of [`Transport`].
///
/// Clones share the same state, so one clone can play the master while another plays the
/// producers and workers.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<RwLock<State>>,
    signals: Arc<Signals>,
    pings: broadcast::Sender<Vec<u8>>,
}

#[derive(Default)]
struct State {
    intake: FxHashMap<IntakeQueue, VecDeque<Vec<u8>>>,
    records: FxHashMap<JobId, Vec<u8>>,
    index: PriorityIndex,
    processing: FxHashSet<JobId>,
    dispatched: VecDeque<JobId>,
    published: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Signals {
    intake: Notify,
    ready: Notify,
}

/// Ids ordered by score, ties broken by insertion order.
#[derive(Default)]
struct PriorityIndex {
    entries: BTreeMap<(i64, u64), JobId>,
    positions: FxHashMap<JobId, (i64, u64)>,
    sequence: u64,
}

impl PriorityIndex {
    fn insert(&mut self, id: JobId, score: i64) {
        if let Some(position) = self.positions.remove(&id) {
            self.entries.remove(&position);
        }
        let position = (score, self.sequence);
        self.sequence += 1;
        self.positions.insert(id.clone(), position);
        self.entries.insert(position, id);
    }

    /// Inserts `id` unless it is already indexed. Returns whether it was inserted.
    fn insert_absent(&mut self, id: &JobId, score: i64) -> bool {
        if self.positions.contains_key(id) {
            return false;
        }
        self.insert(id.clone(), score);
        true
    }

    fn pop_min(&mut self) -> Option<ReadyJobId> {
        let ((score, _), id) = self.entries.pop_first()?;
        self.positions.remove(&id);
        Some(ReadyJobId {
            id,
            score: score as f64,
        })
    }

    fn ids(&self) -> Vec<JobId> {
        self.entries.values().cloned().collect()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            state: Default::default(),
            signals: Default::default(),
            pings: broadcast::channel(PING_BUFFER).0,
        }
    }
}

impl InMemoryTransport {
    /// Creates a new instance of [`InMemoryTransport`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, TransportError> {
        self.state.read().map_err(|_| TransportError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, TransportError> {
        self.state.write().map_err(|_| TransportError::BadState)
    }

    /// Polls `take` until it yields a value or `wait` elapses, waking up whenever `notify` fires.
    async fn wait_for<R>(
        &self,
        notify: &Notify,
        wait: Duration,
        mut take: impl FnMut(&mut State) -> Option<R> + Send,
    ) -> Result<Option<R>, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let taken = {
                let mut state = self.write()?;
                take(&mut *state)
            };
            if taken.is_some() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Pushes an encoded message onto the intake queue it belongs to, as a producer or worker
    /// would.
    pub fn push_intake<M>(&self, message: &M) -> Result<(), TransportError>
    where
        M: IntakeMessage + Serialize,
    {
        self.push_raw_intake(M::QUEUE, codec::encode(message)?)
    }

    /// Pushes an arbitrary payload onto an intake queue.
    pub fn push_raw_intake(
        &self,
        queue: IntakeQueue,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.write()?
            .intake
            .entry(queue)
            .or_default()
            .push_back(payload);
        self.signals.intake.notify_waiters();
        Ok(())
    }

    /// Publishes a heartbeat as the given worker would.
    pub fn publish_ping(&self, ping: &Ping) -> Result<(), TransportError> {
        self.publish_raw_ping(codec::encode(ping)?);
        Ok(())
    }

    pub fn publish_raw_ping(&self, payload: Vec<u8>) {
        // No subscribers is not an error for a pub/sub channel.
        let _ = self.pings.send(payload);
    }

    /// The ids pushed onto the global dispatch queue, oldest first.
    pub fn dispatched(&self) -> Result<Vec<JobId>, TransportError> {
        Ok(self.read()?.dispatched.iter().cloned().collect())
    }

    /// Claims the oldest dispatched id, as a worker would.
    pub fn claim_dispatched(&self) -> Result<Option<JobId>, TransportError> {
        Ok(self.write()?.dispatched.pop_front())
    }

    /// The results published to producers, oldest first.
    pub fn published_results(&self) -> Result<Vec<JobResult>, TransportError> {
        self.read()?
            .published
            .iter()
            .map(|payload| codec::decode(payload))
            .collect()
    }

    /// The ids in the priority index, in the order they will be popped.
    pub fn ready_job_ids(&self) -> Result<Vec<JobId>, TransportError> {
        Ok(self.read()?.index.ids())
    }

    pub fn is_processing(&self, id: &JobId) -> Result<bool, TransportError> {
        Ok(self.read()?.processing.contains(id))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn pop_intake(
        &self,
        queue: IntakeQueue,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.wait_for(&self.signals.intake, wait, |state| {
            state
                .intake
                .get_mut(&queue)
                .and_then(|messages| messages.pop_front())
        })
        .await
    }

    async fn subscribe_pings(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<BoxedStream<Vec<u8>>, TransportError> {
        let mut receiver = self.pings.subscribe();
        Ok(Box::pin(stream! {
            loop {
                let message = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    message = receiver.recv() => message,
                };
                match message {
                    Ok(payload) => yield Ok(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Ping subscriber lagged behind, skipped {skipped} pings");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn store_job(&self, job: &Job) -> Result<(), TransportError> {
        let payload = codec::encode(job)?;
        {
            let mut state = self.write()?;
            state.records.insert(job.id.clone(), payload);
            state.index.insert(job.id.clone(), i64::from(job.priority));
        }
        self.signals.ready.notify_waiters();
        Ok(())
    }

    async fn pop_ready_job_id(&self, wait: Duration) -> Result<Option<ReadyJobId>, TransportError> {
        self.wait_for(&self.signals.ready, wait, |state| state.index.pop_min())
            .await
    }

    async fn restore_ready_job_id(&self, ready: &ReadyJobId) -> Result<(), TransportError> {
        let inserted = self
            .write()?
            .index
            .insert_absent(&ready.id, ready.score as i64);
        if inserted {
            self.signals.ready.notify_waiters();
        }
        Ok(())
    }

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
        let payload = self.read()?.records.get(id).cloned();
        payload.map(|payload| codec::decode(&payload)).transpose()
    }

    async fn take_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
        let payload = self.write()?.records.remove(id);
        payload.map(|payload| codec::decode(&payload)).transpose()
    }

    async fn mark_processing(&self, id: &JobId) -> Result<(), TransportError> {
        self.write()?.processing.insert(id.clone());
        Ok(())
    }

    async fn unmark_processing(&self, id: &JobId) -> Result<bool, TransportError> {
        Ok(self.write()?.processing.remove(id))
    }

    async fn processing_count(&self) -> Result<usize, TransportError> {
        Ok(self.read()?.processing.len())
    }

    async fn distribute_job(&self, id: &JobId) -> Result<(), TransportError> {
        self.write()?.dispatched.push_back(id.clone());
        Ok(())
    }

    async fn publish_result(&self, result: &JobResult) -> Result<(), TransportError> {
        let payload = codec::encode(result)?;
        self.write()?.published.push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use futures::StreamExt;

    use crate::{
        test_suite,
        transport::TransportExt,
        worker::{WorkerId, WorkerRegistration},
    };

    use super::*;

    test_suite!(for: InMemoryTransport::new());

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn intake_decodes_messages_in_order() {
        let transport = InMemoryTransport::new();
        let token = CancellationToken::new();
        for id in ["worker-1", "worker-2"] {
            transport
                .push_intake(&WorkerRegistration {
                    id: id.into(),
                    worker_name: "host".to_owned(),
                    processes: 2,
                })
                .unwrap();
        }

        let mut stream = transport.worker_registrations(WAIT, token.clone());

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, WorkerId::from("worker-1"));
        assert_eq!(second.id, WorkerId::from("worker-2"));
    }

    #[tokio::test]
    async fn intake_yields_decode_errors_and_carries_on() {
        let transport = InMemoryTransport::new();
        let token = CancellationToken::new();
        transport
            .push_raw_intake(IntakeQueue::JobRegistrations, vec![0xc1])
            .unwrap();
        transport
            .push_intake(&crate::job::JobRegistration::from(&Job::new("job-1", "noop")))
            .unwrap();

        let mut stream = transport.job_registrations(WAIT, token.clone());

        assert_matches!(stream.next().await, Some(Err(TransportError::Decode(_))));
        let job = stream.next().await.unwrap().unwrap();
        assert_eq!(job.id, JobId::from("job-1"));
        assert_eq!(job.current_retry, 0);
    }

    #[tokio::test]
    async fn intake_ends_on_cancellation() {
        let transport = InMemoryTransport::new();
        let token = CancellationToken::new();
        let mut stream = transport.results(WAIT, token.clone());

        token.cancel();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn pings_are_broadcast_to_every_subscriber() {
        let transport = InMemoryTransport::new();
        let token = CancellationToken::new();
        let mut first = transport.subscribe_pings(token.clone()).await.unwrap();
        let mut second = transport.subscribe_pings(token.clone()).await.unwrap();

        transport
            .publish_ping(&Ping {
                worker_id: "worker-1".into(),
            })
            .unwrap();

        for stream in [&mut first, &mut second] {
            let payload = stream.next().await.unwrap().unwrap();
            let ping: Ping = codec::decode(&payload).unwrap();
            assert_eq!(ping.worker_id, WorkerId::from("worker-1"));
        }

        token.cancel();
        assert!(first.next().await.is_none());
    }

    #[tokio::test]
    async fn dispatched_ids_can_be_claimed_in_order() {
        let transport = InMemoryTransport::new();
        transport.distribute_job(&"job-1".into()).await.unwrap();
        transport.distribute_job(&"job-2".into()).await.unwrap();

        assert_eq!(
            transport.claim_dispatched().unwrap(),
            Some(JobId::from("job-1"))
        );
        assert_eq!(transport.dispatched().unwrap(), vec![JobId::from("job-2")]);
    }

    #[tokio::test]
    async fn badstate_errors() {
        let transport = InMemoryTransport::new();
        tokio::task::spawn({
            let transport = transport.clone();
            async move {
                let _guard = transport.state.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        let job_id = JobId::from("job-1");
        assert_matches!(
            transport.store_job(&Job::new("job-1", "noop")).await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport.load_job(&job_id).await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport.take_job(&job_id).await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport.mark_processing(&job_id).await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport.processing_count().await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport.pop_ready_job_id(WAIT).await,
            Err(TransportError::BadState)
        );
        assert_matches!(
            transport
                .restore_ready_job_id(&ReadyJobId {
                    id: job_id.clone(),
                    score: 0.0,
                })
                .await,
            Err(TransportError::BadState)
        );
    }
}
