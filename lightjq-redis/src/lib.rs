//! A [`Transport`] backed by Redis.
//!
//! With the default namespace `jq` the broker resources are laid out as follows:
//!
//! | resource                    | key                | type       |
//! |-----------------------------|--------------------|------------|
//! | worker registration queue   | `jq:workerRegister` | list      |
//! | job registration queue      | `jq:jobList`       | list       |
//! | result intake queue         | `jq:resultQueue`   | list       |
//! | global dispatch queue       | `jq:globalQueue`   | list       |
//! | result publish channel      | `jq:result`        | pub/sub    |
//! | ping channel                | `jq:ping`          | pub/sub    |
//! | priority index              | `jq:scoredJobSet`  | sorted set |
//! | job record                  | `jq:job:<id>`      | string     |
//! | processing set              | `jq:processing`    | set        |
//!
//! Ordinary commands share a [`ConnectionManager`]. Blocking pops tie up the connection they are
//! sent on, so each one runs on a dedicated connection borrowed from a small pool. Ping
//! subscribers share one pub/sub connection.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use lightjq::{
    job::{Job, JobId},
    result::JobResult,
    transport::{BoxedStream, IntakeQueue, ReadyJobId, Transport, TransportError},
};
use redis::{
    aio::{ConnectionManager, MultiplexedConnection, PubSub},
    AsyncCommands, Client, IntoConnectionInfo, RedisError, ToRedisArgs,
};
use tokio::{
    sync::{broadcast, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_NAMESPACE: &str = "jq";

/// The shortest timeout sent with a blocking pop. A zero timeout would block forever.
const MIN_BLOCKING_TIMEOUT: f64 = 0.01;

const PING_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    blocking: BlockingConnections,
    pings: PingFanOut,
    namespace: NameSpace,
}

fn map_err(error: RedisError) -> TransportError {
    TransportError::Broker(Box::new(error))
}

impl RedisTransport {
    pub async fn from_url(redis_url: &str, namespace: impl ToString) -> Result<Self, TransportError> {
        Self::connect(redis_url, namespace).await
    }

    pub async fn connect(
        info: impl IntoConnectionInfo,
        namespace: impl ToString,
    ) -> Result<Self, TransportError> {
        let client = Client::open(info).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client.clone())
                .await
                .map_err(map_err)?,
            blocking: BlockingConnections::new(client.clone()),
            pings: PingFanOut::new(),
            client,
            namespace: NameSpace(namespace.to_string()),
        })
    }

    async fn blocking_query<T>(&self, cmd: redis::Cmd) -> Result<T, TransportError>
    where
        T: redis::FromRedisValue,
    {
        let mut conn = self.blocking.acquire().await?;
        let result = cmd.query_async(&mut conn).await.map_err(map_err)?;
        self.blocking.release(conn);
        Ok(result)
    }
}

fn blocking_timeout(wait: Duration) -> f64 {
    wait.as_secs_f64().max(MIN_BLOCKING_TIMEOUT)
}

/// Idle connections for blocking commands.
///
/// A connection is only returned to the pool after its command completed, so a connection whose
/// command failed is dropped rather than reused.
#[derive(Clone)]
struct BlockingConnections {
    client: Client,
    idle: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl BlockingConnections {
    fn new(client: Client) -> Self {
        Self {
            client,
            idle: Default::default(),
        }
    }

    async fn acquire(&self) -> Result<MultiplexedConnection, TransportError> {
        let idle = self
            .idle
            .lock()
            .map_err(|_| TransportError::BadState)?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                tracing::debug!("Opening dedicated redis connection for blocking commands");
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(map_err)
            }
        }
    }

    fn release(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// A single pub/sub connection on the ping channel shared by every subscriber.
///
/// The listener is started by the first subscription and restarted by the next one after its
/// connection was lost. It is aborted once the last clone of the transport is dropped.
#[derive(Clone)]
struct PingFanOut {
    sender: broadcast::Sender<Vec<u8>>,
    listener: Arc<AsyncMutex<Option<Listener>>>,
}

struct Listener(JoinHandle<()>);

impl Drop for Listener {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl PingFanOut {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(PING_BUFFER).0,
            listener: Default::default(),
        }
    }

    async fn subscribe(
        &self,
        client: &Client,
        channel: String,
    ) -> Result<broadcast::Receiver<Vec<u8>>, TransportError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().map_or(true, |running| running.0.is_finished()) {
            let mut pubsub = client.get_async_pubsub().await.map_err(map_err)?;
            pubsub.subscribe(&channel).await.map_err(map_err)?;
            tracing::debug!(%channel, "Subscribed to ping channel {channel}");
            *listener = Some(Listener(tokio::spawn(Self::listen(
                pubsub,
                self.sender.clone(),
            ))));
        }
        Ok(self.sender.subscribe())
    }

    async fn listen(pubsub: PubSub, sender: broadcast::Sender<Vec<u8>>) {
        let mut messages = Box::pin(pubsub.into_on_message());
        while let Some(message) = messages.next().await {
            match message.get_payload::<Vec<u8>>() {
                Ok(payload) => {
                    // Fails only while nobody is subscribed.
                    let _ = sender.send(payload);
                }
                Err(err) => tracing::warn!(?err, "Failed to read ping payload, error: {err}"),
            }
        }
        tracing::warn!("Ping subscription closed");
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn key<'a>(&'a self, kind: KeyType<'a>) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }

    fn intake(&self, queue: IntakeQueue) -> NameSpacedKey<'_> {
        self.key(match queue {
            IntakeQueue::WorkerRegistrations => KeyType::WorkerRegister,
            IntakeQueue::JobRegistrations => KeyType::JobList,
            IntakeQueue::Results => KeyType::ResultQueue,
        })
    }

    fn job<'a>(&'a self, id: &'a JobId) -> NameSpacedKey<'a> {
        self.key(KeyType::Job(id))
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::WorkerRegister => write!(f, ":workerRegister"),
            KeyType::JobList => write!(f, ":jobList"),
            KeyType::ResultQueue => write!(f, ":resultQueue"),
            KeyType::GlobalQueue => write!(f, ":globalQueue"),
            KeyType::Result => write!(f, ":result"),
            KeyType::Ping => write!(f, ":ping"),
            KeyType::ScoredJobSet => write!(f, ":scoredJobSet"),
            KeyType::Job(id) => write!(f, ":job:{}", id),
            KeyType::Processing => write!(f, ":processing"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

#[derive(Clone, Copy)]
enum KeyType<'a> {
    WorkerRegister,
    JobList,
    ResultQueue,
    GlobalQueue,
    Result,
    Ping,
    ScoredJobSet,
    Job(&'a JobId),
    Processing,
}

#[async_trait]
impl Transport for RedisTransport {
    async fn pop_intake(
        &self,
        queue: IntakeQueue,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(self.namespace.intake(queue))
            .arg(blocking_timeout(wait));
        let popped: Option<(String, Vec<u8>)> = self.blocking_query(cmd).await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn subscribe_pings(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<BoxedStream<Vec<u8>>, TransportError> {
        let mut receiver = self
            .pings
            .subscribe(&self.client, self.namespace.key(KeyType::Ping).to_string())
            .await?;

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
        let payload = lightjq::codec::encode(job)?;
        redis::pipe()
            .atomic()
            .set(self.namespace.job(&job.id), payload)
            .ignore()
            .zadd(
                self.namespace.key(KeyType::ScoredJobSet),
                job.id.as_str(),
                job.priority_score(),
            )
            .ignore()
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)
    }

    async fn pop_ready_job_id(&self, wait: Duration) -> Result<Option<ReadyJobId>, TransportError> {
        let mut cmd = redis::cmd("BZPOPMIN");
        cmd.arg(self.namespace.key(KeyType::ScoredJobSet))
            .arg(blocking_timeout(wait));
        let popped: Option<(String, String, f64)> = self.blocking_query(cmd).await?;
        Ok(popped.map(|(_, id, score)| ReadyJobId {
            id: id.into(),
            score,
        }))
    }

    async fn restore_ready_job_id(&self, ready: &ReadyJobId) -> Result<(), TransportError> {
        redis::cmd("ZADD")
            .arg(self.namespace.key(KeyType::ScoredJobSet))
            .arg("NX")
            .arg(ready.score)
            .arg(ready.id.as_str())
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)
    }

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
        let payload: Option<Vec<u8>> = self
            .conn
            .clone()
            .get(self.namespace.job(id))
            .await
            .map_err(map_err)?;
        payload
            .map(|payload| lightjq::codec::decode(&payload))
            .transpose()
    }

    async fn take_job(&self, id: &JobId) -> Result<Option<Job>, TransportError> {
        let payload: Option<Vec<u8>> = redis::cmd("GETDEL")
            .arg(self.namespace.job(id))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        payload
            .map(|payload| lightjq::codec::decode(&payload))
            .transpose()
    }

    async fn mark_processing(&self, id: &JobId) -> Result<(), TransportError> {
        self.conn
            .clone()
            .sadd(self.namespace.key(KeyType::Processing), id.as_str())
            .await
            .map_err(map_err)
    }

    async fn unmark_processing(&self, id: &JobId) -> Result<bool, TransportError> {
        let removed: usize = self
            .conn
            .clone()
            .srem(self.namespace.key(KeyType::Processing), id.as_str())
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn processing_count(&self) -> Result<usize, TransportError> {
        self.conn
            .clone()
            .scard(self.namespace.key(KeyType::Processing))
            .await
            .map_err(map_err)
    }

    async fn distribute_job(&self, id: &JobId) -> Result<(), TransportError> {
        self.conn
            .clone()
            .rpush(self.namespace.key(KeyType::GlobalQueue), id.as_str())
            .await
            .map_err(map_err)
    }

    async fn publish_result(&self, result: &JobResult) -> Result<(), TransportError> {
        let payload = lightjq::codec::encode(result)?;
        self.conn
            .clone()
            .publish(self.namespace.key(KeyType::Result), payload)
            .await
            .map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use lightjq::test_suite;

    const DEFAULT_URL: &str = "redis://127.0.0.1";

    fn unique_namespace() -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "lightjq:test:{}:{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    test_suite!(
        attrs: [tokio::test, ignore = "requires a running redis server"],
        args: (),
        transport: RedisTransport::from_url(DEFAULT_URL, unique_namespace()).await.unwrap()
    );

    #[test]
    fn keys_follow_layout() {
        let namespace = NameSpace(DEFAULT_NAMESPACE.to_owned());
        let job_id = JobId::from("abc");

        assert_eq!(namespace.job(&job_id).to_string(), "jq:job:abc");
        assert_eq!(
            namespace.key(KeyType::ScoredJobSet).to_string(),
            "jq:scoredJobSet"
        );
        assert_eq!(
            namespace.key(KeyType::GlobalQueue).to_string(),
            "jq:globalQueue"
        );
        assert_eq!(namespace.key(KeyType::Processing).to_string(), "jq:processing");
        assert_eq!(namespace.key(KeyType::Ping).to_string(), "jq:ping");
        assert_eq!(namespace.key(KeyType::Result).to_string(), "jq:result");
        assert_eq!(
            namespace
                .intake(IntakeQueue::WorkerRegistrations)
                .to_string(),
            "jq:workerRegister"
        );
        assert_eq!(
            namespace.intake(IntakeQueue::JobRegistrations).to_string(),
            "jq:jobList"
        );
        assert_eq!(
            namespace.intake(IntakeQueue::Results).to_string(),
            "jq:resultQueue"
        );
    }

    #[test]
    fn blocking_timeout_never_zero() {
        assert_eq!(blocking_timeout(Duration::ZERO), MIN_BLOCKING_TIMEOUT);
        assert_eq!(blocking_timeout(Duration::from_millis(1500)), 1.5);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn pings_are_received() {
        let transport = RedisTransport::from_url(DEFAULT_URL, unique_namespace())
            .await
            .unwrap();
        let token = CancellationToken::new();
        let mut pings = transport.subscribe_pings(token.clone()).await.unwrap();

        let _: () = transport
            .conn
            .clone()
            .publish(transport.namespace.key(KeyType::Ping), b"ping".to_vec())
            .await
            .unwrap();

        assert_eq!(pings.next().await.unwrap().unwrap(), b"ping".to_vec());
        token.cancel();
        assert!(pings.next().await.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn ping_subscribers_share_one_listener() {
        let transport = RedisTransport::from_url(DEFAULT_URL, unique_namespace())
            .await
            .unwrap();
        let token = CancellationToken::new();
        let mut first = transport.subscribe_pings(token.clone()).await.unwrap();
        let mut second = transport.subscribe_pings(token.clone()).await.unwrap();

        let receivers: usize = transport
            .conn
            .clone()
            .publish(transport.namespace.key(KeyType::Ping), b"ping".to_vec())
            .await
            .unwrap();

        assert_eq!(receivers, 1);
        assert_eq!(first.next().await.unwrap().unwrap(), b"ping".to_vec());
        assert_eq!(second.next().await.unwrap().unwrap(), b"ping".to_vec());
        token.cancel();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn intake_round_trip() {
        let transport = RedisTransport::from_url(DEFAULT_URL, unique_namespace())
            .await
            .unwrap();
        let _: () = transport
            .conn
            .clone()
            .rpush(
                transport.namespace.intake(IntakeQueue::Results),
                b"payload".to_vec(),
            )
            .await
            .unwrap();

        let popped = transport
            .pop_intake(IntakeQueue::Results, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(popped, Some(b"payload".to_vec()));
    }
}
