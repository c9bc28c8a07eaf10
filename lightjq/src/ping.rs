//! Worker liveness.
//!
//! Every registered worker gets a [`PingChecker`]. The checker holds a single-shot timer set to
//! the drop interval and restarts it whenever its worker publishes a heartbeat. If the timer
//! fires first the worker is considered lost: the failure callback runs once and the checker
//! ends. A worker that comes back has to register again to get a fresh checker.
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    codec,
    transport::{BoxedStream, Transport, TransportError},
    worker::WorkerId,
};

/// The heartbeat a live worker publishes on the ping channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFailure {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The worker went silent and the failure callback ran.
    Evicted,
    Cancelled,
}

pub struct PingChecker<T: Transport> {
    transport: T,
    worker_id: WorkerId,
    drop_interval: Duration,
}

impl<T: Transport> PingChecker<T> {
    pub fn new(transport: T, worker_id: WorkerId, drop_interval: Duration) -> Self {
        Self {
            transport,
            worker_id,
            drop_interval,
        }
    }

    /// Runs until the worker is evicted or `cancellation_token` is cancelled.
    ///
    /// Only heartbeats carrying this checker's worker id restart the timer. If the subscription
    /// cannot be established or ends early the timer keeps running, so a checker that can no
    /// longer hear its worker evicts it.
    pub async fn run<F>(self, cancellation_token: CancellationToken, on_failure: F) -> PingOutcome
    where
        F: FnOnce(PingFailure) + Send,
    {
        let worker_id = &self.worker_id;
        let mut pings = self
            .transport
            .subscribe_pings(cancellation_token.clone())
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %worker_id,
                    "Failed to subscribe to pings for worker {worker_id}, error: {err:?}"
                )
            })
            .ok();

        let timer = tokio::time::sleep(self.drop_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    tracing::debug!(%worker_id, "Shutting down ping checker for worker {worker_id}");
                    return PingOutcome::Cancelled;
                }
                _ = &mut timer => {
                    tracing::info!(%worker_id, "No ping from worker {worker_id}, evicting");
                    on_failure(PingFailure {
                        worker_id: self.worker_id.clone(),
                    });
                    return PingOutcome::Evicted;
                }
                ping = next_ping(&mut pings) => match ping {
                    Some(Ok(payload)) => match codec::decode::<Ping>(&payload) {
                        Ok(ping) if &ping.worker_id == worker_id => {
                            timer.as_mut().reset(Instant::now() + self.drop_interval);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(?err, "Ignoring invalid ping message, error: {err}");
                        }
                    },
                    Some(Err(err)) => {
                        tracing::error!(?err, %worker_id, "Failed to receive ping, error: {err:?}");
                    }
                    None => {
                        tracing::warn!(%worker_id, "Ping subscription for worker {worker_id} ended");
                        pings = None;
                    }
                },
            }
        }
    }
}

async fn next_ping(
    pings: &mut Option<BoxedStream<Vec<u8>>>,
) -> Option<Result<Vec<u8>, TransportError>> {
    match pings {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}
