use tokio::sync::watch;

use crate::worker::{Worker, WorkerId};

/// The registered workers and the capacity they add up to.
///
/// Every change to the pool is published on a [`watch`] channel so that the dispatcher, which
/// runs on its own task, always compares against the current total.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    total_capacity: watch::Sender<usize>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            total_capacity: watch::channel(0).0,
        }
    }
}

impl WorkerPool {
    /// Adds the worker, returning the entry it replaced if the id was already registered.
    pub fn add(&mut self, worker: Worker) -> Option<Worker> {
        let replaced = self.take(&worker.id);
        self.workers.push(worker);
        self.publish();
        replaced
    }

    /// Removes the worker. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &WorkerId) -> Option<Worker> {
        let removed = self.take(id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn total_capacity(&self) -> usize {
        *self.total_capacity.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.total_capacity.subscribe()
    }

    fn take(&mut self, id: &WorkerId) -> Option<Worker> {
        let position = self.workers.iter().position(|worker| &worker.id == id)?;
        Some(self.workers.remove(position))
    }

    fn publish(&self) {
        let total = self.workers.iter().map(Worker::capacity).sum();
        self.total_capacity.send_replace(total);
    }
}
