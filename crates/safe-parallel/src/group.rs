//! Owner-side container for a set of started workers.

use std::time::Duration;

use crate::error::Result;
use crate::substrate::{Payload, Substrate};
use crate::worker::Worker;

/// Started workers owned together, e.g. a batch of simulated clients.
///
/// Dropping the group stops every stop-aware member and joins each one with
/// a bounded timeout. Failures during that teardown are logged, not raised.
pub struct WorkerGroup<S: Substrate, T: Payload> {
    workers: Vec<Worker<S, T>>,
    drop_timeout: Duration,
}

impl<S: Substrate, T: Payload> WorkerGroup<S, T> {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            drop_timeout: Duration::from_secs(5),
        }
    }

    /// Set the per-worker join timeout used when the group is dropped.
    pub fn with_drop_timeout(mut self, timeout: Duration) -> Self {
        self.drop_timeout = timeout;
        self
    }

    /// Start `worker` and take ownership of it.
    pub fn add(&mut self, mut worker: Worker<S, T>) -> Result<&mut Worker<S, T>> {
        worker.start()?;
        let index = self.workers.len();
        self.workers.push(worker);
        Ok(&mut self.workers[index])
    }

    /// Request a stop from every member. All members are attempted; the
    /// first error is returned.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for worker in &mut self.workers {
            if let Err(e) = worker.stop() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Join every member, each bounded by `timeout`. All members are
    /// attempted; the first error is returned.
    pub fn join_all(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut first_error = None;
        for worker in &mut self.workers {
            if let Err(e) = worker.join(timeout) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker<S, T>> {
        self.workers.iter()
    }
}

impl<S: Substrate, T: Payload> Default for WorkerGroup<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Substrate, T: Payload> Drop for WorkerGroup<S, T> {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            if worker.uses_stop_event() {
                if let Err(e) = worker.stop() {
                    tracing::warn!(worker = worker.name(), error = %e, "failed to stop group member");
                }
            }
        }
        for worker in &mut self.workers {
            if let Err(e) = worker.join(Some(self.drop_timeout)) {
                tracing::warn!(worker = worker.name(), error = %e, "failed to join group member");
            }
        }
    }
}
