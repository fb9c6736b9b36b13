//! Execution substrates: the vehicles a worker can run on.
//!
//! The worker core only needs a handful of capabilities from a substrate:
//!
//! ```text
//! Substrate
//!     ├── Flag               set / clear / wait, visible across the boundary
//!     ├── Queue<T>           FIFO of results, worker → owner
//!     ├── exception channel  one-shot, worker → owner
//!     └── Handle             is_alive + native join with timeout
//! ```
//!
//! - **`Thread`** - shared address space, std synchronization primitives.
//! - **`Process`** - forked child, shared-memory flags and datagram sockets.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::WorkerOptions;
use crate::error::Result;
use crate::exception::CapturedException;

#[cfg(unix)]
pub mod process;
pub mod thread;

/// Values a worker can publish on its result queue.
///
/// The bound is the same for every substrate so a routine can move between
/// threads and processes unchanged.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// A boolean synchronization primitive shared between owner and worker.
pub trait Flag: Send + Sync {
    /// Set the flag, waking any waiter.
    fn set(&self);

    /// Clear the flag.
    fn clear(&self);

    /// Check the flag without blocking.
    fn is_set(&self) -> bool;

    /// Block until the flag is set or `timeout` elapses (`None` waits forever).
    ///
    /// Returns whether the flag is set.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

/// FIFO channel of results from worker to owner.
pub trait ResultQueue<T>: Send + Sync {
    /// Append an item.
    fn put(&self, item: T) -> Result<()>;

    /// Take the oldest item without blocking.
    fn try_get(&self) -> Result<Option<T>>;

    /// Take the oldest item, waiting up to `timeout` (`None` waits forever).
    fn get(&self, timeout: Option<Duration>) -> Result<Option<T>>;

    /// Whether no item is currently available.
    fn is_empty(&self) -> bool;
}

/// Worker end of the exception channel. Consumed by its single send.
pub trait ExceptionSender: Send + 'static {
    fn send(self, exception: CapturedException) -> Result<()>;
}

/// Owner end of the exception channel.
pub trait ExceptionReceiver: Send {
    /// Receive the captured exception if one has arrived.
    ///
    /// A peer that released its end without sending is not an error.
    fn try_recv(&mut self) -> Result<Option<CapturedException>>;
}

/// Owner-side handle on a spawned worker.
pub trait SubstrateHandle: Send {
    /// Native liveness query.
    fn is_alive(&self) -> bool;

    /// Native join bounded by `timeout`. Returns `true` once the worker exited.
    fn join(&self, timeout: Option<Duration>) -> bool;
}

/// A concurrency substrate the worker core can be bound to.
pub trait Substrate: Sized + Send + 'static {
    /// Short lowercase name, used for default worker names and logs.
    const KIND: &'static str;

    type Flag: Flag + Clone + 'static;
    type Queue<T: Payload>: ResultQueue<T> + Clone + 'static;
    type ExceptionSender: ExceptionSender;
    type ExceptionReceiver: ExceptionReceiver;
    type Handle: SubstrateHandle;

    /// Create a flag in the given state.
    fn flag(set: bool, options: &WorkerOptions) -> Result<Self::Flag>;

    /// Create an empty result queue.
    fn queue<T: Payload>() -> Result<Self::Queue<T>>;

    /// Create the one-shot exception channel.
    fn exception_channel() -> Result<(Self::ExceptionSender, Self::ExceptionReceiver)>;

    /// Run `body` on a new process or thread.
    fn spawn(
        name: &str,
        options: &WorkerOptions,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<Self::Handle>;
}

/// Poll `done` every `interval` until it returns `true` or `timeout` elapses.
pub(crate) fn poll_until(
    timeout: Option<Duration>,
    interval: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        if done() {
            return true;
        }
        let pause = match deadline {
            None => interval,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    return done();
                }
                remaining.min(interval)
            }
        };
        std::thread::sleep(pause);
    }
}
