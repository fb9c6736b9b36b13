//! Safe parallel workers for test harnesses.
//!
//! This crate provides:
//! - Workers backed by a forked process or an OS thread, with one API
//! - Capture of routine errors and panics, including their formatted trace
//! - Cooperative stop through a shared flag, and bounded join
//! - A result queue per worker, optionally shared between workers
//! - A fixed-rate update loop and a group container for many workers
//!
//! ```
//! use std::time::Duration;
//! use safe_parallel::ThreadWorker;
//! use safe_parallel::substrate::ResultQueue;
//!
//! let mut worker = ThreadWorker::from_target(|| Ok(6 * 7)).unwrap();
//! worker.start().unwrap();
//! worker.join(Some(Duration::from_secs(5))).unwrap();
//!
//! assert!(worker.exception().is_none());
//! assert_eq!(worker.results().try_get().unwrap(), Some(42));
//! ```

pub mod config;
pub mod error;
pub mod exception;
pub mod group;
pub mod ipc;
pub mod substrate;
pub mod update_loop;
mod worker;

pub use config::WorkerOptions;
pub use error::{Result, WorkerError};
pub use exception::{CapturedException, ExceptionKind, Raised, raise};
pub use group::WorkerGroup;
pub use substrate::{Flag, Payload, ResultQueue, Substrate};
pub use update_loop::UpdateLoop;
pub use worker::{Routine, Stoppable, Target, WorkContext, Worker};

#[cfg(unix)]
pub use substrate::process::Process;
pub use substrate::thread::Thread;

/// A worker running in a forked child process.
///
/// Forking from a multi-threaded owner carries the hazards described on
/// [`Process`]: a lock held by another thread during `start` (for example a
/// `tracing` writer) is never released in the child.
#[cfg(unix)]
pub type ProcessWorker<T = ()> = Worker<Process, T>;

/// A worker running on an OS thread of the current process.
pub type ThreadWorker<T = ()> = Worker<Thread, T>;
