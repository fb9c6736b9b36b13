//! The worker core, shared by every substrate.
//!
//! A [`Worker`] wraps exactly one unit of work. The owner drives it through a
//! fixed lifecycle:
//!
//! ```text
//! constructed ──start──▶ running ──(stop)──▶ finished or failed ──join──▶ joined
//! ```
//!
//! Inside the worker, the execution wrapper clears the completion flag, runs the
//! routine, captures any error or panic, sends it once over the exception
//! channel and finally sets the completion flag again, whatever happened.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::WorkerOptions;
use crate::error::{Result, WorkerError};
use crate::exception::{self, CapturedException};
use crate::substrate::{
    ExceptionReceiver, ExceptionSender, Flag, Payload, ResultQueue, Substrate, SubstrateHandle,
};

/// View of the worker handed to a running routine.
pub struct WorkContext<'a, T> {
    name: &'a str,
    stop: Option<&'a dyn Flag>,
    results: &'a dyn ResultQueue<T>,
}

impl<T> WorkContext<'_, T> {
    /// The worker's name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Whether the owner asked this worker to stop.
    ///
    /// Always `false` for routines without a stop flag.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_some_and(|flag| flag.is_set())
    }

    /// Sleep for up to `timeout`, returning early with `true` if a stop is requested.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        match self.stop {
            Some(flag) => flag.wait(Some(timeout)),
            None => {
                thread::sleep(timeout);
                false
            }
        }
    }

    /// Publish a result to the owner.
    pub fn put(&self, item: T) -> Result<()> {
        self.results.put(item)
    }

    /// The worker's result queue.
    pub fn results(&self) -> &dyn ResultQueue<T> {
        self.results
    }
}

/// A unit of work run by a [`Worker`].
///
/// Implement `run` for long-running, stop-aware work and set
/// `USES_STOP_EVENT` to `true` so the worker allocates a stop flag. Leaving
/// `run` unimplemented makes the worker fail with
/// [`WorkerError::NotImplemented`], captured like any other failure.
///
/// # Example
///
/// ```
/// use safe_parallel::{Routine, ThreadWorker, WorkContext};
///
/// struct Spin {
///     result: u32,
/// }
///
/// impl Routine<u32> for Spin {
///     const USES_STOP_EVENT: bool = true;
///
///     fn run(self, ctx: &WorkContext<'_, u32>) -> anyhow::Result<()> {
///         while !ctx.stop_requested() {
///             ctx.wait_for_stop(std::time::Duration::from_millis(10));
///         }
///         ctx.put(self.result)?;
///         Ok(())
///     }
/// }
///
/// let mut worker = ThreadWorker::new(Spin { result: 42 }).unwrap();
/// worker.start().unwrap();
/// worker.stop().unwrap();
/// worker.join(None).unwrap();
/// assert!(worker.exception().is_none());
/// ```
pub trait Routine<T>: Send + Sized + 'static {
    /// Whether this routine honors cooperative stop requests.
    const USES_STOP_EVENT: bool = false;

    fn run(self, ctx: &WorkContext<'_, T>) -> anyhow::Result<()> {
        let _ = ctx;
        Err(WorkerError::NotImplemented.into())
    }
}

/// A plain closure whose `Ok` value is published on the result queue.
pub struct Target<F>(F);

impl<F> Target<F> {
    pub fn new(target: F) -> Self {
        Self(target)
    }
}

impl<T, F> Routine<T> for Target<F>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Payload,
{
    fn run(self, ctx: &WorkContext<'_, T>) -> anyhow::Result<()> {
        let value = (self.0)()?;
        ctx.put(value)?;
        Ok(())
    }
}

/// A closure that receives the [`WorkContext`] and supports cooperative stop.
pub struct Stoppable<T, F> {
    work: F,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> Stoppable<T, F>
where
    F: FnOnce(&WorkContext<'_, T>) -> anyhow::Result<()> + Send + 'static,
{
    pub fn new(work: F) -> Self {
        Self {
            work,
            _item: PhantomData,
        }
    }
}

impl<T, F> Routine<T> for Stoppable<T, F>
where
    F: FnOnce(&WorkContext<'_, T>) -> anyhow::Result<()> + Send + 'static,
    T: 'static,
{
    const USES_STOP_EVENT: bool = true;

    fn run(self, ctx: &WorkContext<'_, T>) -> anyhow::Result<()> {
        (self.work)(ctx)
    }
}

type BoxedWork<T> = Box<dyn for<'a> FnOnce(&WorkContext<'a, T>) -> anyhow::Result<()> + Send>;

/// Everything the execution wrapper needs, moved to the substrate on start.
struct Job<S: Substrate, T: Payload> {
    name: String,
    work: BoxedWork<T>,
    stop_flag: Option<S::Flag>,
    not_running: S::Flag,
    results: S::Queue<T>,
    exception_tx: S::ExceptionSender,
}

/// Sets the completion flag when dropped, on every exit path.
struct CompletionGuard<'a, F: Flag>(&'a F);

impl<F: Flag> Drop for CompletionGuard<'_, F> {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl<S: Substrate, T: Payload> Job<S, T> {
    /// The execution wrapper. Never unwinds.
    fn run(self) {
        let Self {
            name,
            work,
            stop_flag,
            not_running,
            results,
            exception_tx,
        } = self;

        let completion = CompletionGuard(&not_running);
        not_running.clear();

        let ctx = WorkContext {
            name: &name,
            stop: stop_flag.as_ref().map(|flag| flag as &dyn Flag),
            results: &results,
        };

        if let Some(exception) = exception::capture(|| work(&ctx)) {
            tracing::error!(
                worker = %name,
                substrate = S::KIND,
                kind = %exception.kind(),
                trace = %exception.trace(),
                "worker failed: {}",
                exception
            );
            if let Err(e) = exception_tx.send(exception) {
                tracing::warn!(worker = %name, error = %e, "could not deliver captured exception");
            }
        } else {
            drop(exception_tx);
        }

        drop(completion);
        tracing::info!(worker = %name, substrate = S::KIND, "worker finished");
    }
}

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

fn default_name(kind: &str) -> String {
    format!("{}-{}", kind, NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
}

/// One managed unit of concurrent execution on substrate `S`, publishing
/// results of type `T`.
///
/// Use the [`ProcessWorker`](crate::ProcessWorker) and
/// [`ThreadWorker`](crate::ThreadWorker) aliases; both expose the same API.
pub struct Worker<S: Substrate, T: Payload> {
    name: String,
    options: WorkerOptions,
    stop_flag: Option<S::Flag>,
    not_running: S::Flag,
    results: S::Queue<T>,
    /// Owner end of the exception channel; released by `join`.
    exception_rx: Option<S::ExceptionReceiver>,
    /// Memoized failure. Never overwritten once set.
    exception: Option<CapturedException>,
    /// Waiting for `start`.
    job: Option<Job<S, T>>,
    handle: Option<S::Handle>,
}

impl<S: Substrate, T: Payload> Worker<S, T> {
    /// Create a worker for `routine` with default options.
    pub fn new<R: Routine<T>>(routine: R) -> Result<Self> {
        Self::build(routine, WorkerOptions::default(), None)
    }

    /// Create a worker for `routine`.
    pub fn with_options<R: Routine<T>>(routine: R, options: WorkerOptions) -> Result<Self> {
        Self::build(routine, options, None)
    }

    /// Create a worker publishing into an existing queue, possibly shared with
    /// other workers.
    pub fn with_result_queue<R: Routine<T>>(
        routine: R,
        options: WorkerOptions,
        queue: S::Queue<T>,
    ) -> Result<Self> {
        Self::build(routine, options, Some(queue))
    }

    /// Create a worker that runs `target` once and publishes its value.
    ///
    /// Such workers have no stop flag.
    pub fn from_target<F>(target: F) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::new(Target::new(target))
    }

    /// Create a stop-aware worker from a closure.
    pub fn stoppable<F>(work: F) -> Result<Self>
    where
        F: FnOnce(&WorkContext<'_, T>) -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(Stoppable::new(work))
    }

    fn build<R: Routine<T>>(
        routine: R,
        options: WorkerOptions,
        queue: Option<S::Queue<T>>,
    ) -> Result<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| default_name(S::KIND));

        let stop_flag = if R::USES_STOP_EVENT {
            Some(S::flag(false, &options)?)
        } else {
            None
        };
        let not_running = S::flag(true, &options)?;
        let results = match queue {
            Some(queue) => queue,
            None => S::queue()?,
        };
        let (exception_tx, exception_rx) = S::exception_channel()?;

        let work: BoxedWork<T> =
            Box::new(move |ctx: &WorkContext<'_, T>| Routine::<T>::run(routine, ctx));
        let job = Job {
            name: name.clone(),
            work,
            stop_flag: stop_flag.clone(),
            not_running: not_running.clone(),
            results: results.clone(),
            exception_tx,
        };

        Ok(Self {
            name,
            options,
            stop_flag,
            not_running,
            results,
            exception_rx: Some(exception_rx),
            exception: None,
            job: Some(job),
            handle: None,
        })
    }

    /// The worker's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this worker supports [`stop`](Self::stop).
    pub fn uses_stop_event(&self) -> bool {
        self.stop_flag.is_some()
    }

    /// The result queue.
    pub fn results(&self) -> &S::Queue<T> {
        &self.results
    }

    /// Begin executing on the substrate. Workers cannot be restarted.
    pub fn start(&mut self) -> Result<()> {
        let job = self.job.take().ok_or_else(|| WorkerError::AlreadyStarted {
            name: self.name.clone(),
        })?;

        // Installed before spawning so a forked child never races the `Once`.
        exception::install_panic_hook();

        let handle = S::spawn(&self.name, &self.options, Box::new(move || job.run()))?;
        tracing::debug!(worker = %self.name, substrate = S::KIND, "worker started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.job.is_none()
    }

    /// Native liveness query. `false` before `start`.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(SubstrateHandle::is_alive)
    }

    /// Ask the worker to stop cooperatively.
    ///
    /// Does not wait for the worker to exit; call [`join`](Self::join) for
    /// that. A worker that never becomes alive is silently left alone.
    pub fn stop(&mut self) -> Result<()> {
        self.request_stop(false)
    }

    /// Like [`stop`](Self::stop), but fails with [`WorkerError::NotRunning`]
    /// if the worker never becomes alive.
    pub fn stop_strict(&mut self) -> Result<()> {
        self.request_stop(true)
    }

    fn request_stop(&mut self, strict: bool) -> Result<()> {
        tracing::info!(worker = %self.name, substrate = S::KIND, "stopping worker");
        if self.stop_flag.is_none() {
            return Err(WorkerError::UnsupportedOperation {
                name: self.name.clone(),
            });
        }

        // Give a freshly started worker a chance to get scheduled.
        let mut alive = false;
        for _ in 0..self.options.stop_probe_attempts {
            if self.is_alive() {
                alive = true;
                break;
            }
            thread::sleep(self.options.stop_probe_interval);
        }
        if !alive {
            if strict {
                return Err(WorkerError::NotRunning {
                    name: self.name.clone(),
                });
            }
            tracing::debug!(worker = %self.name, "worker not alive, nothing to stop");
            return Ok(());
        }

        // A worker that already failed must not be masked by the stop request.
        if let Err(e) = self.receive_exception() {
            tracing::warn!(worker = %self.name, error = %e, "exception channel error while stopping");
        }

        if let Some(flag) = &self.stop_flag {
            flag.set();
        }
        Ok(())
    }

    /// Wait for the worker to finish, for at most `timeout` (`None` waits forever).
    ///
    /// Fails with [`WorkerError::NotRunning`] before `start` and with
    /// [`WorkerError::JoinTimeout`] while the work is still executing. On success any captured exception is already cached, so
    /// [`exception`](Self::exception) is reliable afterwards.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Releasing the channel of an unstarted worker would lose its failure.
        if !self.is_started() {
            return Err(WorkerError::NotRunning {
                name: self.name.clone(),
            });
        }
        let started = Instant::now();

        if !self.not_running.wait(timeout) {
            return Err(WorkerError::JoinTimeout {
                name: self.name.clone(),
                timeout: timeout.unwrap_or_default(),
            });
        }

        if self.is_alive() {
            let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
            let exited = self
                .handle
                .as_ref()
                .is_none_or(|handle| handle.join(remaining));
            if !exited {
                let name = self.name.clone();
                let timeout = timeout.unwrap_or_default();
                // The wrapper may not have entered yet when the flag was first checked.
                return Err(if self.not_running.is_set() {
                    WorkerError::TeardownTimeout { name, timeout }
                } else {
                    WorkerError::JoinTimeout { name, timeout }
                });
            }
        }

        if let Err(e) = self.receive_exception() {
            tracing::warn!(worker = %self.name, error = %e, "exception channel error while joining");
        }
        self.exception_rx = None;
        Ok(())
    }

    /// The captured failure, if the worker failed. Never blocks.
    ///
    /// Repeated calls return the same value, including after `join` released
    /// the channel.
    pub fn exception(&mut self) -> Option<&CapturedException> {
        if let Err(e) = self.receive_exception() {
            tracing::debug!(worker = %self.name, error = %e, "ignoring exception channel error");
        }
        self.exception.as_ref()
    }

    fn receive_exception(&mut self) -> Result<()> {
        let Some(rx) = self.exception_rx.as_mut() else {
            return Ok(());
        };
        if let Some(exception) = rx.try_recv()? {
            if self.exception.is_none() {
                self.exception = Some(exception);
            }
        }
        Ok(())
    }

    pub(crate) fn handle(&self) -> Option<&S::Handle> {
        self.handle.as_ref()
    }
}

#[cfg(unix)]
impl<T: Payload> Worker<crate::substrate::process::Process, T> {
    /// Process ID of the worker, once started.
    pub fn pid(&self) -> Option<u32> {
        self.handle().map(crate::substrate::process::ProcessHandle::pid)
    }

    /// Exit code of the worker process, once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.handle()
            .and_then(crate::substrate::process::ProcessHandle::exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::thread::Thread;

    struct Unimplemented;

    impl Routine<()> for Unimplemented {}

    #[test]
    fn test_default_names_are_unique() {
        let a: Worker<Thread, ()> = Worker::from_target(|| Ok(())).unwrap();
        let b: Worker<Thread, ()> = Worker::from_target(|| Ok(())).unwrap();
        assert!(a.name().starts_with("thread-"));
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_explicit_name() {
        let worker: Worker<Thread, ()> =
            Worker::with_options(Target::new(|| Ok(())), WorkerOptions::default().name("server"))
                .unwrap();
        assert_eq!(worker.name(), "server");
    }

    #[test]
    fn test_stop_flag_follows_routine() {
        let target: Worker<Thread, ()> = Worker::from_target(|| Ok(())).unwrap();
        let stoppable: Worker<Thread, ()> = Worker::stoppable(|_ctx| Ok(())).unwrap();
        assert!(!target.uses_stop_event());
        assert!(stoppable.uses_stop_event());
    }

    #[test]
    fn test_not_alive_before_start() {
        let worker: Worker<Thread, ()> = Worker::from_target(|| Ok(())).unwrap();
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_join_before_start_keeps_failure_reachable() {
        let mut worker: Worker<Thread, ()> =
            Worker::from_target(|| anyhow::bail!("late failure")).unwrap();
        let err = worker.join(Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, WorkerError::NotRunning { .. }));

        worker.start().unwrap();
        worker.join(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(worker.exception().unwrap().message(), "late failure");
    }

    #[test]
    fn test_start_twice_fails() {
        let mut worker: Worker<Thread, ()> = Worker::from_target(|| Ok(())).unwrap();
        worker.start().unwrap();
        let err = worker.start().unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyStarted { .. }));
        worker.join(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn test_unimplemented_routine_is_captured() {
        let mut worker: Worker<Thread, ()> = Worker::new(Unimplemented).unwrap();
        worker.start().unwrap();
        worker.join(Some(Duration::from_secs(5))).unwrap();

        let exception = worker.exception().unwrap();
        assert_eq!(exception.message(), WorkerError::NotImplemented.to_string());
    }

    #[test]
    fn test_strict_stop_on_unstarted_worker() {
        let mut worker: Worker<Thread, ()> = Worker::with_options(
            Stoppable::new(|_ctx: &WorkContext<'_, ()>| Ok(())),
            WorkerOptions::default()
                .stop_probe_attempts(2)
                .stop_probe_interval(Duration::from_millis(1)),
        )
        .unwrap();

        let err = worker.stop_strict().unwrap_err();
        assert!(matches!(err, WorkerError::NotRunning { .. }));
        worker.stop().unwrap();
    }

    #[test]
    fn test_completion_guard_sets_flag() {
        let flag = crate::substrate::thread::Event::new(false);
        {
            let _guard = CompletionGuard(&flag);
        }
        assert!(flag.is_set());
    }
}
