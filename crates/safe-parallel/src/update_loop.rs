//! Fixed-rate, stop-aware update loop.
//!
//! Network endpoints (servers, clients) are driven by calling an `update`
//! function with the elapsed time at a steady rate. [`UpdateLoop`] packages
//! that pattern as a [`Routine`] that runs until the owner calls `stop`.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use crate::worker::{Routine, WorkContext};

/// Default tick interval: 60 updates per second.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_micros(16_667);

/// Calls `update(elapsed, ctx)` every `interval` until a stop is requested.
///
/// The time spent inside `update` is deducted from the pause, so the rate
/// holds as long as one update is shorter than the interval. An error
/// returned by `update` ends the loop and is captured by the worker.
///
/// ```
/// use std::time::Duration;
/// use safe_parallel::{ThreadWorker, UpdateLoop, WorkContext};
/// use safe_parallel::substrate::ResultQueue;
///
/// let ticker = UpdateLoop::new(|elapsed: Duration, ctx: &WorkContext<'_, u64>| {
///     ctx.put(elapsed.as_millis() as u64)?;
///     Ok(())
/// })
/// .with_interval(Duration::from_millis(5));
///
/// let mut worker = ThreadWorker::new(ticker).unwrap();
/// worker.start().unwrap();
/// let first = worker.results().get(Some(Duration::from_secs(5))).unwrap();
/// assert!(first.is_some());
/// worker.stop().unwrap();
/// worker.join(Some(Duration::from_secs(5))).unwrap();
/// ```
pub struct UpdateLoop<T, F> {
    update: F,
    interval: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> UpdateLoop<T, F>
where
    F: FnMut(Duration, &WorkContext<'_, T>) -> anyhow::Result<()> + Send + 'static,
{
    pub fn new(update: F) -> Self {
        Self {
            update,
            interval: DEFAULT_UPDATE_INTERVAL,
            _item: PhantomData,
        }
    }

    /// Set the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<T, F> Routine<T> for UpdateLoop<T, F>
where
    F: FnMut(Duration, &WorkContext<'_, T>) -> anyhow::Result<()> + Send + 'static,
    T: 'static,
{
    const USES_STOP_EVENT: bool = true;

    fn run(mut self, ctx: &WorkContext<'_, T>) -> anyhow::Result<()> {
        tracing::info!(worker = ctx.name(), interval = ?self.interval, "update loop started");

        let started = Instant::now();
        let mut ticks: u64 = 0;
        while !ctx.stop_requested() {
            let tick = Instant::now();
            (self.update)(started.elapsed(), ctx)?;
            ticks += 1;

            let pause = self.interval.saturating_sub(tick.elapsed());
            if !pause.is_zero() {
                ctx.wait_for_stop(pause);
            }
        }

        tracing::info!(worker = ctx.name(), ticks, "update loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::thread::Thread;
    use crate::substrate::ResultQueue;
    use crate::worker::Worker;

    #[test]
    fn test_default_interval() {
        let ticker = UpdateLoop::new(|_elapsed: Duration, _ctx: &WorkContext<'_, ()>| Ok(()));
        assert_eq!(ticker.interval(), DEFAULT_UPDATE_INTERVAL);
    }

    #[test]
    fn test_elapsed_is_monotonic() {
        let ticker = UpdateLoop::new(|elapsed: Duration, ctx: &WorkContext<'_, Duration>| {
            ctx.put(elapsed)?;
            Ok(())
        })
        .with_interval(Duration::from_millis(2));

        let mut worker: Worker<Thread, Duration> = Worker::new(ticker).unwrap();
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        worker.stop().unwrap();
        worker.join(Some(Duration::from_secs(5))).unwrap();

        let mut previous = Duration::ZERO;
        let mut count = 0;
        while let Some(elapsed) = worker.results().try_get().unwrap() {
            assert!(elapsed >= previous);
            previous = elapsed;
            count += 1;
        }
        assert!(count >= 2, "only {count} ticks");
    }

    #[test]
    fn test_update_error_ends_loop() {
        let ticker = UpdateLoop::new(|elapsed: Duration, _ctx: &WorkContext<'_, ()>| {
            if elapsed > Duration::from_millis(5) {
                anyhow::bail!("client disconnected");
            }
            Ok(())
        })
        .with_interval(Duration::from_millis(1));

        let mut worker: Worker<Thread, ()> = Worker::new(ticker).unwrap();
        worker.start().unwrap();
        worker.join(Some(Duration::from_secs(5))).unwrap();

        assert!(!worker.is_alive());
        assert_eq!(worker.exception().unwrap().message(), "client disconnected");
    }
}
