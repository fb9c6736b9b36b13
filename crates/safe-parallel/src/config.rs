//! Worker configuration.

use std::time::Duration;

/// Options controlling a worker's identity, teardown disposition and polling.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use safe_parallel::WorkerOptions;
///
/// let options = WorkerOptions::default()
///     .name("server")
///     .stop_probe_attempts(20)
///     .poll_interval(Duration::from_millis(2));
///
/// assert_eq!(options.name.as_deref(), Some("server"));
/// assert!(options.daemon);
/// ```
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Display name. A `<substrate>-<n>` placeholder is used when unset.
    pub name: Option<String>,

    /// Daemonic workers never outlive their owner: dropping the worker kills a
    /// still-running process or detaches a still-running thread. Non-daemonic
    /// workers are waited for on drop.
    pub daemon: bool,

    /// How many times `stop` checks liveness before giving up on a worker that
    /// has not been scheduled yet.
    pub stop_probe_attempts: u32,

    /// Pause between two liveness probes in `stop`.
    pub stop_probe_interval: Duration,

    /// Granularity of polling waits (process flags, native join).
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: None,
            daemon: true,
            stop_probe_attempts: 10,
            stop_probe_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl WorkerOptions {
    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the daemon disposition.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Set the number of liveness probes performed by `stop`.
    pub fn stop_probe_attempts(mut self, attempts: u32) -> Self {
        self.stop_probe_attempts = attempts;
        self
    }

    /// Set the pause between liveness probes performed by `stop`.
    pub fn stop_probe_interval(mut self, interval: Duration) -> Self {
        self.stop_probe_interval = interval;
        self
    }

    /// Set the polling granularity.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WorkerOptions::default();
        assert!(options.name.is_none());
        assert!(options.daemon);
        assert_eq!(options.stop_probe_attempts, 10);
        assert_eq!(options.stop_probe_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_builder_setters() {
        let options = WorkerOptions::default()
            .name("client 0")
            .daemon(false)
            .stop_probe_interval(Duration::from_millis(5));

        assert_eq!(options.name.as_deref(), Some("client 0"));
        assert!(!options.daemon);
        assert_eq!(options.stop_probe_interval, Duration::from_millis(5));
    }
}
