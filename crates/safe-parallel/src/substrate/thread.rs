//! In-process thread substrate.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::config::WorkerOptions;
use crate::error::{Result, WorkerError};
use crate::exception::CapturedException;

use super::{
    ExceptionReceiver, ExceptionSender, Flag, Payload, ResultQueue, Substrate, SubstrateHandle,
    poll_until,
};

/// Threads sharing the owner's address space.
pub struct Thread;

/// Poisoning only means another holder panicked; the guarded data is still valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe event flag.
///
/// Clones share the same state.
///
/// ```
/// use safe_parallel::substrate::Flag;
/// use safe_parallel::substrate::thread::Event;
///
/// let event = Event::new(false);
/// let clone = event.clone();
/// clone.set();
/// assert!(event.is_set());
/// ```
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    pub fn new(set: bool) -> Self {
        Self {
            inner: Arc::new((Mutex::new(set), Condvar::new())),
        }
    }
}

impl Flag for Event {
    fn set(&self) {
        let (state, changed) = &*self.inner;
        *lock(state) = true;
        changed.notify_all();
    }

    fn clear(&self) {
        *lock(&self.inner.0) = false;
    }

    fn is_set(&self) -> bool {
        *lock(&self.inner.0)
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let (state, changed) = &*self.inner;
        let guard = lock(state);
        match timeout {
            None => *changed
                .wait_while(guard, |set| !*set)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (guard, _) = changed
                    .wait_timeout_while(guard, timeout, |set| !*set)
                    .unwrap_or_else(PoisonError::into_inner);
                *guard
            }
        }
    }
}

/// Unbounded in-process FIFO. Clones share the same queue.
pub struct ThreadQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> ThreadQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ThreadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send> ResultQueue<T> for ThreadQueue<T> {
    fn put(&self, item: T) -> Result<()> {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        self.tx
            .send(item)
            .map_err(|_| WorkerError::Channel("result queue disconnected".to_string()))
    }

    fn try_get(&self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn get(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        match timeout {
            None => Ok(self.rx.recv().ok()),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(item) => Ok(Some(item)),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Ok(None),
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub struct ThreadExceptionSender(Sender<CapturedException>);

pub struct ThreadExceptionReceiver(Receiver<CapturedException>);

impl ExceptionSender for ThreadExceptionSender {
    fn send(self, exception: CapturedException) -> Result<()> {
        self.0
            .send(exception)
            .map_err(|_| WorkerError::Channel("owner released the exception channel".to_string()))
    }
}

impl ExceptionReceiver for ThreadExceptionReceiver {
    fn try_recv(&mut self) -> Result<Option<CapturedException>> {
        match self.0.try_recv() {
            Ok(exception) => Ok(Some(exception)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }
}

/// Owner-side handle on a worker thread.
pub struct ThreadHandle {
    handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
    daemon: bool,
    poll_interval: Duration,
}

impl ThreadHandle {
    fn reap(&self) {
        let taken = lock(&self.handle).take();
        if let Some(handle) = taken {
            if handle.join().is_err() {
                tracing::warn!(worker = %self.name, "worker thread panicked outside its wrapper");
            }
        }
    }
}

impl SubstrateHandle for ThreadHandle {
    fn is_alive(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        let exited = poll_until(timeout, self.poll_interval, || !self.is_alive());
        if exited {
            self.reap();
        }
        exited
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.daemon {
            // Detached: the thread ends on its own or with the process.
            return;
        }
        let started = Instant::now();
        self.reap();
        tracing::debug!(worker = %self.name, waited = ?started.elapsed(), "joined non-daemon thread");
    }
}

impl Substrate for Thread {
    const KIND: &'static str = "thread";

    type Flag = Event;
    type Queue<T: Payload> = ThreadQueue<T>;
    type ExceptionSender = ThreadExceptionSender;
    type ExceptionReceiver = ThreadExceptionReceiver;
    type Handle = ThreadHandle;

    fn flag(set: bool, _options: &WorkerOptions) -> Result<Event> {
        Ok(Event::new(set))
    }

    fn queue<T: Payload>() -> Result<ThreadQueue<T>> {
        Ok(ThreadQueue::new())
    }

    fn exception_channel() -> Result<(ThreadExceptionSender, ThreadExceptionReceiver)> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Ok((ThreadExceptionSender(tx), ThreadExceptionReceiver(rx)))
    }

    fn spawn(
        name: &str,
        options: &WorkerOptions,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<ThreadHandle> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|source| WorkerError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(ThreadHandle {
            handle: Mutex::new(Some(handle)),
            name: name.to_string(),
            daemon: options.daemon,
            poll_interval: options.poll_interval,
        })
    }
}
