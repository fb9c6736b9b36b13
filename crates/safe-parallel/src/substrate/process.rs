//! Forked-process substrate (Unix).
//!
//! The worker body runs in a child created with `fork`, so the closure and
//! everything it captures is copied into the child's address space. Only the
//! following cross the boundary:
//!
//! - flags: an atomic word in an anonymous `MAP_SHARED` mapping,
//! - result queue and exception channel: `AF_UNIX` datagram socket pairs.
//!
//! The child never returns into the owner's code: it leaves through `_exit`
//! once the body is done.

use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::WorkerOptions;
use crate::error::{Result, WorkerError};
use crate::exception::CapturedException;
use crate::ipc::{
    MAX_MESSAGE_BYTES, decode_exception, decode_payload, encode_exception, encode_payload,
};

use super::{
    ExceptionReceiver, ExceptionSender, Flag, Payload, ResultQueue, Substrate, SubstrateHandle,
    poll_until,
};

/// Forked child processes with isolated address spaces.
///
/// # Fork safety
///
/// `fork` copies only the calling thread. A lock held by any other owner
/// thread at that moment stays locked forever in the child. The child runs
/// the routine, the allocator and `tracing`, so a global subscriber whose
/// writer is locked by another thread during the fork deadlocks the child.
/// Start process workers before installing such a subscriber, or from a
/// program that does not log from other threads while forking.
pub struct Process;

/// One `u32` living in memory shared with every forked child.
struct SharedWord {
    ptr: NonNull<AtomicU32>,
}

// SAFETY: the mapping is only ever accessed through `AtomicU32`.
unsafe impl Send for SharedWord {}
unsafe impl Sync for SharedWord {}

impl SharedWord {
    const LEN: usize = std::mem::size_of::<AtomicU32>();

    fn new(value: u32) -> Result<Self> {
        // SAFETY: anonymous mapping, no file descriptor involved.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                Self::LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr.cast::<AtomicU32>())
            .ok_or_else(|| WorkerError::Io(io::Error::other("mmap returned null")))?;
        // SAFETY: freshly mapped, page aligned and large enough.
        unsafe { ptr.as_ptr().write(AtomicU32::new(value)) };
        Ok(Self { ptr })
    }

    fn get(&self) -> &AtomicU32 {
        // SAFETY: the mapping lives until `drop`.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for SharedWord {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with the same length.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), Self::LEN);
        }
    }
}

/// Event flag visible to the owner and all forked children.
///
/// Waiting polls the shared word every `poll_interval`.
#[derive(Clone)]
pub struct SharedFlag {
    word: Arc<SharedWord>,
    poll_interval: Duration,
}

impl SharedFlag {
    pub fn new(set: bool, poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            word: Arc::new(SharedWord::new(u32::from(set))?),
            poll_interval,
        })
    }
}

impl Flag for SharedFlag {
    fn set(&self) {
        self.word.get().store(1, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.word.get().store(0, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.word.get().load(Ordering::SeqCst) != 0
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        poll_until(timeout, self.poll_interval, || self.is_set())
    }
}

/// Wait until `fd` is readable. `timeout_ms < 0` waits forever.
fn poll_readable(fd: RawFd, timeout_ms: libc::c_int) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: a single valid pollfd.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

/// Receive one datagram without blocking.
fn recv_datagram(socket: &UnixDatagram) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    match socket.recv(&mut buf) {
        Ok(len) => {
            buf.truncate(len);
            Ok(Some(buf))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

struct DatagramPair {
    tx: UnixDatagram,
    rx: UnixDatagram,
}

/// Cross-process FIFO built on a datagram socket pair.
///
/// Every forked child inherits the sending end, so one queue can be shared
/// by many process workers. Items are bincode-encoded, one per datagram.
pub struct ProcessQueue<T> {
    inner: Arc<DatagramPair>,
    _item: PhantomData<fn() -> T>,
}

impl<T> ProcessQueue<T> {
    pub fn new() -> Result<Self> {
        let (tx, rx) = UnixDatagram::pair()?;
        rx.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(DatagramPair { tx, rx }),
            _item: PhantomData,
        })
    }
}

impl<T> Clone for ProcessQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _item: PhantomData,
        }
    }
}

impl<T: Payload> ResultQueue<T> for ProcessQueue<T> {
    fn put(&self, item: T) -> Result<()> {
        let bytes = encode_payload(&item)?;
        self.inner.tx.send(&bytes)?;
        Ok(())
    }

    fn try_get(&self) -> Result<Option<T>> {
        match recv_datagram(&self.inner.rx)? {
            Some(bytes) => decode_payload(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn get(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = self.try_get()? {
                return Ok(Some(item));
            }
            let wait_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    // Round up so a sub-millisecond remainder still waits.
                    remaining.as_millis().saturating_add(1).min(libc::c_int::MAX as u128)
                        as libc::c_int
                }
            };
            poll_readable(self.inner.rx.as_raw_fd(), wait_ms)?;
        }
    }

    fn is_empty(&self) -> bool {
        !poll_readable(self.inner.rx.as_raw_fd(), 0).unwrap_or(false)
    }
}

pub struct ProcessExceptionSender(UnixDatagram);

pub struct ProcessExceptionReceiver(UnixDatagram);

impl ExceptionSender for ProcessExceptionSender {
    fn send(self, exception: CapturedException) -> Result<()> {
        let bytes = encode_exception(&exception)?;
        self.0
            .send(&bytes)
            .map_err(|e| WorkerError::Channel(format!("Failed to send exception: {}", e)))?;
        Ok(())
    }
}

impl ExceptionReceiver for ProcessExceptionReceiver {
    fn try_recv(&mut self) -> Result<Option<CapturedException>> {
        let bytes = recv_datagram(&self.0)
            .map_err(|e| WorkerError::Channel(format!("Failed to receive exception: {}", e)))?;
        match bytes {
            Some(bytes) if !bytes.is_empty() => decode_exception(&bytes).map(Some),
            _ => Ok(None),
        }
    }
}

/// Owner-side handle on a forked worker process.
pub struct ProcessHandle {
    pid: libc::pid_t,
    name: String,
    daemon: bool,
    poll_interval: Duration,
    /// Raw wait status once the child has been reaped.
    status: Mutex<Option<libc::c_int>>,
}

impl ProcessHandle {
    /// Process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Exit code of the worker, once reaped. `None` while running or if it was
    /// terminated by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.and_then(|raw| libc::WIFEXITED(raw).then(|| libc::WEXITSTATUS(raw)))
    }

    /// Try to reap the child. Returns `true` once it has exited.
    fn reap(&self, flags: libc::c_int) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_some() {
            return true;
        }
        let mut raw: libc::c_int = 0;
        // SAFETY: `pid` is our own child; `raw` is a valid out pointer.
        let rc = unsafe { libc::waitpid(self.pid, &mut raw, flags) };
        if rc == self.pid {
            *status = Some(raw);
            return true;
        }
        if rc == 0 {
            return false;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return false;
        }
        // ECHILD: someone else reaped it.
        tracing::warn!(worker = %self.name, pid = self.pid, error = %err, "waitpid failed");
        *status = Some(-1);
        true
    }
}

impl SubstrateHandle for ProcessHandle {
    fn is_alive(&self) -> bool {
        !self.reap(libc::WNOHANG)
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        poll_until(timeout, self.poll_interval, || self.reap(libc::WNOHANG))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reap(libc::WNOHANG) {
            return;
        }
        if self.daemon {
            tracing::warn!(worker = %self.name, pid = self.pid, "killing daemon worker process");
            // SAFETY: signalling our own unreaped child.
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
        }
        // Blocking reap so no zombie is left behind.
        while !self.reap(0) {}
    }
}

impl Substrate for Process {
    const KIND: &'static str = "process";

    type Flag = SharedFlag;
    type Queue<T: Payload> = ProcessQueue<T>;
    type ExceptionSender = ProcessExceptionSender;
    type ExceptionReceiver = ProcessExceptionReceiver;
    type Handle = ProcessHandle;

    fn flag(set: bool, options: &WorkerOptions) -> Result<SharedFlag> {
        SharedFlag::new(set, options.poll_interval)
    }

    fn queue<T: Payload>() -> Result<ProcessQueue<T>> {
        ProcessQueue::new()
    }

    fn exception_channel() -> Result<(ProcessExceptionSender, ProcessExceptionReceiver)> {
        let (child, parent) = UnixDatagram::pair()?;
        parent.set_nonblocking(true)?;
        Ok((ProcessExceptionSender(child), ProcessExceptionReceiver(parent)))
    }

    fn spawn(
        name: &str,
        options: &WorkerOptions,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<ProcessHandle> {
        // SAFETY: the child only runs `body` and then leaves through `_exit`,
        // never unwinding back into the owner's stack.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(WorkerError::Spawn {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            }),
            0 => {
                let code = match panic::catch_unwind(AssertUnwindSafe(body)) {
                    Ok(()) => 0,
                    Err(_) => 101,
                };
                // SAFETY: terminate the child without running the owner's
                // atexit handlers or destructors.
                unsafe { libc::_exit(code) }
            }
            pid => {
                tracing::debug!(worker = %name, pid, "forked worker process");
                Ok(ProcessHandle {
                    pid,
                    name: name.to_string(),
                    daemon: options.daemon,
                    poll_interval: options.poll_interval,
                    status: Mutex::new(None),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_flag_states() {
        let flag = SharedFlag::new(true, Duration::from_millis(1)).unwrap();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.is_set());
        assert!(!flag.wait(Some(Duration::from_millis(5))));
        flag.set();
        assert!(flag.wait(None));
    }

    #[test]
    fn test_process_queue_in_process() {
        let queue = ProcessQueue::<String>::new().unwrap();
        assert!(queue.is_empty());
        queue.put("token".to_string()).unwrap();
        assert!(!queue.is_empty());
        assert_eq!(queue.get(Some(Duration::from_secs(1))).unwrap().as_deref(), Some("token"));
        assert_eq!(queue.get(Some(Duration::from_millis(5))).unwrap(), None);
    }

    #[test]
    fn test_forked_child_sees_flag_and_queue() {
        let flag = SharedFlag::new(false, Duration::from_millis(1)).unwrap();
        let queue = ProcessQueue::<u32>::new().unwrap();

        let child_flag = flag.clone();
        let child_queue = queue.clone();
        let handle = Process::spawn(
            "fork-probe",
            &WorkerOptions::default(),
            Box::new(move || {
                child_queue.put(7).unwrap();
                child_flag.set();
            }),
        )
        .unwrap();

        assert!(flag.wait(Some(Duration::from_secs(5))));
        assert_eq!(queue.get(Some(Duration::from_secs(5))).unwrap(), Some(7));
        assert!(handle.join(Some(Duration::from_secs(5))));
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[test]
    fn test_exception_channel_across_fork() {
        let (tx, mut rx) = Process::exception_channel().unwrap();
        let handle = Process::spawn(
            "fork-exception",
            &WorkerOptions::default(),
            Box::new(move || {
                let exception = CapturedException::from_error(&anyhow::anyhow!("bad key"));
                tx.send(exception).unwrap();
            }),
        )
        .unwrap();

        assert!(handle.join(Some(Duration::from_secs(5))));
        let received = rx.try_recv().unwrap().unwrap();
        assert_eq!(received.message(), "bad key");
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_daemon_drop_kills_child() {
        let handle = Process::spawn(
            "sleeper",
            &WorkerOptions::default(),
            Box::new(|| std::thread::sleep(Duration::from_secs(30))),
        )
        .unwrap();
        let pid = handle.pid() as libc::pid_t;
        assert!(handle.is_alive());

        let start = Instant::now();
        drop(handle);
        assert!(start.elapsed() < Duration::from_secs(5));
        // SAFETY: signal 0 only checks for existence.
        let rc = unsafe { libc::kill(pid, 0) };
        assert_eq!(rc, -1);
    }
}
