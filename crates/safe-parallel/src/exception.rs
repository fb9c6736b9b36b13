//! Capture of worker failures as plain data.
//!
//! A work routine fails either by returning `Err(anyhow::Error)` or by
//! panicking. Both are turned into a [`CapturedException`] so they can cross a
//! process boundary and be inspected by the owner after the fact.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Once;

/// How a work routine failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ExceptionKind {
    /// The routine returned an error.
    Error,
    /// The routine panicked.
    Panic,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Panic => f.write_str("panic"),
        }
    }
}

/// A failure captured inside a worker, paired with its formatted trace.
///
/// `Display` renders the failure message only; [`trace`](Self::trace) holds the
/// full rendering (error chain or panic location, plus backtrace).
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CapturedException {
    kind: ExceptionKind,
    message: String,
    location: Option<String>,
    trace: String,
}

impl CapturedException {
    /// Capture an error returned by a routine.
    ///
    /// The location is taken from the innermost [`Raised`] in the chain, if any.
    pub fn from_error(error: &anyhow::Error) -> Self {
        let location = error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<Raised>())
            .last()
            .map(|raised| raised.location.to_string());
        let trace = match &location {
            Some(location) => format!("raised at {location}:\n{error:?}"),
            None => format!("{error:?}"),
        };
        Self {
            kind: ExceptionKind::Error,
            message: error.to_string(),
            location,
            trace,
        }
    }

    fn from_panic(message: String, record: Option<PanicRecord>) -> Self {
        let (location, backtrace) = match record {
            Some(record) => (record.location, record.backtrace),
            None => (None, String::new()),
        };
        let mut trace = match &location {
            Some(location) => format!("panicked at {location}:\n{message}"),
            None => format!("panicked:\n{message}"),
        };
        if !backtrace.is_empty() {
            trace.push_str("\n\nstack backtrace:\n");
            trace.push_str(&backtrace);
        }
        Self {
            kind: ExceptionKind::Panic,
            message,
            location,
            trace,
        }
    }

    /// How the routine failed.
    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// The failure message (`Display` of the error, or the panic payload).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// `file:line:col` of a panic, when the panic hook saw it.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// The fully formatted trace.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    /// Cut the trace down to at most `max` bytes, on a char boundary.
    pub(crate) fn truncate_trace(&mut self, max: usize) {
        if self.trace.len() <= max {
            return;
        }
        let mut end = max;
        while !self.trace.is_char_boundary(end) {
            end -= 1;
        }
        self.trace.truncate(end);
        self.trace.push_str("\n[trace truncated]");
    }
}

impl fmt::Display for CapturedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CapturedException {}

/// An error that remembers the source line it was raised on.
///
/// Build one with [`raise`] or [`fail!`](crate::fail). Wrapping it in further
/// `anyhow` context keeps the location.
#[derive(Debug)]
pub struct Raised {
    message: String,
    location: &'static Location<'static>,
}

impl Raised {
    /// `file:line:col` of the `raise` call.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Raised {}

/// Create a routine error tagged with the caller's source location.
///
/// ```
/// use safe_parallel::exception::raise;
///
/// let error = raise("handshake rejected");
/// assert_eq!(error.to_string(), "handshake rejected");
/// ```
#[track_caller]
pub fn raise(message: impl fmt::Display) -> anyhow::Error {
    anyhow::Error::new(Raised {
        message: message.to_string(),
        location: Location::caller(),
    })
}

/// Return early from a routine with a located error, like `anyhow::bail!`.
///
/// ```
/// use safe_parallel::fail;
///
/// fn check(port: u16) -> anyhow::Result<()> {
///     if port == 0 {
///         fail!("invalid port {port}");
///     }
///     Ok(())
/// }
///
/// assert!(check(0).is_err());
/// ```
#[macro_export]
macro_rules! fail {
    ($($arg:tt)*) => {
        return ::std::result::Result::Err($crate::exception::raise(::std::format!($($arg)*)))
    };
}

struct PanicRecord {
    location: Option<String>,
    backtrace: String,
}

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install the process-wide hook that records panic locations for threads
/// currently inside [`capture`]. Other threads go to the previous hook.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !CAPTURING.try_with(Cell::get).unwrap_or(false) {
                previous(info);
                return;
            }
            let record = PanicRecord {
                location: info.location().map(ToString::to_string),
                backtrace: Backtrace::force_capture().to_string(),
            };
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(record));
        }));
    });
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Run `work`, converting an error or a panic into a [`CapturedException`].
///
/// Panics raised inside `work` are not printed by the default hook; the caller
/// is expected to log the returned failure.
pub(crate) fn capture<F>(work: F) -> Option<CapturedException>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    install_panic_hook();
    CAPTURING.with(|flag| flag.set(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(work));
    CAPTURING.with(|flag| flag.set(false));

    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(CapturedException::from_error(&error)),
        Err(payload) => {
            let record = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            Some(CapturedException::from_panic(
                payload_message(&*payload),
                record,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_capture_success() {
        assert!(capture(|| Ok(())).is_none());
    }

    #[test]
    fn test_capture_error_keeps_chain() {
        let captured = capture(|| {
            Err(anyhow::anyhow!("socket closed")).context("update failed")
        })
        .unwrap();

        assert_eq!(captured.kind(), ExceptionKind::Error);
        assert_eq!(captured.message(), "update failed");
        assert!(captured.trace().contains("update failed"));
        assert!(captured.trace().contains("socket closed"));
        assert!(captured.location().is_none());
    }

    #[test]
    fn test_capture_panic_records_location() {
        let captured = capture(|| panic!("Test exception")).unwrap();

        assert_eq!(captured.kind(), ExceptionKind::Panic);
        assert_eq!(captured.message(), "Test exception");
        let location = captured.location().unwrap();
        assert!(location.contains("exception.rs"), "{location}");
        assert!(captured.trace().contains(location));
        assert!(captured.trace().contains("Test exception"));
    }

    #[test]
    fn test_capture_formatted_panic_payload() {
        let code = 7;
        let captured = capture(|| panic!("code {code}")).unwrap();
        assert_eq!(captured.message(), "code 7");
    }

    #[test]
    fn test_capture_flag_reset_after_panic() {
        let _ = capture(|| panic!("boom"));
        assert!(!CAPTURING.with(Cell::get));
    }

    #[test]
    fn test_truncate_trace() {
        let mut captured = CapturedException::from_error(&anyhow::anyhow!("é".repeat(100)));
        captured.truncate_trace(11);
        assert!(captured.trace().starts_with("ééééé"));
        assert!(captured.trace().ends_with("[trace truncated]"));
        assert_eq!(captured.message().len(), 200);
    }

    #[test]
    fn test_display_is_message() {
        let captured = CapturedException::from_error(&anyhow::anyhow!("bad token"));
        assert_eq!(captured.to_string(), "bad token");
    }

    #[test]
    fn test_raised_error_records_location() {
        let line = line!() + 1;
        let captured = capture(|| Err(raise("bad frame"))).unwrap();

        assert_eq!(captured.kind(), ExceptionKind::Error);
        assert_eq!(captured.message(), "bad frame");
        let location = captured.location().unwrap();
        assert!(location.contains(&format!("exception.rs:{line}:")), "{location}");
        assert!(captured.trace().starts_with(&format!("raised at {location}")));
    }

    #[test]
    fn test_raised_location_survives_context() {
        let captured = capture(|| Err(raise("socket closed")).context("update failed")).unwrap();

        assert_eq!(captured.message(), "update failed");
        assert!(captured.location().unwrap().contains("exception.rs"));
        assert!(captured.trace().contains("socket closed"));
    }

    #[test]
    fn test_fail_macro_returns_located_error() {
        fn connect(retries: u32) -> anyhow::Result<()> {
            if retries == 0 {
                crate::fail!("no retries left after {retries}");
            }
            Ok(())
        }

        let captured = capture(|| connect(0)).unwrap();
        assert_eq!(captured.message(), "no retries left after 0");
        assert!(captured.location().unwrap().contains("exception.rs"));
    }
}
