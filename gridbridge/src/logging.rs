//! Logging across the boundary, in both directions.
//!
//! Native records reach the host through [`forward_native_log`], a C callback
//! registered with [`Runtime::set_log_sink`](crate::Runtime::set_log_sink).
//! The host verbosity reaches the native side through the
//! [`propagate_log_level`] before-call hook.
//!
//! A sink runs inside a native call and cannot return an error to it. Its
//! failures are parked in a per-thread slot instead, and the
//! [`check_host_error`] after-call hook raises them as
//! [`BridgeError::HostCallback`] once the native call has returned.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_longlong, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{DateTime, Utc};
use tracing::Level;
use tracing::level_filters::LevelFilter;

use crate::array::read_c_str;
use crate::error::{BridgeError, Result};
use crate::native::{ExceptionSlot, NativeApi, Thread};

/// `tracing` target used for records coming from the native side.
pub const NATIVE_TARGET: &str = "gridbridge::native";

/// Integer log levels understood by the native side.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NativeLogLevel {
    Trace = 5,
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
    Off = 50,
}

impl NativeLogLevel {
    /// Bucket an arbitrary native level into the nearest known one.
    pub fn from_raw(level: c_int) -> Self {
        match level {
            i32::MIN..=5 => Self::Trace,
            6..=10 => Self::Debug,
            11..=20 => Self::Info,
            21..=30 => Self::Warn,
            31..=40 => Self::Error,
            _ => Self::Off,
        }
    }

    pub fn from_filter(filter: LevelFilter) -> Self {
        let Some(level) = filter.into_level() else {
            return Self::Off;
        };
        if level == Level::ERROR {
            Self::Error
        } else if level == Level::WARN {
            Self::Warn
        } else if level == Level::INFO {
            Self::Info
        } else if level == Level::DEBUG {
            Self::Debug
        } else {
            Self::Trace
        }
    }

    pub fn as_raw(self) -> c_int {
        self as c_int
    }
}

/// One record emitted by the native side.
#[derive(Debug, Clone, Copy)]
pub struct NativeLogRecord<'a> {
    pub level: NativeLogLevel,
    pub timestamp: Option<DateTime<Utc>>,
    pub logger: &'a str,
    pub message: &'a str,
}

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for native log records.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &NativeLogRecord<'_>) -> Result<(), SinkError>;
}

/// Re-emits native records as `tracing` events on [`NATIVE_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: &NativeLogRecord<'_>) -> Result<(), SinkError> {
        let logger = record.logger;
        let timestamp = record.timestamp.map(|t| t.to_rfc3339());
        let message = record.message;
        match record.level {
            NativeLogLevel::Trace => {
                tracing::trace!(target: NATIVE_TARGET, logger, ?timestamp, "{message}")
            }
            NativeLogLevel::Debug => {
                tracing::debug!(target: NATIVE_TARGET, logger, ?timestamp, "{message}")
            }
            NativeLogLevel::Info => {
                tracing::info!(target: NATIVE_TARGET, logger, ?timestamp, "{message}")
            }
            NativeLogLevel::Warn => {
                tracing::warn!(target: NATIVE_TARGET, logger, ?timestamp, "{message}")
            }
            NativeLogLevel::Error | NativeLogLevel::Off => {
                tracing::error!(target: NATIVE_TARGET, logger, ?timestamp, "{message}")
            }
        }
        Ok(())
    }
}

/// Heap slot whose address is registered as the callback's `user_data`.
pub(crate) struct SinkSlot {
    sink: Arc<dyn LogSink>,
}

impl SinkSlot {
    pub(crate) fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

/// C callback registered with the native `set_logger`.
///
/// # Safety
///
/// `user_data` must be null or point to a live `SinkSlot`; the string
/// arguments must be null or NUL-terminated.
pub(crate) unsafe extern "C" fn forward_native_log(
    user_data: *mut c_void,
    level: c_int,
    timestamp_ms: c_longlong,
    logger_name: *const c_char,
    message: *const c_char,
) {
    if user_data.is_null() {
        return;
    }
    let slot = unsafe { &*user_data.cast::<SinkSlot>() };
    let logger = unsafe { read_c_str(logger_name) };
    let message = unsafe { read_c_str(message) };
    let record = NativeLogRecord {
        level: NativeLogLevel::from_raw(level),
        timestamp: DateTime::from_timestamp_millis(timestamp_ms),
        logger: &logger,
        message: &message,
    };

    // Unwinding into native frames is not allowed.
    match panic::catch_unwind(AssertUnwindSafe(|| slot.sink.log(&record))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => raise_host_error(err.to_string()),
        Err(_) => raise_host_error("log sink panicked"),
    }
}

thread_local! {
    static PENDING_HOST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Park a host-side failure on the current thread. The first pending error
/// wins; later ones are logged and dropped.
pub fn raise_host_error(message: impl Into<String>) {
    let message = message.into();
    PENDING_HOST_ERROR.with(|pending| {
        let mut pending = pending.borrow_mut();
        if pending.is_none() {
            *pending = Some(message);
        } else {
            tracing::warn!(%message, "host callback error dropped, another one is pending");
        }
    });
}

/// Take the error parked on the current thread, if any.
pub fn take_host_error() -> Option<String> {
    PENDING_HOST_ERROR.with(|pending| pending.borrow_mut().take())
}

/// Host error slot bounds for one native call.
///
/// Entering a nested call sets the enclosing call's pending error aside and
/// leaving restores it. Entering an outermost call discards anything stale.
/// An error still parked when the call ends, because the call failed before
/// the after-call hook ran or no hook drains the slot, is logged and dropped.
pub(crate) struct HostErrorScope {
    enclosing: Option<String>,
}

impl HostErrorScope {
    pub(crate) fn enter(nested: bool) -> Self {
        let pending = take_host_error();
        if nested {
            return Self { enclosing: pending };
        }
        if let Some(message) = pending {
            tracing::warn!(%message, "stale host callback error discarded");
        }
        Self { enclosing: None }
    }
}

impl Drop for HostErrorScope {
    fn drop(&mut self) {
        if let Some(message) = take_host_error() {
            tracing::warn!(%message, "host callback error dropped with its call");
        }
        if let Some(message) = self.enclosing.take() {
            PENDING_HOST_ERROR.with(|pending| *pending.borrow_mut() = Some(message));
        }
    }
}

/// After-call hook: fail the call if a callback parked an error.
pub fn check_host_error() -> Result<()> {
    match take_host_error() {
        Some(message) => Err(BridgeError::HostCallback(message)),
        None => Ok(()),
    }
}

/// Before-call hook: push the current `tracing` verbosity to the native side.
///
/// The native `set_log_level` is only called when the level differs from
/// the last one successfully sent by this hook.
pub fn propagate_log_level() -> impl Fn(&NativeApi, Thread, &mut ExceptionSlot) + Send + Sync + 'static
{
    let last_sent = AtomicI32::new(i32::MIN);
    move |api, thread, slot| {
        let level = NativeLogLevel::from_filter(LevelFilter::current()).as_raw();
        if last_sent.load(Ordering::Relaxed) == level {
            return;
        }
        unsafe { (api.set_log_level)(thread, level, &raw mut *slot) };
        if !slot.is_set() {
            last_sent.store(level, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::atomic::AtomicUsize;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn log(&self, record: &NativeLogRecord<'_>) -> Result<(), SinkError> {
            Err(format!("rejected record from {}", record.logger).into())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        seen: AtomicUsize,
    }

    impl LogSink for CountingSink {
        fn log(&self, record: &NativeLogRecord<'_>) -> Result<(), SinkError> {
            assert_eq!(record.level, NativeLogLevel::Warn);
            assert_eq!(record.message, "slack bus mismatch");
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn raw_levels_bucket_upwards() {
        assert_eq!(NativeLogLevel::from_raw(0), NativeLogLevel::Trace);
        assert_eq!(NativeLogLevel::from_raw(10), NativeLogLevel::Debug);
        assert_eq!(NativeLogLevel::from_raw(15), NativeLogLevel::Info);
        assert_eq!(NativeLogLevel::from_raw(30), NativeLogLevel::Warn);
        assert_eq!(NativeLogLevel::from_raw(40), NativeLogLevel::Error);
        assert_eq!(NativeLogLevel::from_raw(1000), NativeLogLevel::Off);
    }

    #[test]
    fn filters_map_to_native_levels() {
        assert_eq!(NativeLogLevel::from_filter(LevelFilter::OFF), NativeLogLevel::Off);
        assert_eq!(NativeLogLevel::from_filter(LevelFilter::INFO), NativeLogLevel::Info);
        assert_eq!(NativeLogLevel::from_filter(LevelFilter::TRACE).as_raw(), 5);
    }

    #[test]
    fn first_pending_error_wins() {
        raise_host_error("first");
        raise_host_error("second");
        assert_eq!(take_host_error().as_deref(), Some("first"));
        assert!(take_host_error().is_none());
        assert!(check_host_error().is_ok());
    }

    #[test]
    fn failing_sink_parks_error_on_calling_thread() {
        let slot = SinkSlot::new(Arc::new(FailingSink));
        let logger = CString::new("loadflow").unwrap();
        let message = CString::new("iteration 3").unwrap();
        unsafe {
            forward_native_log(
                (&slot as *const SinkSlot).cast_mut().cast(),
                20,
                1_700_000_000_000,
                logger.as_ptr(),
                message.as_ptr(),
            )
        };
        match check_host_error() {
            Err(BridgeError::HostCallback(msg)) => assert_eq!(msg, "rejected record from loadflow"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn records_reach_sink() {
        let sink = Arc::new(CountingSink::default());
        let slot = SinkSlot::new(sink.clone());
        let message = CString::new("slack bus mismatch").unwrap();
        unsafe {
            forward_native_log(
                (&slot as *const SinkSlot).cast_mut().cast(),
                30,
                0,
                std::ptr::null(),
                message.as_ptr(),
            )
        };
        assert_eq!(sink.seen.load(Ordering::SeqCst), 1);
        assert!(take_host_error().is_none());
    }

    #[test]
    fn scope_end_drops_undrained_error() {
        {
            let _scope = HostErrorScope::enter(false);
            raise_host_error("sink failed during a failing call");
        }
        assert!(take_host_error().is_none());
    }

    #[test]
    fn outermost_scope_discards_stale_error() {
        raise_host_error("left over");
        let _scope = HostErrorScope::enter(false);
        assert!(check_host_error().is_ok());
    }

    #[test]
    fn nested_scope_restores_enclosing_error() {
        let _outer = HostErrorScope::enter(false);
        raise_host_error("outer");
        {
            let _inner = HostErrorScope::enter(true);
            assert!(take_host_error().is_none(), "inner call sees a clean slot");
            raise_host_error("inner");
            assert_eq!(take_host_error().as_deref(), Some("inner"));
        }
        assert_eq!(take_host_error().as_deref(), Some("outer"));
    }

    #[test]
    fn null_user_data_is_ignored() {
        unsafe { forward_native_log(std::ptr::null_mut(), 20, 0, std::ptr::null(), std::ptr::null()) };
        assert!(take_host_error().is_none());
    }
}
