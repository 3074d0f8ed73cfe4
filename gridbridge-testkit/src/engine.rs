//! Per-engine state and the public test handle.
//!
//! Engines are registered in a process-wide table and selected by the
//! `--fake-engine=<id>` runtime option when an isolate is created, so tests
//! running in parallel never share counters.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use gridbridge::native::{LogCallback, NativeApi, ObjectHandle};
use gridbridge::{LoadFlowParameters, Runtime, RuntimeConfig, SecurityAnalysisParameters, Series};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::entry;
use crate::memory::Alloc;
use crate::network::FakeNetwork;

/// Runtime option selecting the engine an isolate belongs to.
pub const ENGINE_OPTION: &str = "--fake-engine";
/// Makes isolate creation return a non-zero code.
pub const FAIL_CREATE_OPTION: &str = "--fail-create";
/// Makes every `attach_thread` return a non-zero code.
pub const FAIL_ATTACH_OPTION: &str = "--fail-attach";
/// Makes `set_log_level` fill the exception slot.
pub const REJECT_LOG_LEVEL_OPTION: &str = "--reject-log-level";

static ENGINES: Lazy<DashMap<u64, Arc<EngineState>>> = Lazy::new(DashMap::new);
static NEXT_ENGINE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Isolate address to the thread handle attached on this OS thread.
    static ATTACHED: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        #[derive(Default)]
        pub(crate) struct Counters {
            $(pub(crate) $name: AtomicUsize,)*
        }

        /// Number of times each native entry point was called.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct CallCounts {
            $($(#[$meta])* pub $name: usize,)*
        }

        impl Counters {
            fn snapshot(&self) -> CallCounts {
                CallCounts {
                    $($name: self.$name.load(Ordering::SeqCst),)*
                }
            }
        }
    };
}

counters! {
    /// Attachments made by `attach_thread`; the creating thread is not counted.
    attach,
    detach,
    tear_down,
    destroy,
    free_string,
    free_array,
    free_string_array,
    free_series_array,
    free_load_flow_parameters,
    free_security_analysis_parameters,
    set_logger,
    set_log_level,
    close,
    /// Exception messages handed out.
    exceptions,
    /// Frees of unknown addresses or through the wrong entry point.
    invalid_free,
    /// Log records delivered to the registered callback.
    log_records,
}

pub(crate) fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

#[derive(Clone, Copy)]
pub(crate) struct Logger {
    pub(crate) callback: LogCallback,
    pub(crate) user_data: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum FakeObject {
    Network(FakeNetwork),
    SecurityAnalysis(Vec<(String, Vec<String>)>),
    SecurityResult(Vec<Series>),
}

pub(crate) struct EngineState {
    pub(crate) counters: Counters,
    pub(crate) options: Mutex<Vec<String>>,
    pub(crate) fail_attach: AtomicBool,
    pub(crate) reject_log_level: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) log_level: AtomicI32,
    pub(crate) logger: Mutex<Option<Logger>>,
    pub(crate) objects: DashMap<usize, FakeObject>,
    next_object: AtomicUsize,
    pub(crate) allocations: DashMap<usize, Alloc>,
    pending_failure: Mutex<Option<String>>,
    pub(crate) last_load_flow_parameters: Mutex<Option<LoadFlowParameters>>,
    pub(crate) last_security_parameters: Mutex<Option<SecurityAnalysisParameters>>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            counters: Counters::default(),
            options: Mutex::new(Vec::new()),
            fail_attach: AtomicBool::new(false),
            reject_log_level: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            log_level: AtomicI32::new(-1),
            logger: Mutex::new(None),
            objects: DashMap::new(),
            next_object: AtomicUsize::new(1),
            allocations: DashMap::new(),
            pending_failure: Mutex::new(None),
            last_load_flow_parameters: Mutex::new(None),
            last_security_parameters: Mutex::new(None),
        }
    }

    /// Find the engine named by the runtime options.
    pub(crate) fn lookup(options: &[String]) -> Option<Arc<Self>> {
        let prefix = format!("{ENGINE_OPTION}=");
        let id = options
            .iter()
            .find_map(|option| option.strip_prefix(&prefix))?
            .parse::<u64>()
            .ok()?;
        ENGINES.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn insert_object(&self, object: FakeObject) -> ObjectHandle {
        let id = self.next_object.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(id, object);
        std::ptr::without_provenance_mut(id)
    }

    pub(crate) fn object(&self, handle: ObjectHandle) -> Result<FakeObject, String> {
        self.objects
            .get(&handle.addr())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| format!("Unknown object handle {:#x}", handle.addr()))
    }

    pub(crate) fn network(&self, handle: ObjectHandle) -> Result<FakeNetwork, String> {
        match self.object(handle)? {
            FakeObject::Network(network) => Ok(network),
            other => Err(format!("Expected a network, got {}", kind(&other))),
        }
    }

    pub(crate) fn replace_object(&self, handle: ObjectHandle, object: FakeObject) {
        self.objects.insert(handle.addr(), object);
    }

    pub(crate) fn register(&self, addr: usize, alloc: Alloc) {
        self.allocations.insert(addr, alloc);
    }

    /// Unregister a buffer about to be freed through the `expected` path.
    pub(crate) fn release(&self, addr: usize, expected: Alloc) -> Result<(), String> {
        match self.allocations.remove(&addr) {
            Some((_, alloc)) if alloc == expected => Ok(()),
            Some((addr, alloc)) => {
                self.allocations.insert(addr, alloc);
                bump(&self.counters.invalid_free);
                Err(format!("{addr:#x} is a {alloc:?} buffer, not a {expected:?} buffer"))
            }
            None => {
                bump(&self.counters.invalid_free);
                Err(format!("{addr:#x} was not allocated by this engine"))
            }
        }
    }

    /// Fail with the message queued by [`FakeEngine::fail_next_call`], if any.
    pub(crate) fn take_failure(&self) -> Result<(), String> {
        match self.pending_failure.lock().take() {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    /// Deliver a record to the registered logger. The lock is not held
    /// during the callback, which may call back into the engine.
    pub(crate) fn emit_log(&self, level: c_int, logger: &str, message: &str) {
        let Some(registered) = *self.logger.lock() else {
            return;
        };
        let logger = crate::memory::native_string(logger);
        let message = crate::memory::native_string(message);
        bump(&self.counters.log_records);
        unsafe {
            (registered.callback)(
                std::ptr::with_exposed_provenance_mut::<c_void>(registered.user_data),
                level,
                1_700_000_000_000,
                logger,
                message,
            );
            crate::memory::drop_string(logger);
            crate::memory::drop_string(message);
        }
    }
}

fn kind(object: &FakeObject) -> &'static str {
    match object {
        FakeObject::Network(_) => "network",
        FakeObject::SecurityAnalysis(_) => "security analysis",
        FakeObject::SecurityResult(_) => "security analysis result",
    }
}

pub(crate) fn attached(isolate: usize) -> Option<usize> {
    ATTACHED.with(|attached| attached.borrow().get(&isolate).copied())
}

pub(crate) fn mark_attached(isolate: usize, thread: usize) {
    ATTACHED.with(|attached| attached.borrow_mut().insert(isolate, thread));
}

pub(crate) fn mark_detached(isolate: usize, thread: usize) -> bool {
    ATTACHED.with(|attached| {
        let mut attached = attached.borrow_mut();
        if attached.get(&isolate) == Some(&thread) {
            attached.remove(&isolate);
            true
        } else {
            false
        }
    })
}

/// A fake native engine for one test.
///
/// Dropping it unregisters the engine; runtimes that already created their
/// isolate keep working against its state.
pub struct FakeEngine {
    id: u64,
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let id = NEXT_ENGINE.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(EngineState::new());
        ENGINES.insert(id, Arc::clone(&state));
        Self { id, state }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The call table every fake runtime uses.
    pub fn api(&self) -> NativeApi {
        entry::api()
    }

    /// Options selecting this engine.
    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::default().with_option(format!("{ENGINE_OPTION}={}", self.id))
    }

    pub fn runtime(&self) -> Runtime {
        Runtime::new(self.api(), self.config())
    }

    /// A runtime with extra whitespace-separated options.
    pub fn runtime_with(&self, options: &str) -> Runtime {
        let mut config = self.config();
        config.options.extend(RuntimeConfig::parse(options).options);
        Runtime::new(self.api(), config)
    }

    pub fn counts(&self) -> CallCounts {
        self.state.counters.snapshot()
    }

    /// Options received by the last isolate creation.
    pub fn options(&self) -> Vec<String> {
        self.state.options.lock().clone()
    }

    /// Native objects not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.objects.len()
    }

    /// Native buffers handed out and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.allocations.len()
    }

    /// Make the next domain call fill the exception slot with `message`.
    pub fn fail_next_call(&self, message: impl Into<String>) {
        *self.state.pending_failure.lock() = Some(message.into());
    }

    /// Last level received through `set_log_level`, `-1` if none.
    pub fn log_level(&self) -> i32 {
        self.state.log_level.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Emit a log record as if the engine logged on the calling thread.
    pub fn log(&self, level: i32, logger: &str, message: &str) {
        self.state.emit_log(level, logger, message);
    }

    pub fn last_load_flow_parameters(&self) -> Option<LoadFlowParameters> {
        self.state.last_load_flow_parameters.lock().clone()
    }

    pub fn last_security_analysis_parameters(&self) -> Option<SecurityAnalysisParameters> {
        self.state.last_security_parameters.lock().clone()
    }

    /// Contingencies registered on a security analysis object.
    pub fn contingencies(&self, handle: ObjectHandle) -> Vec<(String, Vec<String>)> {
        match self.state.object(handle) {
            Ok(FakeObject::SecurityAnalysis(contingencies)) => contingencies,
            _ => Vec::new(),
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        ENGINES.remove(&self.id);
    }
}
