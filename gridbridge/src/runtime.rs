//! The native runtime context.
//!
//! A [`Runtime`] owns the call table, lazily creates the single isolate it
//! talks to, and is the only place native functions are invoked from:
//!
//! 1. [`Attachment`] attaches the calling OS thread for the duration of one
//!    call, or reuses the attachment of an enclosing call on the same thread.
//! 2. The optional before-call hook runs (log level propagation).
//! 3. The native function runs with the thread prepended and a call-scoped
//!    [`ExceptionSlot`] appended.
//! 4. A filled slot becomes [`BridgeError::Native`]; the native message is
//!    released exactly once while converting it.
//! 5. The optional after-call hook runs (host callback error check). A host
//!    callback error still pending when the call ends is logged and dropped,
//!    so it is never reported by a later call.
//!
//! One process-wide runtime can be registered with [`Runtime::install`] for
//! the host binding layer. Independent runtimes remain constructible, which
//! is how tests inject a fake engine.

use std::ffi::{CStr, c_void};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::array::LocalStringArray;
use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::library::NativeLibrary;
use crate::logging::{self, HostErrorScope, LogSink, SinkSlot};
use crate::native::{
    ExceptionSlot, Exc, ISOLATE_PARAMS_VERSION, Isolate, IsolateParams, IsolateThread, NativeApi,
    ObjectHandle, Thread,
};

/// Invoke a [`NativeApi`] entry through [`Runtime::call`].
///
/// `native_call!(runtime, create_network(id.as_ptr()))` expands to a call
/// of `api.create_network(thread, id.as_ptr(), exc)`.
#[macro_export]
macro_rules! native_call {
    ($runtime:expr, $func:ident($($arg:expr),* $(,)?)) => {
        $runtime.call(|api, thread, exc| unsafe { (api.$func)(thread, $($arg,)* exc) })
    };
}

/// Runs before every native call with the attached thread and the call's slot.
pub type BeforeCall = Box<dyn Fn(&NativeApi, Thread, &mut ExceptionSlot) + Send + Sync>;
/// Runs after every native call that did not fail natively.
pub type AfterCall = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Pre/post hooks shared by every call of a runtime.
#[derive(Default)]
pub struct CallHooks {
    before: Option<BeforeCall>,
    after: Option<AfterCall>,
}

impl CallHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log level propagation before each call, host callback errors after it.
    pub fn standard() -> Self {
        Self::new()
            .before_call(logging::propagate_log_level())
            .after_call(logging::check_host_error)
    }

    pub fn before_call(
        mut self,
        hook: impl Fn(&NativeApi, Thread, &mut ExceptionSlot) + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    pub fn after_call(mut self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.after = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for CallHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

struct IsolatePtr(NonNull<Isolate>);

// Safety: the isolate is a process-global native object designed to be used
// from any attached thread.
unsafe impl Send for IsolatePtr {}
unsafe impl Sync for IsolatePtr {}

const OPEN: u8 = 0;
/// `close` is running. Only threads that are already attached may call in.
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

struct RuntimeInner {
    api: NativeApi,
    config: RuntimeConfig,
    /// Set once by the first call; read without locking afterwards.
    isolate: OnceCell<IsolatePtr>,
    phase: AtomicU8,
    /// Serialises isolate creation against shutdown.
    lifecycle: Mutex<()>,
    hooks: RwLock<Arc<CallHooks>>,
    /// Every sink ever registered; the native side may still hold a pointer.
    log_sinks: Mutex<Vec<Box<SinkSlot>>>,
    _library: Option<NativeLibrary>,
}

/// Shared handle to a native runtime context. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: OnceCell<Runtime> = OnceCell::new();

impl Runtime {
    /// Build a runtime over an explicit call table. No native code runs
    /// until the first call.
    pub fn new(api: NativeApi, config: RuntimeConfig) -> Self {
        Self::build(api, config, None)
    }

    /// Build a runtime over a loaded library, keeping the library alive.
    pub fn from_library(library: NativeLibrary, config: RuntimeConfig) -> Self {
        let api = *library.api();
        Self::build(api, config, Some(library))
    }

    fn build(api: NativeApi, config: RuntimeConfig, library: Option<NativeLibrary>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                api,
                config,
                isolate: OnceCell::new(),
                phase: AtomicU8::new(OPEN),
                lifecycle: Mutex::new(()),
                hooks: RwLock::new(Arc::new(CallHooks::default())),
                log_sinks: Mutex::new(Vec::new()),
                _library: library,
            }),
        }
    }

    /// Register `runtime` as the process-wide runtime. Only the first call
    /// succeeds.
    pub fn install(runtime: Runtime) -> Result<&'static Runtime> {
        GLOBAL
            .set(runtime)
            .map_err(|_| BridgeError::AlreadyInstalled)?;
        Self::global()
    }

    /// The runtime registered with [`Runtime::install`].
    pub fn global() -> Result<&'static Runtime> {
        GLOBAL.get().ok_or(BridgeError::NotInstalled)
    }

    pub fn api(&self) -> &NativeApi {
        &self.inner.api
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Replace the call hooks. Intended to be called once during start-up;
    /// calls already in flight keep the hooks they started with.
    pub fn set_hooks(&self, hooks: CallHooks) {
        tracing::debug!(?hooks, "native call hooks configured");
        *self.inner.hooks.write() = Arc::new(hooks);
    }

    /// Whether both values refer to the same runtime context.
    pub fn same_runtime(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach the calling thread, creating the isolate on first use.
    pub fn attach(&self) -> Result<Attachment<'_>> {
        let (isolate, phase) = self.isolate()?;
        Attachment::acquire(&self.inner.api, isolate, phase == OPEN)
    }

    /// Invoke a native function and return its result.
    ///
    /// `f` receives the call table, the attached thread and the exception
    /// slot, and is expected to make exactly one native call with them.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&NativeApi, Thread, Exc) -> T,
    {
        self.call_with(f, |value| value)
    }

    /// Like [`Runtime::call`], but hands the raw result to `own` before the
    /// after-call hook runs. If the hook fails, the owning value is dropped
    /// while the thread is still attached and releases the native result.
    pub fn call_with<R, T, F, O>(&self, f: F, own: O) -> Result<T>
    where
        F: FnOnce(&NativeApi, Thread, Exc) -> R,
        O: FnOnce(R) -> T,
    {
        let attachment = self.attach()?;
        let hooks = Arc::clone(&self.inner.hooks.read());
        let outcome = dispatch(
            &self.inner.api,
            attachment.thread(),
            attachment.is_nested(),
            &hooks,
            f,
            own,
        );
        let released = attachment.release();
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Invoke a native function returning nothing.
    pub fn call_void<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&NativeApi, Thread, Exc),
    {
        self.call(f)
    }

    /// Invoke a native function returning an object reference and wrap it.
    pub fn call_handle<F>(&self, f: F) -> Result<Handle>
    where
        F: FnOnce(&NativeApi, Thread, Exc) -> ObjectHandle,
    {
        self.call_with(f, |ptr| Handle::wrap(self, ptr))
    }

    /// Route native log records to `sink`.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) -> Result<()> {
        let slot = Box::new(SinkSlot::new(sink));
        let user_data = (&*slot as *const SinkSlot).cast_mut().cast::<c_void>();
        self.call(|api, thread, exc| unsafe {
            (api.set_logger)(thread, logging::forward_native_log, user_data, exc)
        })?;
        self.inner.log_sinks.lock().push(slot);
        Ok(())
    }

    /// Close the native side and tear the isolate down.
    ///
    /// Later calls fail with [`BridgeError::Closed`]. Shutting down a runtime
    /// that never created its isolate only marks it closed. While native
    /// `close` runs, log sinks on the closing thread may still call in.
    pub fn shutdown(&self) -> Result<()> {
        let api = &self.inner.api;
        let isolate = {
            let _lifecycle = self.inner.lifecycle.lock();
            let Some(isolate) = self.inner.isolate.get() else {
                self.inner.phase.store(CLOSED, Ordering::Release);
                return Ok(());
            };
            if self
                .inner
                .phase
                .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            isolate.0.as_ptr()
        };

        let mut attachment = match Attachment::acquire(api, isolate, true) {
            Ok(attachment) => attachment,
            Err(err) => {
                self.inner.phase.store(OPEN, Ordering::Release);
                return Err(err);
            }
        };
        let thread = attachment.thread();
        let scope = HostErrorScope::enter(attachment.is_nested());
        let mut slot = ExceptionSlot::default();
        unsafe { (api.close)(thread, &raw mut slot) };
        let closed = check_exception(api, thread, &mut slot);
        let host = logging::take_host_error();
        drop(scope);

        // Tear-down consumes the thread; it must not be detached afterwards.
        attachment.disarm();
        let code = unsafe { (api.tear_down_isolate)(thread) };
        self.inner.phase.store(CLOSED, Ordering::Release);
        tracing::debug!(code, "native isolate torn down");

        closed?;
        if let Some(message) = host {
            return Err(BridgeError::HostCallback(message));
        }
        if code != 0 {
            return Err(BridgeError::Bootstrap {
                operation: "tear_down_isolate",
                code,
            });
        }
        Ok(())
    }

    /// The isolate and the lifecycle phase it was seen in.
    fn isolate(&self) -> Result<(*mut Isolate, u8)> {
        let inner = &self.inner;
        if let Some(isolate) = inner.isolate.get() {
            return match inner.phase.load(Ordering::Acquire) {
                CLOSED => Err(BridgeError::Closed),
                phase => Ok((isolate.0.as_ptr(), phase)),
            };
        }
        let _lifecycle = inner.lifecycle.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase == CLOSED {
            return Err(BridgeError::Closed);
        }
        let isolate = inner
            .isolate
            .get_or_try_init(|| create_isolate(&inner.api, &inner.config).map(IsolatePtr))?;
        Ok((isolate.0.as_ptr(), phase))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn create_isolate(api: &NativeApi, config: &RuntimeConfig) -> Result<NonNull<Isolate>> {
    let mut argv = LocalStringArray::new(&config.options, "runtime options")?;
    let mut params = IsolateParams {
        version: ISOLATE_PARAMS_VERSION,
        argc: argv.length(),
        argv: argv.as_mut_ptr(),
    };
    let mut isolate = ptr::null_mut();
    let mut thread = ptr::null_mut();
    let code = unsafe { (api.create_isolate)(&raw mut params, &raw mut isolate, &raw mut thread) };
    let isolate = match NonNull::new(isolate) {
        Some(isolate) if code == 0 => isolate,
        _ => {
            tracing::error!(code, "native isolate creation failed");
            return Err(BridgeError::Bootstrap {
                operation: "create_isolate",
                code,
            });
        }
    };
    tracing::debug!(options = ?config.options, "native isolate created");
    Ok(isolate)
}

fn dispatch<R, T, F, O>(
    api: &NativeApi,
    thread: Thread,
    nested: bool,
    hooks: &CallHooks,
    f: F,
    own: O,
) -> Result<T>
where
    F: FnOnce(&NativeApi, Thread, Exc) -> R,
    O: FnOnce(R) -> T,
{
    // Host callback errors raised during this call never outlive it.
    let _scope = HostErrorScope::enter(nested);
    let mut slot = ExceptionSlot::default();
    if let Some(before) = &hooks.before {
        before(api, thread, &mut slot);
        check_exception(api, thread, &mut slot)?;
    }
    let raw = f(api, thread, &raw mut slot);
    check_exception(api, thread, &mut slot)?;
    let value = own(raw);
    if let Some(after) = &hooks.after {
        after()?;
    }
    Ok(value)
}

/// Turn a filled slot into [`BridgeError::Native`], releasing the message.
pub(crate) fn check_exception(
    api: &NativeApi,
    thread: Thread,
    slot: &mut ExceptionSlot,
) -> Result<()> {
    let message = std::mem::replace(&mut slot.message, ptr::null_mut());
    if message.is_null() {
        return Ok(());
    }
    let text = unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned();
    let mut release = ExceptionSlot::default();
    unsafe { (api.free_string)(thread, message, &raw mut release) };
    if release.is_set() {
        tracing::warn!("native free_string failed while releasing an exception message");
    }
    Err(BridgeError::Native(text))
}

/// Attachment of the calling OS thread to the isolate.
///
/// Detaches on release or drop, but only if this guard performed the attach;
/// a guard created inside an enclosing call on the same thread is nested and
/// leaves the attachment alone.
pub struct Attachment<'rt> {
    api: &'rt NativeApi,
    thread: NonNull<IsolateThread>,
    owned: bool,
}

impl<'rt> Attachment<'rt> {
    fn acquire(api: &'rt NativeApi, isolate: *mut Isolate, may_attach: bool) -> Result<Self> {
        let current = unsafe { (api.get_current_thread)(isolate) };
        if let Some(thread) = NonNull::new(current) {
            return Ok(Self {
                api,
                thread,
                owned: false,
            });
        }
        if !may_attach {
            return Err(BridgeError::Closed);
        }

        let mut thread = ptr::null_mut();
        let code = unsafe { (api.attach_thread)(isolate, &raw mut thread) };
        let thread = match NonNull::new(thread) {
            Some(thread) if code == 0 => thread,
            _ => {
                return Err(BridgeError::Bootstrap {
                    operation: "attach_thread",
                    code,
                });
            }
        };
        tracing::debug!("thread attached to native isolate");
        Ok(Self {
            api,
            thread,
            owned: true,
        })
    }

    pub fn thread(&self) -> Thread {
        self.thread.as_ptr()
    }

    /// Whether an enclosing call already attached this thread.
    pub fn is_nested(&self) -> bool {
        !self.owned
    }

    /// Detach now, reporting failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.detach()
    }

    fn disarm(&mut self) {
        self.owned = false;
    }

    fn detach(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        let code = unsafe { (self.api.detach_thread)(self.thread.as_ptr()) };
        if code != 0 {
            return Err(BridgeError::Bootstrap {
                operation: "detach_thread",
                code,
            });
        }
        tracing::debug!("thread detached from native isolate");
        Ok(())
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            tracing::error!(%err, "failed to detach thread from native isolate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_is_absent_until_installed() {
        // Nothing in the unit tests installs a global runtime.
        assert!(matches!(Runtime::global(), Err(BridgeError::NotInstalled)));
    }

    #[test]
    fn hooks_debug_reports_presence() {
        let hooks = CallHooks::new().after_call(|| Ok(()));
        assert_eq!(
            format!("{hooks:?}"),
            "CallHooks { before: false, after: true }"
        );
    }

    #[test]
    fn standard_hooks_install_both() {
        let hooks = CallHooks::standard();
        assert!(hooks.before.is_some());
        assert!(hooks.after.is_some());
    }
}
