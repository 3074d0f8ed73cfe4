//! The fake engine's C entry points.
//!
//! They are plain `unsafe extern "C" fn` items collected into a
//! [`NativeApi`] by [`api`]; nothing is exported from the binary.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_uchar, c_void};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use gridbridge::array::{raw_slice, read_c_str, read_string_array};
use gridbridge::dataframe::read_dataframe;
use gridbridge::native::{
    ArrayDescriptor, DataframeArrayRaw, DataframeRaw, Exc, ISOLATE_PARAMS_VERSION, Isolate,
    IsolateParams, LoadFlowComponentResultRaw, LoadFlowParametersRaw, LogCallback, NativeApi,
    ObjectHandle, SecurityAnalysisParametersRaw, Thread,
};
use gridbridge::params::ParameterStruct;
use gridbridge::{ElementType, LoadFlowParameters, SecurityAnalysisParameters, Series, SeriesValues};

use crate::engine::{
    EngineState, FAIL_ATTACH_OPTION, FAIL_CREATE_OPTION, FakeObject, Logger,
    REJECT_LOG_LEVEL_OPTION, attached, bump, mark_attached, mark_detached,
};
use crate::memory::{self, Alloc, native_string};
use crate::network::FakeNetwork;

/// Provider name reported when the caller leaves it empty.
pub const DEFAULT_PROVIDER: &str = "OpenLoadFlow";

struct FakeIsolate {
    engine: Arc<EngineState>,
}

struct FakeThread {
    engine: Arc<EngineState>,
    isolate: usize,
}

pub(crate) fn api() -> NativeApi {
    NativeApi {
        create_isolate,
        get_current_thread,
        attach_thread,
        detach_thread,
        tear_down_isolate,
        free_string,
        free_array,
        free_string_array,
        free_series_array,
        destroy_object_handle,
        set_logger,
        set_log_level,
        close,
        create_network,
        get_sub_network,
        get_network_elements_ids,
        create_network_elements_series_array,
        update_network_elements_with_series,
        create_element,
        create_load_flow_parameters,
        free_load_flow_parameters,
        run_load_flow,
        create_security_analysis_parameters,
        free_security_analysis_parameters,
        create_security_analysis,
        add_contingency,
        run_security_analysis,
        get_limit_violations,
    }
}

/// Load flow parameters the engine hands out as its defaults.
pub fn engine_load_flow_parameters() -> LoadFlowParameters {
    LoadFlowParameters {
        countries_to_balance: vec!["FR".into(), "BE".into()],
        provider_parameters: BTreeMap::from([(
            "maxNewtonRaphsonIterations".into(),
            "15".into(),
        )]),
        ..LoadFlowParameters::default()
    }
}

/// Security analysis parameters the engine hands out as its defaults.
pub fn engine_security_analysis_parameters() -> SecurityAnalysisParameters {
    SecurityAnalysisParameters {
        load_flow_parameters: engine_load_flow_parameters(),
        flow_proportional_threshold: 0.15,
        provider_parameters: BTreeMap::from([("createResultExtension".into(), "false".into())]),
        ..SecurityAnalysisParameters::default()
    }
}

trait Fallback {
    fn fallback() -> Self;
}

impl Fallback for () {
    fn fallback() -> Self {}
}

impl<T> Fallback for *mut T {
    fn fallback() -> Self {
        ptr::null_mut()
    }
}

unsafe fn engine<'a>(thread: Thread) -> &'a EngineState {
    unsafe { &(*thread.cast::<FakeThread>()).engine }
}

/// Run `body` for the engine owning `thread`, turning `Err` into a filled
/// exception slot.
unsafe fn guarded<T: Fallback>(
    thread: Thread,
    exc: Exc,
    body: impl FnOnce(&EngineState) -> Result<T, String>,
) -> T {
    let state = unsafe { engine(thread) };
    match body(state) {
        Ok(value) => value,
        Err(message) => {
            let ptr = native_string(&message);
            state.register(ptr.addr(), Alloc::Message);
            bump(&state.counters.exceptions);
            unsafe { (*exc).message = ptr };
            T::fallback()
        }
    }
}

fn element_type(raw: c_int) -> Result<ElementType, String> {
    ElementType::try_from(raw).map_err(|raw| format!("Unknown element type {raw}"))
}

fn new_thread(engine: Arc<EngineState>, isolate: usize) -> Thread {
    let thread = Box::into_raw(Box::new(FakeThread { engine, isolate }));
    mark_attached(isolate, thread.expose_provenance());
    thread.cast()
}

unsafe extern "C" fn create_isolate(
    params: *mut IsolateParams,
    isolate: *mut *mut Isolate,
    thread: *mut Thread,
) -> c_int {
    let params = unsafe { &*params };
    if params.version != ISOLATE_PARAMS_VERSION {
        return 3;
    }
    let options = unsafe { read_string_array(params.argv, params.argc) };
    let Some(engine) = EngineState::lookup(&options) else {
        return 4;
    };
    let has = |flag: &str| options.iter().any(|option| option == flag);
    let fail_create = has(FAIL_CREATE_OPTION);
    engine.fail_attach.store(has(FAIL_ATTACH_OPTION), Ordering::SeqCst);
    engine
        .reject_log_level
        .store(has(REJECT_LOG_LEVEL_OPTION), Ordering::SeqCst);
    *engine.options.lock() = options.clone();
    if fail_create {
        return 1;
    }

    // Isolates are never freed, so their addresses are never reused.
    let fake = Box::into_raw(Box::new(FakeIsolate {
        engine: Arc::clone(&engine),
    }));
    let attached = new_thread(engine, fake.expose_provenance());
    unsafe {
        *isolate = fake.cast();
        *thread = attached;
    }
    tracing::debug!(?options, "fake isolate created");
    0
}

unsafe extern "C" fn get_current_thread(isolate: *mut Isolate) -> Thread {
    attached(isolate.addr()).map_or(ptr::null_mut(), ptr::with_exposed_provenance_mut)
}

unsafe extern "C" fn attach_thread(isolate: *mut Isolate, thread: *mut Thread) -> c_int {
    let fake = unsafe { &*isolate.cast::<FakeIsolate>() };
    if fake.engine.fail_attach.load(Ordering::SeqCst) {
        return 2;
    }
    if attached(isolate.addr()).is_some() {
        return 5;
    }
    bump(&fake.engine.counters.attach);
    unsafe { *thread = new_thread(Arc::clone(&fake.engine), isolate.addr()) };
    0
}

unsafe extern "C" fn detach_thread(thread: Thread) -> c_int {
    let fake = unsafe { &*thread.cast::<FakeThread>() };
    if !mark_detached(fake.isolate, thread.addr()) {
        return 6;
    }
    bump(&fake.engine.counters.detach);
    drop(unsafe { Box::from_raw(thread.cast::<FakeThread>()) });
    0
}

unsafe extern "C" fn tear_down_isolate(thread: Thread) -> c_int {
    let fake = unsafe { Box::from_raw(thread.cast::<FakeThread>()) };
    mark_detached(fake.isolate, thread.addr());
    bump(&fake.engine.counters.tear_down);
    fake.engine.closed.store(true, Ordering::SeqCst);
    tracing::debug!("fake isolate torn down");
    0
}

unsafe extern "C" fn free_string(thread: Thread, string: *mut c_char, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(string.addr(), Alloc::Message)?;
            bump(&state.counters.free_string);
            memory::drop_string(string);
            Ok(())
        })
    }
}

unsafe extern "C" fn free_array(thread: Thread, array: *mut ArrayDescriptor, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(array.addr(), Alloc::ComponentResults)?;
            bump(&state.counters.free_array);
            memory::free_component_results(array);
            Ok(())
        })
    }
}

unsafe extern "C" fn free_string_array(thread: Thread, array: *mut ArrayDescriptor, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(array.addr(), Alloc::StringArray)?;
            bump(&state.counters.free_string_array);
            memory::free_string_array(array);
            Ok(())
        })
    }
}

unsafe extern "C" fn free_series_array(thread: Thread, array: *mut ArrayDescriptor, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(array.addr(), Alloc::SeriesArray)?;
            bump(&state.counters.free_series_array);
            memory::free_series_array(array);
            Ok(())
        })
    }
}

unsafe extern "C" fn destroy_object_handle(thread: Thread, handle: ObjectHandle, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            if state.objects.remove(&handle.addr()).is_none() {
                bump(&state.counters.invalid_free);
                return Err(format!("Unknown object handle {:#x}", handle.addr()));
            }
            bump(&state.counters.destroy);
            Ok(())
        })
    }
}

unsafe extern "C" fn set_logger(
    thread: Thread,
    callback: LogCallback,
    user_data: *mut c_void,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            *state.logger.lock() = Some(Logger {
                callback,
                user_data: user_data.expose_provenance(),
            });
            bump(&state.counters.set_logger);
            Ok(())
        })
    }
}

unsafe extern "C" fn set_log_level(thread: Thread, level: c_int, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            bump(&state.counters.set_log_level);
            if state.reject_log_level.load(Ordering::SeqCst) {
                return Err(format!("Log level {level} rejected"));
            }
            state.log_level.store(level, Ordering::SeqCst);
            Ok(())
        })
    }
}

unsafe extern "C" fn close(thread: Thread, exc: Exc) {
    unsafe {
        guarded(thread, exc, |state| {
            bump(&state.counters.close);
            state.emit_log(20, "engine", "Closing isolate");
            *state.logger.lock() = None;
            Ok(())
        })
    }
}

unsafe extern "C" fn create_network(thread: Thread, factory: *const c_char, exc: Exc) -> ObjectHandle {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let factory = read_c_str(factory);
            let network = FakeNetwork::from_factory(&factory)
                .ok_or_else(|| format!("Network factory '{factory}' not found"))?;
            Ok(state.insert_object(FakeObject::Network(network)))
        })
    }
}

unsafe extern "C" fn get_sub_network(
    thread: Thread,
    network: ObjectHandle,
    voltage_level: *const c_char,
    exc: Exc,
) -> ObjectHandle {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let sub = state
                .network(network)?
                .sub_network(&read_c_str(voltage_level))?;
            Ok(state.insert_object(FakeObject::Network(sub)))
        })
    }
}

unsafe extern "C" fn get_network_elements_ids(
    thread: Thread,
    network: ObjectHandle,
    element: c_int,
    exc: Exc,
) -> *mut ArrayDescriptor {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let ids = state.network(network)?.ids(element_type(element)?)?;
            let array = memory::string_array(&ids);
            state.register(array.addr(), Alloc::StringArray);
            Ok(array)
        })
    }
}

unsafe extern "C" fn create_network_elements_series_array(
    thread: Thread,
    network: ObjectHandle,
    element: c_int,
    exc: Exc,
) -> *mut ArrayDescriptor {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let network = state.network(network)?;
            let array = memory::series_array(network.table(element_type(element)?)?);
            state.register(array.addr(), Alloc::SeriesArray);
            Ok(array)
        })
    }
}

unsafe extern "C" fn update_network_elements_with_series(
    thread: Thread,
    network: ObjectHandle,
    frame: *mut DataframeRaw,
    element: c_int,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let frame = read_dataframe(&*frame).map_err(|err| err.to_string())?;
            let mut updated = state.network(network)?;
            updated.update(element_type(element)?, &frame)?;
            state.replace_object(network, FakeObject::Network(updated));
            Ok(())
        })
    }
}

unsafe extern "C" fn create_element(
    thread: Thread,
    network: ObjectHandle,
    frames: *mut DataframeArrayRaw,
    element: c_int,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let frames = &*frames;
            let frames = raw_slice(frames.dataframes, frames.dataframes_count)
                .iter()
                .map(|frame| read_dataframe(frame))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| err.to_string())?;
            let mut updated = state.network(network)?;
            updated.create(element_type(element)?, &frames)?;
            state.replace_object(network, FakeObject::Network(updated));
            Ok(())
        })
    }
}

unsafe extern "C" fn create_load_flow_parameters(thread: Thread, exc: Exc) -> *mut LoadFlowParametersRaw {
    unsafe {
        guarded(thread, exc, |state| {
            let raw = engine_load_flow_parameters()
                .to_raw()
                .map_err(|err| err.to_string())?;
            let raw = Box::into_raw(Box::new(raw));
            state.register(raw.addr(), Alloc::LoadFlowParameters);
            Ok(raw)
        })
    }
}

unsafe extern "C" fn free_load_flow_parameters(
    thread: Thread,
    parameters: *mut LoadFlowParametersRaw,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(parameters.addr(), Alloc::LoadFlowParameters)?;
            bump(&state.counters.free_load_flow_parameters);
            let mut raw = Box::from_raw(parameters);
            LoadFlowParameters::free_raw(&mut raw);
            Ok(())
        })
    }
}

unsafe extern "C" fn run_load_flow(
    thread: Thread,
    network: ObjectHandle,
    dc: c_uchar,
    parameters: *mut LoadFlowParametersRaw,
    provider: *const c_char,
    exc: Exc,
) -> *mut ArrayDescriptor {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let network = state.network(network)?;
            let parameters = LoadFlowParameters::from_raw(&*parameters).map_err(|err| err.to_string())?;
            *state.last_load_flow_parameters.lock() = Some(parameters);
            let provider = provider_name(provider);
            let mode = if dc != 0 { "DC" } else { "AC" };
            state.emit_log(
                20,
                "loadflow",
                &format!("Running {mode} load flow on {} with {provider}", network.name),
            );
            let array = memory::component_results(vec![LoadFlowComponentResultRaw {
                connected_component_num: 0,
                synchronous_component_num: 0,
                status: 0,
                iteration_count: if dc != 0 { 1 } else { 3 },
                slack_bus_id: native_string("VLHV1_0"),
                slack_bus_active_power_mismatch: -0.006,
            }]);
            state.register(array.addr(), Alloc::ComponentResults);
            Ok(array)
        })
    }
}

unsafe fn provider_name(provider: *const c_char) -> String {
    let provider = unsafe { read_c_str(provider) };
    if provider.is_empty() {
        DEFAULT_PROVIDER.to_string()
    } else {
        provider
    }
}

unsafe extern "C" fn create_security_analysis_parameters(
    thread: Thread,
    exc: Exc,
) -> *mut SecurityAnalysisParametersRaw {
    unsafe {
        guarded(thread, exc, |state| {
            let raw = engine_security_analysis_parameters()
                .to_raw()
                .map_err(|err| err.to_string())?;
            let raw = Box::into_raw(Box::new(raw));
            state.register(raw.addr(), Alloc::SecurityAnalysisParameters);
            Ok(raw)
        })
    }
}

unsafe extern "C" fn free_security_analysis_parameters(
    thread: Thread,
    parameters: *mut SecurityAnalysisParametersRaw,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            state.release(parameters.addr(), Alloc::SecurityAnalysisParameters)?;
            bump(&state.counters.free_security_analysis_parameters);
            let mut raw = Box::from_raw(parameters);
            SecurityAnalysisParameters::free_raw(&mut raw);
            Ok(())
        })
    }
}

unsafe extern "C" fn create_security_analysis(thread: Thread, exc: Exc) -> ObjectHandle {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            Ok(state.insert_object(FakeObject::SecurityAnalysis(Vec::new())))
        })
    }
}

unsafe extern "C" fn add_contingency(
    thread: Thread,
    analysis: ObjectHandle,
    id: *const c_char,
    elements: *mut *mut c_char,
    elements_count: c_int,
    exc: Exc,
) {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let FakeObject::SecurityAnalysis(mut contingencies) = state.object(analysis)? else {
                return Err("Expected a security analysis".to_string());
            };
            let id = read_c_str(id);
            let elements = read_string_array(elements, elements_count);
            if elements.is_empty() {
                return Err(format!("Contingency '{id}' has no elements"));
            }
            contingencies.push((id, elements));
            state.replace_object(analysis, FakeObject::SecurityAnalysis(contingencies));
            Ok(())
        })
    }
}

unsafe extern "C" fn run_security_analysis(
    thread: Thread,
    analysis: ObjectHandle,
    network: ObjectHandle,
    parameters: *mut SecurityAnalysisParametersRaw,
    provider: *const c_char,
    dc: c_uchar,
    exc: Exc,
) -> ObjectHandle {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let FakeObject::SecurityAnalysis(contingencies) = state.object(analysis)? else {
                return Err("Expected a security analysis".to_string());
            };
            let network = state.network(network)?;
            let parameters =
                SecurityAnalysisParameters::from_raw(&*parameters).map_err(|err| err.to_string())?;
            let limit_factor = 1.0 + parameters.flow_proportional_threshold;
            *state.last_security_parameters.lock() = Some(parameters);
            let mode = if dc != 0 { "DC" } else { "AC" };
            state.emit_log(
                20,
                "security",
                &format!(
                    "Running {mode} security analysis of {} contingencies on {} with {}",
                    contingencies.len(),
                    network.name,
                    provider_name(provider)
                ),
            );
            let result = limit_violations(&contingencies, limit_factor);
            Ok(state.insert_object(FakeObject::SecurityResult(result)))
        })
    }
}

/// One current violation per contingency on its first tripped element.
fn limit_violations(contingencies: &[(String, Vec<String>)], limit_factor: f64) -> Vec<Series> {
    let limit = 500.0;
    let contingency_ids = contingencies.iter().map(|(id, _)| id.clone()).collect();
    let subjects = contingencies
        .iter()
        .map(|(_, elements)| elements.first().cloned().unwrap_or_default())
        .collect();
    let values = (0..contingencies.len())
        .map(|i| limit * limit_factor + i as f64)
        .collect();
    vec![
        Series::index("contingency_id", SeriesValues::Strings(contingency_ids)),
        Series::index("subject_id", SeriesValues::Strings(subjects)),
        Series::new(
            "limit_type",
            SeriesValues::Strings(vec!["CURRENT".to_string(); contingencies.len()]),
        ),
        Series::new("limit", SeriesValues::Doubles(vec![limit; contingencies.len()])),
        Series::new("value", SeriesValues::Doubles(values)),
        Series::new("side", SeriesValues::Ints(vec![1; contingencies.len()])),
    ]
}

unsafe extern "C" fn get_limit_violations(
    thread: Thread,
    result: ObjectHandle,
    exc: Exc,
) -> *mut ArrayDescriptor {
    unsafe {
        guarded(thread, exc, |state| {
            state.take_failure()?;
            let FakeObject::SecurityResult(violations) = state.object(result)? else {
                return Err("Expected a security analysis result".to_string());
            };
            let array = memory::series_array(&violations);
            state.register(array.addr(), Alloc::SeriesArray);
            Ok(array)
        })
    }
}
