use std::ffi::{c_char, c_double, c_int, c_longlong, c_uchar, c_void};
use std::ptr;

/// Opaque native isolate.
#[repr(C)]
pub struct Isolate {
    _opaque: [u8; 0],
}

/// Opaque per-OS-thread attachment to an [`Isolate`].
#[repr(C)]
pub struct IsolateThread {
    _opaque: [u8; 0],
}

/// Opaque reference to an object living inside the native runtime.
pub type ObjectHandle = *mut c_void;

/// Current layout version of [`IsolateParams`].
pub const ISOLATE_PARAMS_VERSION: c_int = 1;

/// Isolate creation parameters: the runtime options as an argument vector.
#[repr(C)]
#[derive(Debug)]
pub struct IsolateParams {
    pub version: c_int,
    pub argc: c_int,
    pub argv: *mut *mut c_char,
}

/// Out-parameter appended to every native call.
///
/// A non-null `message` after the call means the call failed. The message is
/// allocated by the native side and must be released with `free_string`.
#[repr(C)]
#[derive(Debug)]
pub struct ExceptionSlot {
    pub message: *mut c_char,
}

impl Default for ExceptionSlot {
    fn default() -> Self {
        Self {
            message: ptr::null_mut(),
        }
    }
}

impl ExceptionSlot {
    pub fn is_set(&self) -> bool {
        !self.message.is_null()
    }
}

/// Weakly typed contiguous buffer: `length` elements starting at `ptr`.
///
/// The descriptor does not record who allocated it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArrayDescriptor {
    pub ptr: *mut c_void,
    pub length: c_int,
}

impl ArrayDescriptor {
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        usize::try_from(self.length).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len() == 0
    }
}

/// One named, typed column.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeriesRaw {
    pub name: *mut c_char,
    pub index: c_int,
    pub series_type: c_int,
    pub data: ArrayDescriptor,
}

/// Ordered columns of one table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DataframeRaw {
    pub series: *mut SeriesRaw,
    pub series_count: c_int,
}

/// Ordered tables for bulk operations.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DataframeArrayRaw {
    pub dataframes: *mut DataframeRaw,
    pub dataframes_count: c_int,
}

/// Flat load flow parameters. Booleans are `0`/`1`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoadFlowParametersRaw {
    pub voltage_init_mode: c_int,
    pub transformer_voltage_control_on: c_uchar,
    pub use_reactive_limits: c_uchar,
    pub phase_shifter_regulation_on: c_uchar,
    pub twt_split_shunt_admittance: c_uchar,
    pub shunt_compensator_voltage_control_on: c_uchar,
    pub read_slack_bus: c_uchar,
    pub write_slack_bus: c_uchar,
    pub distributed_slack: c_uchar,
    pub balance_type: c_int,
    pub dc_use_transformer_ratio: c_uchar,
    pub countries_to_balance: *mut *mut c_char,
    pub countries_to_balance_count: c_int,
    pub connected_component_mode: c_int,
    pub dc_power_factor: c_double,
    pub provider_parameters_keys: *mut *mut c_char,
    pub provider_parameters_keys_count: c_int,
    pub provider_parameters_values: *mut *mut c_char,
    pub provider_parameters_values_count: c_int,
}

/// Flat security analysis parameters, embedding the load flow parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SecurityAnalysisParametersRaw {
    pub load_flow_parameters: LoadFlowParametersRaw,
    pub flow_proportional_threshold: c_double,
    pub low_voltage_proportional_threshold: c_double,
    pub low_voltage_absolute_threshold: c_double,
    pub high_voltage_proportional_threshold: c_double,
    pub high_voltage_absolute_threshold: c_double,
    pub provider_parameters_keys: *mut *mut c_char,
    pub provider_parameters_keys_count: c_int,
    pub provider_parameters_values: *mut *mut c_char,
    pub provider_parameters_values_count: c_int,
}

/// Per connected component outcome of a load flow run.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoadFlowComponentResultRaw {
    pub connected_component_num: c_int,
    pub synchronous_component_num: c_int,
    pub status: c_int,
    pub iteration_count: c_int,
    pub slack_bus_id: *mut c_char,
    pub slack_bus_active_power_mismatch: c_double,
}

/// Logging callback handed to the native side.
///
/// `user_data` is the pointer registered together with the callback.
pub type LogCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    level: c_int,
    timestamp_ms: c_longlong,
    logger_name: *const c_char,
    message: *const c_char,
);
