use std::ffi::{c_char, c_int, c_uchar, c_void};

use super::types::*;
use crate::error::{BridgeError, Result};

/// Attached thread handle passed as the first argument of every call.
pub type Thread = *mut IsolateThread;
/// Exception slot passed as the last argument of every call.
pub type Exc = *mut ExceptionSlot;

/// Prefix of every exported symbol of the native engine.
pub const SYMBOL_PREFIX: &str = "grid_";

macro_rules! native_api {
    ($(
        $(#[$meta:meta])*
        $name:ident: fn($($arg:ty),* $(,)?) $(-> $ret:ty)?;
    )*) => {
        /// Table of native entry points.
        ///
        /// Every domain entry point has the shape
        /// `fn(Thread, args.., Exc) -> R`; only the isolate lifecycle
        /// functions differ. Build one by hand (tests inject fakes this way)
        /// or resolve it from a shared library with
        /// [`NativeLibrary::open`](crate::library::NativeLibrary::open).
        #[derive(Clone, Copy)]
        pub struct NativeApi {
            $(
                $(#[$meta])*
                pub $name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,
            )*
        }

        impl NativeApi {
            /// Exported symbol names, in table order.
            pub const SYMBOLS: &'static [&'static str] = &[
                $(concat!("grid_", stringify!($name)),)*
            ];

            /// Resolve every entry of the table from `library`.
            ///
            /// # Safety
            ///
            /// The library must export each symbol with exactly the declared
            /// signature.
            pub(crate) unsafe fn resolve(
                library: &libloading::Library,
                path: &str,
            ) -> Result<Self> {
                Ok(Self {
                    $(
                        $name: {
                            let symbol = concat!("grid_", stringify!($name));
                            let resolved = unsafe {
                                library.get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                    concat!("grid_", stringify!($name), "\0").as_bytes(),
                                )
                            }
                            .map_err(|source| BridgeError::MissingSymbol {
                                symbol,
                                path: path.to_string(),
                                source,
                            })?;
                            *resolved
                        },
                    )*
                })
            }
        }
    };
}

native_api! {
    // Isolate lifecycle. Return codes are 0 on success.
    create_isolate: fn(*mut IsolateParams, *mut *mut Isolate, *mut Thread) -> c_int;
    /// Returns null when the calling OS thread is not attached to the isolate.
    get_current_thread: fn(*mut Isolate) -> Thread;
    attach_thread: fn(*mut Isolate, *mut Thread) -> c_int;
    detach_thread: fn(Thread) -> c_int;
    tear_down_isolate: fn(Thread) -> c_int;

    // Native allocator.
    free_string: fn(Thread, *mut c_char, Exc);
    free_array: fn(Thread, *mut ArrayDescriptor, Exc);
    free_string_array: fn(Thread, *mut ArrayDescriptor, Exc);
    free_series_array: fn(Thread, *mut ArrayDescriptor, Exc);
    destroy_object_handle: fn(Thread, ObjectHandle, Exc);

    // Runtime services.
    set_logger: fn(Thread, LogCallback, *mut c_void, Exc);
    set_log_level: fn(Thread, c_int, Exc);
    close: fn(Thread, Exc);

    // Network.
    create_network: fn(Thread, *const c_char, Exc) -> ObjectHandle;
    get_sub_network: fn(Thread, ObjectHandle, *const c_char, Exc) -> ObjectHandle;
    get_network_elements_ids: fn(Thread, ObjectHandle, c_int, Exc) -> *mut ArrayDescriptor;
    create_network_elements_series_array: fn(Thread, ObjectHandle, c_int, Exc) -> *mut ArrayDescriptor;
    update_network_elements_with_series: fn(Thread, ObjectHandle, *mut DataframeRaw, c_int, Exc);
    create_element: fn(Thread, ObjectHandle, *mut DataframeArrayRaw, c_int, Exc);

    // Load flow.
    create_load_flow_parameters: fn(Thread, Exc) -> *mut LoadFlowParametersRaw;
    free_load_flow_parameters: fn(Thread, *mut LoadFlowParametersRaw, Exc);
    run_load_flow: fn(Thread, ObjectHandle, c_uchar, *mut LoadFlowParametersRaw, *const c_char, Exc) -> *mut ArrayDescriptor;

    // Security analysis.
    create_security_analysis_parameters: fn(Thread, Exc) -> *mut SecurityAnalysisParametersRaw;
    free_security_analysis_parameters: fn(Thread, *mut SecurityAnalysisParametersRaw, Exc);
    create_security_analysis: fn(Thread, Exc) -> ObjectHandle;
    add_contingency: fn(Thread, ObjectHandle, *const c_char, *mut *mut c_char, c_int, Exc);
    run_security_analysis: fn(Thread, ObjectHandle, ObjectHandle, *mut SecurityAnalysisParametersRaw, *const c_char, c_uchar, Exc) -> ObjectHandle;
    get_limit_violations: fn(Thread, ObjectHandle, Exc) -> *mut ArrayDescriptor;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_carry_prefix_and_follow_table_order() {
        assert!(NativeApi::SYMBOLS.iter().all(|s| s.starts_with(SYMBOL_PREFIX)));
        assert_eq!(NativeApi::SYMBOLS[0], "grid_create_isolate");
        assert!(NativeApi::SYMBOLS.contains(&"grid_destroy_object_handle"));
    }
}
