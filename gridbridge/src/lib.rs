//! # gridbridge
//!
//! Bridge between a host binding layer and a native, AOT-compiled power-grid
//! analysis engine exposed through a flat C ABI.
//!
//! The engine is reached through a [`NativeApi`] call table, loaded from a
//! shared library with [`NativeLibrary`] or built by hand. All calls go
//! through one [`Runtime`], which attaches the calling thread, runs the
//! configured [`CallHooks`] and turns the native exception slot into a
//! [`BridgeError`].
//!
//! Ownership follows the direction data travels:
//!
//! - Native objects are held by [`Handle`] and destroyed once, when the last
//!   clone goes away.
//! - Buffers and parameter structs returned by the engine are wrapped in
//!   `Native*` types that call the matching native free function.
//! - Buffers and parameter structs built here are wrapped in `Local*` types
//!   (and [`Dataframe`]) that free with the local allocator only.

/// Declare a C `int` tag enum with lossless conversions in both directions.
macro_rules! native_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        #[repr(i32)]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            pub fn as_raw(self) -> std::ffi::c_int {
                self as std::ffi::c_int
            }
        }

        impl TryFrom<std::ffi::c_int> for $name {
            type Error = std::ffi::c_int;

            fn try_from(value: std::ffi::c_int) -> std::result::Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(other),
                }
            }
        }
    };
}

pub mod array;
pub mod config;
pub mod dataframe;
pub mod error;
pub mod handle;
pub mod library;
pub mod loadflow;
pub mod logging;
pub mod native;
pub mod network;
pub mod params;
pub mod runtime;
pub mod security;

pub use array::{LocalArray, LocalStringArray, NativeArray, NativeStringArray};
pub use config::{OPTIONS_ENV, RuntimeConfig};
pub use dataframe::{Dataframe, DataframeArray, NativeSeriesArray, Series, SeriesType, SeriesValues};
pub use error::{BridgeError, Result};
pub use handle::Handle;
pub use library::NativeLibrary;
pub use loadflow::{ComponentResult, ComponentStatus};
pub use logging::{LogSink, NativeLogLevel, NativeLogRecord, TracingSink};
pub use native::NativeApi;
pub use network::{ElementType, Network};
pub use params::{LoadFlowParameters, LocalParams, NativeParams, SecurityAnalysisParameters};
pub use runtime::{Attachment, CallHooks, Runtime};
pub use security::{SecurityAnalysis, SecurityAnalysisResult};
