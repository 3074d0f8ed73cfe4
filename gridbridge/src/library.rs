//! Loading the native call table from a shared library.

use std::path::Path;

use libloading::Library;

use crate::error::{BridgeError, Result};
use crate::native::NativeApi;

/// An opened native engine library and its resolved call table.
///
/// The function pointers in [`NativeLibrary::api`] stay valid for as long as
/// this value is alive; a [`Runtime`](crate::Runtime) built from it keeps it
/// alive for its own lifetime.
pub struct NativeLibrary {
    api: NativeApi,
    path: String,
    // Declared last so the table is dropped before the library is unloaded.
    _library: Library,
}

impl NativeLibrary {
    /// Open the library at `path` and resolve every [`NativeApi`] symbol.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initialisers, and the exported symbols must
    /// match the declared signatures.
    pub unsafe fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let library = unsafe { Library::new(path) }.map_err(|source| BridgeError::Library {
            path: shown.clone(),
            source,
        })?;
        let api = unsafe { NativeApi::resolve(&library, &shown) }?;
        tracing::debug!(path = %shown, symbols = NativeApi::SYMBOLS.len(), "native library loaded");
        Ok(Self {
            api,
            path: shown,
            _library: library,
        })
    }

    /// Platform file name for a library called `name`.
    pub fn platform_file_name(name: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            format!("{name}.dll")
        }
        #[cfg(target_os = "macos")]
        {
            format!("lib{name}.dylib")
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            format!("lib{name}.so")
        }
    }

    pub fn api(&self) -> &NativeApi {
        &self.api
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_file_name() {
        let name = NativeLibrary::platform_file_name("gridengine");
        #[cfg(target_os = "windows")]
        assert_eq!(name, "gridengine.dll");
        #[cfg(target_os = "macos")]
        assert_eq!(name, "libgridengine.dylib");
        #[cfg(target_os = "linux")]
        assert_eq!(name, "libgridengine.so");
    }

    #[test]
    fn open_missing_library_reports_path() {
        let err = unsafe { NativeLibrary::open("/nonexistent/libgridengine.so") }
            .err()
            .unwrap();
        match err {
            BridgeError::Library { path, .. } => assert_eq!(path, "/nonexistent/libgridengine.so"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
