//! Error taxonomy shared by every bridge operation.

use std::ffi::c_int;

/// Errors surfaced to the host binding layer.
///
/// Every fallible operation in the crate returns one of these. The binding
/// layer maps them onto a single host-language exception type.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Isolate creation, thread attach or thread detach returned non-zero.
    #[error("native runtime bootstrap failed: {operation} returned {code}")]
    Bootstrap {
        operation: &'static str,
        code: c_int,
    },
    /// The runtime was shut down; no further native calls are possible.
    #[error("native runtime has been shut down")]
    Closed,
    /// The native side filled the exception slot.
    #[error("{0}")]
    Native(String),
    /// A host callback invoked by the native side failed during the call.
    #[error("host callback failed during native call: {0}")]
    HostCallback(String),
    /// Data handed to the marshaling layer does not satisfy its contract.
    #[error("invalid value for `{field}`: {reason}")]
    Marshal { field: String, reason: String },
    /// A host string cannot be represented as a C string.
    #[error("`{field}` contains an interior NUL byte")]
    InvalidString { field: String },
    /// The shared library could not be opened.
    #[error("failed to load native library `{path}`: {source}")]
    Library {
        path: String,
        #[source]
        source: libloading::Error,
    },
    /// A symbol of the native call table is missing from the library.
    #[error("symbol `{symbol}` not found in `{path}`: {source}")]
    MissingSymbol {
        symbol: &'static str,
        path: String,
        #[source]
        source: libloading::Error,
    },
    /// `Runtime::install` was called twice.
    #[error("a process-wide runtime is already installed")]
    AlreadyInstalled,
    /// `Runtime::global` was called before `Runtime::install`.
    #[error("no process-wide runtime installed")]
    NotInstalled,
}

impl BridgeError {
    pub(crate) fn marshal(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Marshal {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_string(field: impl Into<String>) -> Self {
        Self::InvalidString {
            field: field.into(),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_displays_message_verbatim() {
        let err = BridgeError::Native("Network 'x' not found".to_string());
        assert_eq!(err.to_string(), "Network 'x' not found");
    }

    #[test]
    fn marshal_error_names_field() {
        let err = BridgeError::marshal("p0", "declared double column but got string values");
        assert!(err.to_string().contains("`p0`"));
    }

    #[test]
    fn bootstrap_error_carries_code() {
        let err = BridgeError::Bootstrap {
            operation: "attach_thread",
            code: 3,
        };
        assert_eq!(
            err.to_string(),
            "native runtime bootstrap failed: attach_thread returned 3"
        );
    }
}
