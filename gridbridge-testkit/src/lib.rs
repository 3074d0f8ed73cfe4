//! In-process fake of the native grid engine.
//!
//! [`FakeEngine`] hands out a [`NativeApi`](gridbridge::NativeApi) whose
//! entry points behave like the real engine's C ABI: isolates and thread
//! attachment, an exception slot on every call, natively allocated strings,
//! arrays, series and parameter structs, and opaque object handles. Each
//! entry point is counted, and every native buffer is tracked until it is
//! freed through the matching entry point, so tests can assert exact
//! ownership behaviour of the bridge.
//!
//! ```no_run
//! use gridbridge::{ElementType, Network};
//! use gridbridge_testkit::{EUROSTAG_FACTORY, FakeEngine};
//!
//! let engine = FakeEngine::new();
//! let runtime = engine.runtime();
//! let network = Network::create(&runtime, EUROSTAG_FACTORY).unwrap();
//! assert_eq!(network.element_ids(ElementType::Load).unwrap(), vec!["LOAD"]);
//! drop(network);
//! assert_eq!(engine.counts().destroy, 1);
//! ```

mod engine;
mod entry;
mod memory;
mod network;

pub use engine::{
    CallCounts, ENGINE_OPTION, FAIL_ATTACH_OPTION, FAIL_CREATE_OPTION, FakeEngine,
    REJECT_LOG_LEVEL_OPTION,
};
pub use entry::{DEFAULT_PROVIDER, engine_load_flow_parameters, engine_security_analysis_parameters};
pub use memory::Alloc;
pub use network::{EMPTY_FACTORY, EUROSTAG_FACTORY};

/// Install a `tracing` subscriber honouring `RUST_LOG` that writes through
/// the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gridbridge=debug")),
        )
        .with_test_writer()
        .try_init();
}
