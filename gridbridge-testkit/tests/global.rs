//! Process-wide runtime registration.
//!
//! Installing is one-shot per process, so this binary holds a single test.

use gridbridge::{BridgeError, ElementType, Network, Runtime};
use gridbridge_testkit::{EUROSTAG_FACTORY, FakeEngine, init_tracing};

#[test]
fn runtime_can_be_installed_once() {
    init_tracing();
    let engine = FakeEngine::new();
    assert!(matches!(Runtime::global(), Err(BridgeError::NotInstalled)));

    let installed = Runtime::install(engine.runtime()).unwrap();
    assert!(installed.same_runtime(Runtime::global().unwrap()));

    let other = engine.runtime();
    assert!(!other.same_runtime(installed));
    assert!(matches!(Runtime::install(other), Err(BridgeError::AlreadyInstalled)));

    let network = Network::create(Runtime::global().unwrap(), EUROSTAG_FACTORY).unwrap();
    assert_eq!(network.element_ids(ElementType::Load).unwrap(), vec!["LOAD"]);
    drop(network);
    assert_eq!(engine.counts().destroy, 1);
}
