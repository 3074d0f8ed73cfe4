//! Ownership tests: every native resource is released exactly once, by the
//! entry point matching where it was allocated.
//!
//! Tests cover:
//! - Object handles destroyed once, when the last clone goes away
//! - Null handles never reaching the native side
//! - Sub-networks owning an independent handle
//! - Native arrays released through their matching free entry point
//! - Locally built dataframes and arrays never freed natively
//! - Native parameter structs freed natively, local ones never

use gridbridge::{
    Dataframe, DataframeArray, ElementType, Handle, LoadFlowParameters, Network,
    SecurityAnalysis, SecurityAnalysisParameters, Series, SeriesValues, loadflow,
};
use gridbridge_testkit::{
    EUROSTAG_FACTORY, FakeEngine, engine_load_flow_parameters,
    engine_security_analysis_parameters, init_tracing,
};

fn make_network(engine: &FakeEngine) -> Network {
    Network::create(&engine.runtime(), EUROSTAG_FACTORY).unwrap()
}

fn assert_released(engine: &FakeEngine) {
    assert_eq!(engine.live_allocations(), 0, "native buffers leaked");
    assert_eq!(engine.counts().invalid_free, 0, "invalid native free");
}

#[test]
fn handle_is_destroyed_once_after_last_clone() {
    init_tracing();
    let engine = FakeEngine::new();
    let network = make_network(&engine);
    let mut clones: Vec<Handle> = (0..5).map(|_| network.handle().clone()).collect();
    assert_eq!(network.handle().share_count(), 6);

    drop(network);
    while clones.len() > 1 {
        clones.remove(clones.len() / 2);
        assert_eq!(engine.counts().destroy, 0);
        assert_eq!(engine.live_objects(), 1);
    }
    drop(clones);

    assert_eq!(engine.counts().destroy, 1);
    assert_eq!(engine.live_objects(), 0);
    assert_released(&engine);
}

#[test]
fn null_handle_never_reaches_the_engine() {
    init_tracing();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();

    let handle = Handle::wrap(&runtime, std::ptr::null_mut());
    assert!(handle.is_null());
    let clone = handle.clone();
    drop(handle);
    drop(clone);

    assert_eq!(engine.counts().destroy, 0);
    assert!(engine.options().is_empty(), "no isolate was needed");
}

#[test]
fn sub_network_outlives_its_parent() {
    init_tracing();
    let engine = FakeEngine::new();
    let network = make_network(&engine);
    let sub = network.sub_network("VLHV1").unwrap();
    assert_ne!(sub.handle().as_ptr(), network.handle().as_ptr());
    assert_eq!(sub.handle().share_count(), 1);

    drop(network);
    assert_eq!(engine.counts().destroy, 1);
    assert_eq!(sub.element_ids(ElementType::Generator).unwrap(), vec!["GEN", "GEN2"]);

    drop(sub);
    assert_eq!(engine.counts().destroy, 2);
    assert_eq!(engine.live_objects(), 0);
    assert_released(&engine);
}

#[test]
fn native_arrays_are_freed_by_their_own_entry_point() {
    init_tracing();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();
    let network = Network::create(&runtime, EUROSTAG_FACTORY).unwrap();

    network.element_ids(ElementType::Line).unwrap();
    let counts = engine.counts();
    assert_eq!(
        (counts.free_string_array, counts.free_series_array, counts.free_array),
        (1, 0, 0)
    );

    network.elements(ElementType::Line).unwrap();
    let counts = engine.counts();
    assert_eq!(
        (counts.free_string_array, counts.free_series_array, counts.free_array),
        (1, 1, 0)
    );

    loadflow::run(&runtime, &network, false, &LoadFlowParameters::default(), "").unwrap();
    let counts = engine.counts();
    assert_eq!(
        (counts.free_string_array, counts.free_series_array, counts.free_array),
        (1, 1, 1)
    );
    assert_released(&engine);
}

#[test]
fn local_inputs_are_never_freed_natively() {
    init_tracing();
    let engine = FakeEngine::new();
    let network = make_network(&engine);
    let frame = Dataframe::build(&[
        Series::index("id", SeriesValues::Strings(vec!["GEN2".into()])),
        Series::new("target_p", SeriesValues::Doubles(vec![250.0])),
    ])
    .unwrap();
    network.update_elements(ElementType::Generator, &frame).unwrap();

    let first = Dataframe::build(&[Series::index("id", SeriesValues::Strings(vec!["L1".into()]))])
        .unwrap();
    let second = Dataframe::build(&[Series::index("id", SeriesValues::Strings(vec!["L2".into()]))])
        .unwrap();
    let frames = DataframeArray::new([&first, &second]).unwrap();
    network.create_elements(ElementType::Load, &frames).unwrap();
    drop(frames);

    let analysis = SecurityAnalysis::create(&engine.runtime()).unwrap();
    analysis.add_contingency("N-1 line", &["NHV1_NHV2_1"]).unwrap();

    let counts = engine.counts();
    assert_eq!(counts.free_string, 0);
    assert_eq!(counts.free_array, 0);
    assert_eq!(counts.free_string_array, 0);
    assert_eq!(counts.free_series_array, 0);
    assert_eq!(counts.invalid_free, 0);

    // The caller still owns the frames.
    assert_eq!(first.to_series().unwrap()[0].values, SeriesValues::Strings(vec!["L1".into()]));
    assert_eq!(frame.len(), 2);
    assert_released(&engine);
}

#[test]
fn native_load_flow_defaults_are_copied_and_freed_once() {
    init_tracing();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();

    let parameters = LoadFlowParameters::native_defaults(&runtime).unwrap();
    assert_eq!(parameters, engine_load_flow_parameters());
    assert_eq!(engine.counts().free_load_flow_parameters, 1);
    assert_released(&engine);
}

#[test]
fn native_security_defaults_are_copied_and_freed_once() {
    init_tracing();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();

    let parameters = SecurityAnalysisParameters::native_defaults(&runtime).unwrap();
    assert_eq!(parameters, engine_security_analysis_parameters());
    let counts = engine.counts();
    assert_eq!(counts.free_security_analysis_parameters, 1);
    assert_eq!(counts.free_load_flow_parameters, 0, "embedded struct goes with its parent");
    assert_released(&engine);
}

#[test]
fn local_parameters_reach_the_engine_without_native_free() {
    init_tracing();
    let engine = FakeEngine::new();
    let runtime = engine.runtime();
    let network = Network::create(&runtime, EUROSTAG_FACTORY).unwrap();
    let mut parameters = LoadFlowParameters::native_defaults(&runtime).unwrap();
    parameters.distributed_slack = false;
    parameters.countries_to_balance.push("DE".into());
    parameters
        .provider_parameters
        .insert("plausibleActivePowerLimit".into(), "5000".into());

    loadflow::run(&runtime, &network, false, &parameters, "").unwrap();

    assert_eq!(engine.last_load_flow_parameters(), Some(parameters));
    assert_eq!(
        engine.counts().free_load_flow_parameters,
        1,
        "only the native defaults were freed natively"
    );
    assert_released(&engine);
}
