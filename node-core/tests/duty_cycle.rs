mod support;

use std::time::Duration;

use node_core::cycle::CycleError;
use node_core::counter::CounterError;
use node_core::telemetry::TelemetryEventKind;

use support::{BrokerScript, MemoryStore, ScriptedSensor, Simulation, bme280_reading};

fn run_cycle(store: &mut MemoryStore, sensor: ScriptedSensor, script: BrokerScript) -> u32 {
    let mut sim = Simulation::new(
        Simulation::default_config().with_barrier_timeout(Duration::from_secs(1)),
        store,
        vec![("bme280", sensor)],
        script,
    );
    sim.run_to_sleep();
    let request = sim.sleep(store);
    assert_eq!(request.next_cycle, request.cycle.wrapping_add(1));
    request.cycle
}

#[test]
fn counter_advances_once_per_wake_regardless_of_outcome() {
    let mut store = MemoryStore::default();

    let first = run_cycle(
        &mut store,
        ScriptedSensor::succeeding_after(0, bme280_reading()),
        BrokerScript::responsive(),
    );
    let second = run_cycle(&mut store, ScriptedSensor::never(), BrokerScript::responsive());
    let third = run_cycle(
        &mut store,
        ScriptedSensor::succeeding_after(0, bme280_reading()),
        BrokerScript::unreachable(),
    );

    assert_eq!((first, second, third), (0, 1, 2));
    assert_eq!(store.0, Some(3));
}

#[test]
fn counter_wraps_instead_of_saturating() {
    let mut store = MemoryStore(Some(u32::MAX));
    let cycle = run_cycle(
        &mut store,
        ScriptedSensor::succeeding_after(0, bme280_reading()),
        BrokerScript::responsive(),
    );

    assert_eq!(cycle, u32::MAX);
    assert_eq!(store.0, Some(0));
}

#[test]
fn counter_is_written_only_by_the_power_down_step() {
    let mut store = MemoryStore(Some(5));
    let mut sim = Simulation::new(
        Simulation::default_config(),
        &mut store,
        vec![(
            "bme280",
            ScriptedSensor::succeeding_after(0, bme280_reading()),
        )],
        BrokerScript::responsive(),
    );

    sim.run_to_sleep();
    assert_eq!(store.0, Some(5));

    sim.sleep(&mut store);
    assert_eq!(store.0, Some(6));
    assert_eq!(
        sim.cycle.enter_sleep(&mut store, sim.now),
        Err(CycleError::Counter(CounterError::AlreadyCommitted))
    );
    assert_eq!(store.0, Some(6));
    assert_eq!(sim.cycle.telemetry().count(TelemetryEventKind::SleepEntered), 1);
}
