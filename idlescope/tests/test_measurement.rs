use std::sync::atomic::AtomicBool;
use std::time::Duration;

use idlescope::config::{ConfigInput, MeasurementConfig};
use idlescope::domain::{CoreId, CpuId};
use idlescope::measure::Orchestrator;
use idlescope::provider::sim::{SimFaults, SimulatedProvider, SpuriousFault};
use idlescope::results::NullSink;

fn config(count: usize, max_retries: u32) -> MeasurementConfig {
    MeasurementConfig::build(ConfigInput {
        duration: Duration::from_millis(5),
        measurement_count: count,
        max_retries,
        pin_threads: false,
        cpus: (0..4).map(CpuId).collect(),
        ..Default::default()
    })
    .expect("valid configuration")
}

fn run(count: usize, max_retries: u32, faults: SimFaults) -> (Vec<idlescope_common::RoundRecord>, u32) {
    let mut orchestrator =
        Orchestrator::new(config(count, max_retries), Box::new(SimulatedProvider::with_faults(faults)));
    let series = orchestrator
        .run_all(&mut NullSink, &AtomicBool::new(false))
        .expect("measurement should complete");
    assert!(series.is_complete());
    let attempts = orchestrator.provider().attempts();
    (series.iter().cloned().collect(), attempts)
}

#[test]
fn test_clean_run_needs_no_redo() {
    let (rounds, attempts) = run(3, 10, SimFaults::default());

    assert_eq!(rounds.len(), 3);
    assert_eq!(attempts, 3);
    for (i, round) in rounds.iter().enumerate() {
        assert_eq!(round.index, i);
        assert!(round.valid);
        assert_eq!(round.redos(), 0);
        assert!(round.violations.is_empty());
        assert!(round.global.duration_ns >= 5_000_000);
        assert_eq!(round.cores.len(), 4);
    }
}

#[test]
fn test_disturbed_follower_is_redone_once() {
    let faults = SimFaults {
        spurious: Some(SpuriousFault { core: CoreId(3), wakes: 15, attempts: 1 }),
        ..Default::default()
    };
    let (rounds, attempts) = run(2, 10, faults);

    assert_eq!(rounds[0].attempts, 2);
    assert!(rounds[0].valid);
    assert_eq!(rounds[1].attempts, 1);
    assert_eq!(attempts, 3);
}

#[test]
fn test_early_deadline_exhausts_retry_budget() {
    let faults = SimFaults { early_deadline_attempts: u32::MAX, ..Default::default() };
    let (rounds, attempts) = run(1, 10, faults);

    let round = &rounds[0];
    assert!(!round.valid);
    assert_eq!(round.attempts, 11);
    assert_eq!(attempts, 11);
    assert_eq!(round.global.duration_ns, 0);
    assert!(round.violations.iter().any(|v| v.contains("shorter than target")));
}

#[test]
fn test_frozen_energy_counter_triggers_redo() {
    let faults = SimFaults { frozen_energy_attempts: 2, ..Default::default() };
    let (rounds, _) = run(1, 10, faults);

    assert_eq!(rounds[0].attempts, 3);
    assert!(rounds[0].global.energy_uj.is_some_and(|uj| uj > 0));
}

#[test]
fn test_energy_wrap_is_corrected() {
    // 1000 uJ left before the 32-bit counter wraps, each round consumes at least 5000
    let faults = SimFaults { energy_offset: 0xFFFF_FFFF - 999, ..Default::default() };
    let (rounds, _) = run(2, 10, faults);

    for round in &rounds {
        let global = &round.global;
        assert!(global.energy_wrapped);
        assert!(global.energy_uj.is_some_and(|uj| (5_000..1_000_000).contains(&uj)), "{global:?}");
        assert!(round.valid);
    }
}

#[test]
fn test_latency_is_reported_for_every_core() {
    let (rounds, _) = run(1, 10, SimFaults::default());
    let round = &rounds[0];

    let cpus: Vec<u32> = round.cores.iter().map(|c| c.cpu).collect();
    assert_eq!(cpus, vec![0, 1, 2, 3]);
    for core in &round.cores {
        assert!(core.wakeup_latency_ns < 1_000_000_000, "{core:?}");
    }
}
