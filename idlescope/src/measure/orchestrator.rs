//! Measurement orchestrator
//!
//! Runs every round as one scoped thread per participating core. Each thread
//! pins itself, masks signals and walks through the rendezvous phases:
//!
//! 1. all cores arrive
//! 2. the leader reads the package counters, publishes the start timestamp,
//!    reads its own counters and arms the deadline
//! 3. followers read their counters and arm any local wake source
//! 4. everyone sleeps (or polls) until the deadline passes or the leader
//!    broadcasts the stop
//!
//! The scope join is the full rendezvous after the timed window; validity is
//! evaluated on the joined results and the round is redone until it is
//! valid or the retry budget is spent.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use idlescope_common::{GlobalResult, PerCoreResult, RoundRecord};
use log::{debug, info, warn};

use super::counters::{core_residency_delta, counter_delta, package_residency_delta, CounterDelta};
use super::state::{CoreRoundState, LeaderRecord, SharedRoundState};
use super::validity::{evaluate_round, CoreObservation, RoundObservation, Thresholds, Validity};
use crate::config::MeasurementConfig;
use crate::domain::{CoreId, CpuId, MeasureError, Nanos, ProviderError, Ticks};
use crate::platform::pin_current_thread;
use crate::provider::{CounterProvider, DeadlineToken, SleepContext, Wake};
use crate::results::{ResultSeries, RoundSink};
use crate::sync::Phase;

/// What one core thread hands back through the join
struct CoreOutcome {
    state: CoreRoundState,
    leader: Option<LeaderRecord>,
    pin_error: Option<io::Error>,
}

/// One executed attempt, before the validity decision
struct Attempt {
    record: RoundRecord,
    observation: RoundObservation,
}

pub struct Orchestrator<P: CounterProvider + ?Sized = dyn CounterProvider> {
    cfg: MeasurementConfig,
    provider: Box<P>,
    shared: SharedRoundState,
}

impl<P: CounterProvider + ?Sized> Orchestrator<P> {
    pub fn new(cfg: MeasurementConfig, provider: Box<P>) -> Self {
        let parties = u32::try_from(cfg.core_count()).unwrap_or(u32::MAX);
        Self { shared: SharedRoundState::new(parties), cfg, provider }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.cfg
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Provider setup; must precede [`Orchestrator::run_round`]
    pub fn prepare(&mut self) -> Result<(), MeasureError> {
        info!(
            "Preparing {} provider for {} cores ({} per round, {})",
            self.provider.name(),
            self.cfg.core_count(),
            Nanos::from(self.cfg.target_duration()),
            self.cfg.requested_mechanism()
        );
        self.provider.prepare(&self.cfg)?;
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.provider.cleanup();
    }

    /// Prepare, run every configured round, clean up
    ///
    /// The provider is cleaned up even when `prepare` fails halfway.
    /// `cancel` is checked between rounds; a round in progress always
    /// completes and a cancelled run returns the rounds committed so far
    /// (see [`ResultSeries::is_complete`]).
    pub fn run_all(
        &mut self,
        sink: &mut dyn RoundSink,
        cancel: &AtomicBool,
    ) -> Result<ResultSeries, MeasureError> {
        if let Err(e) = self.prepare() {
            self.cleanup();
            return Err(e);
        }
        let result = self.run_rounds(sink, cancel);
        self.cleanup();
        result
    }

    fn run_rounds(
        &self,
        sink: &mut dyn RoundSink,
        cancel: &AtomicBool,
    ) -> Result<ResultSeries, MeasureError> {
        let requested = self.cfg.measurement_count();
        let mut series = ResultSeries::with_capacity(requested);

        for index in 0..requested {
            if cancel.load(Ordering::Relaxed) {
                warn!("Measurement cancelled after {index} of {requested} rounds");
                break;
            }
            let record = self.run_round(index)?;
            series.commit(index, record)?;
            if let Some(record) = series.get(index) {
                sink.on_round_committed(record);
            }
        }

        Ok(series)
    }

    /// Run round `index` until it is valid or the retry budget is spent
    pub fn run_round(&self, index: usize) -> Result<RoundRecord, MeasureError> {
        let thresholds = Thresholds { spurious_wakes: self.cfg.spurious_wake_threshold() };
        let max_retries = self.cfg.max_retries();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let Attempt { mut record, observation } = self.run_attempt()?;
            let validity = evaluate_round(&observation, &thresholds);

            record.index = index;
            record.attempts = attempts;

            if validity.is_valid() {
                debug!("Round {index} accepted after {attempts} attempt(s)");
                record.valid = true;
                return Ok(record);
            }

            let redos = attempts - 1;
            if redos >= max_retries {
                warn!(
                    "Round {index}: retry budget of {max_retries} exhausted, accepting invalid result ({})",
                    describe(&validity)
                );
                record.valid = false;
                record.violations = validity.describe();
                return Ok(record);
            }

            warn!("Round {index}: redoing measurement ({})", describe(&validity));
        }
    }

    fn run_attempt(&self) -> Result<Attempt, MeasureError> {
        self.shared.reset();
        self.provider.begin_round();

        let outcomes: Vec<Result<CoreOutcome, MeasureError>> = thread::scope(|s| {
            let handles: Vec<_> = self
                .cfg
                .cores()
                .map(|core| {
                    let cpu = self.cfg.cpu(core);
                    (core, s.spawn(move || self.core_body(core, cpu)))
                })
                .collect();

            handles
                .into_iter()
                .map(|(core, handle)| handle.join().map_err(|_| MeasureError::CorePanicked(core)))
                .collect()
        });

        let mut states = Vec::with_capacity(outcomes.len());
        let mut leader = LeaderRecord::default();
        for outcome in outcomes {
            let outcome = outcome?;
            if let Some(source) = outcome.pin_error {
                let core = outcome.state.core;
                return Err(MeasureError::PinFailed { core, cpu: self.cfg.cpu(core), source });
            }
            if let Some(record) = outcome.leader {
                leader = record;
            }
            states.push(outcome.state);
        }

        Ok(self.evaluate(&leader, &states))
    }

    /// Round body of one core. Never returns early: every core must pass
    /// every barrier phase or the others spin forever.
    fn core_body(&self, core: CoreId, cpu: CpuId) -> CoreOutcome {
        let pin_error = if self.cfg.pin_threads() { pin_current_thread(cpu).err() } else { None };

        let p = &*self.provider;
        let shared = &self.shared;
        let duration = self.cfg.target_duration();
        let mechanism = self.cfg.mechanism(core);
        let mut state = CoreRoundState::armed(core);
        let mut leader = None;

        let irq = fallible(
            core,
            "masking interrupts",
            &mut state.hardware_faults,
            p.mask_interrupts(core).map(Some),
        );

        shared.barrier.arrive();

        if core.is_leader() {
            let faults = &mut state.hardware_faults;
            let global_start =
                fallible(core, "reading global start counters", faults, p.read_global_start_counters());
            shared.publish_start(p.now());
            state.start =
                fallible(core, "reading local start counters", faults, p.read_local_start_counters(core));

            let deadline = fallible(
                core,
                "arming the leader deadline",
                faults,
                p.arm_leader_deadline(core, duration).map(Some),
            )
            .unwrap_or_else(|| {
                DeadlineToken(Ticks(p.now().0.saturating_add(p.ns_to_ticks(duration.into()).0)))
            });
            shared.publish_deadline(deadline);
            leader = Some(LeaderRecord { global_start, ..LeaderRecord::default() });

            shared.barrier.advance();
        } else {
            shared.barrier.wait_for(Phase::LeaderReady);
            let faults = &mut state.hardware_faults;
            state.start =
                fallible(core, "reading local start counters", faults, p.read_local_start_counters(core));
            state.local_deadline =
                fallible(core, "arming the follower wakeup", faults, p.arm_follower_wakeup(core, duration));
            shared.barrier.advance();
        }

        shared.barrier.wait_for(Phase::Release);

        if mechanism.is_poll() {
            let end = shared.deadline();
            let mut now = p.now();
            while !end.expired(now) {
                state.wakeups += 1;
                now = p.now();
            }
            state.wakeup = now;
        } else {
            let ctx = SleepContext {
                core,
                mechanism,
                deadline: if core.is_leader() { Some(shared.deadline()) } else { state.local_deadline },
                stop: &shared.stop,
            };
            loop {
                let wake = p.sleep_once(&ctx);
                state.wakeup = p.now();
                state.wakeups += 1;
                if wake == Wake::Spurious {
                    state.spurious_wakeups += 1;
                } else {
                    break;
                }
            }
        }

        if let Some(record) = leader.as_mut() {
            shared.publish_trigger(p.now());
            p.signal_other_cores(&shared.stop);
            record.global_final = fallible(
                core,
                "reading global final counters",
                &mut state.hardware_faults,
                p.read_global_final_counters(),
            );
            shared.publish_end(p.now());
        }

        if state.wakeup < shared.deadline().0 {
            warn!("{core} was unexpectedly interrupted during measurement");
            state.left_early = true;
            shared.mark_corrupted();
        }
        if !core.is_leader()
            && !mechanism.exempt_from_wake_check()
            && state.wakeups >= self.cfg.spurious_wake_threshold()
        {
            shared.mark_corrupted();
        }

        state.final_counters = fallible(
            core,
            "reading local final counters",
            &mut state.hardware_faults,
            p.read_local_final_counters(core),
        );
        state.trigger = false;

        if let Some(irq) = irq {
            if let Err(e) = p.unmask_interrupts(core, irq) {
                warn!("{core}: restoring interrupts failed: {e}");
                state.hardware_faults += 1;
            }
        }

        CoreOutcome { state, leader, pin_error }
    }

    /// Turn the joined per-core states into a record and the observation
    /// the validity checks run on
    fn evaluate(&self, leader: &LeaderRecord, states: &[CoreRoundState]) -> Attempt {
        let p = &*self.provider;
        let mask = p.counter_mask();

        let start = self.shared.start();
        let end = self.shared.end();
        let deadline = self.shared.deadline();
        let trigger = self.shared.trigger();
        let total_ticks = end.saturating_since(start);
        let measured = p.ticks_to_ns(total_ticks);

        let package_energy = energy_delta(leader.global_start.energy, leader.global_final.energy, mask);
        if package_energy.is_some_and(|d| d.wrapped) {
            info!("Overflow in package energy counter");
        }

        let global = GlobalResult {
            start_ticks: start.0,
            end_ticks: end.0,
            total_ticks: total_ticks.0,
            duration_ns: measured.0,
            energy_uj: package_energy.map(|d| p.energy_to_uj(d.value)),
            energy_wrapped: package_energy.is_some_and(|d| d.wrapped),
            residency: package_residency_delta(
                leader.global_start.residency,
                leader.global_final.residency,
            ),
        };

        let mut cores = Vec::with_capacity(states.len());
        let mut observed = Vec::with_capacity(states.len());
        for state in states {
            let mechanism = self.cfg.mechanism(state.core);

            let reference = if state.core.is_leader() || mechanism.is_poll() {
                deadline.0
            } else {
                state.local_deadline.map_or(trigger, |d| d.0.min(trigger))
            };
            let latency = p.ticks_to_ns(state.wakeup.saturating_since(reference));

            let energy = energy_delta(state.start.energy, state.final_counters.energy, mask);
            if energy.is_some_and(|d| d.wrapped) {
                info!("Overflow in {} energy counter", state.core);
            }

            cores.push(PerCoreResult {
                core: state.core.0,
                cpu: self.cfg.cpu(state.core).0,
                mechanism: mechanism.as_str().to_string(),
                wakeups: state.wakeups,
                spurious_wakeups: state.spurious_wakeups,
                wakeup_latency_ns: latency.0,
                unhalted: state
                    .start
                    .unhalted
                    .zip(state.final_counters.unhalted)
                    .map(|(s, f)| f.wrapping_sub(s)),
                residency: core_residency_delta(state.start.residency, state.final_counters.residency),
                energy_uj: energy.map(|d| p.energy_to_uj(d.value)),
                hardware_faults: state.hardware_faults,
            });
            observed.push(CoreObservation {
                core: state.core,
                mechanism,
                wakeups: state.wakeups,
                left_early: state.left_early,
                energy,
            });
        }

        Attempt {
            record: RoundRecord { global, cores, ..RoundRecord::default() },
            observation: RoundObservation {
                target: self.cfg.target_duration().into(),
                measured,
                package_energy,
                cores: observed,
                corrupted: self.shared.is_corrupted(),
            },
        }
    }
}

/// Hardware access failures are logged and counted, and the default value
/// is used so every core keeps walking through the round
fn fallible<T: Default>(
    core: CoreId,
    what: &str,
    faults: &mut u32,
    result: Result<T, ProviderError>,
) -> T {
    result.unwrap_or_else(|e| {
        warn!("{core}: {what} failed: {e}");
        *faults += 1;
        T::default()
    })
}

fn energy_delta(start: Option<u64>, final_value: Option<u64>, mask: u64) -> Option<CounterDelta> {
    Some(counter_delta(start?, final_value?, mask))
}

fn describe(validity: &Validity) -> String {
    validity.describe().join("; ")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ConfigInput;
    use crate::domain::{ConfigError, EntryMechanism};
    use crate::provider::sim::{SimFaults, SimulatedProvider, SpuriousFault};
    use crate::provider::{GlobalCounters, LocalCounters};
    use crate::results::NullSink;

    fn config(cores: u32, mechanism: &str) -> MeasurementConfig {
        MeasurementConfig::build(ConfigInput {
            duration: Duration::from_millis(5),
            measurement_count: 2,
            mechanism: mechanism.to_string(),
            max_retries: 3,
            pin_threads: false,
            cpus: (0..cores).map(CpuId).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    fn orchestrator(cores: u32, mechanism: &str, faults: SimFaults) -> Orchestrator<SimulatedProvider> {
        let mut orchestrator = Orchestrator::new(
            config(cores, mechanism),
            Box::new(SimulatedProvider::with_faults(faults)),
        );
        orchestrator.prepare().unwrap();
        orchestrator
    }

    #[test]
    fn test_clean_round_is_accepted_first_time() {
        let o = orchestrator(4, "MWAIT", SimFaults::default());
        let record = o.run_round(0).unwrap();

        assert!(record.valid);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.cores.len(), 4);
        assert!(record.global.duration_ns >= 5_000_000);
        assert!(record.global.energy_uj.is_some_and(|uj| uj > 0));
        for core in &record.cores[1..] {
            assert!(core.wakeups >= 1 && core.wakeups < 10);
            assert_eq!(core.mechanism, "HALTWAIT");
        }
    }

    #[test]
    fn test_single_core_round() {
        let o = orchestrator(1, "POLL", SimFaults::default());
        let record = o.run_round(0).unwrap();
        assert!(record.valid);
        assert!(record.cores[0].wakeups > 0);
    }

    #[test]
    fn test_spurious_wakes_force_one_redo() {
        let faults = SimFaults {
            spurious: Some(SpuriousFault { core: CoreId(2), wakes: 20, attempts: 1 }),
            ..Default::default()
        };
        let o = orchestrator(4, "MWAIT", faults);
        let record = o.run_round(0).unwrap();

        assert!(record.valid);
        assert_eq!(record.attempts, 2);
        assert_eq!(o.provider().attempts(), 2);
    }

    #[test]
    fn test_retry_budget_accepts_invalid_round() {
        let faults = SimFaults { early_deadline_attempts: u32::MAX, ..Default::default() };
        let o = orchestrator(2, "MWAIT", faults);
        let record = o.run_round(3).unwrap();

        assert!(!record.valid);
        assert_eq!(record.index, 3);
        assert_eq!(record.attempts, 4);
        assert!(record.violations.iter().any(|v| v.contains("shorter than target")));
    }

    #[test]
    fn test_hardware_faults_are_counted_not_fatal() {
        let faults = SimFaults { failing_local_reads: Some(CoreId(1)), ..Default::default() };
        let o = orchestrator(2, "MWAIT", faults);
        let record = o.run_round(0).unwrap();

        assert_eq!(record.cores[1].hardware_faults, 2);
        assert_eq!(record.cores[1].residency, None);
        assert!(record.cores[0].residency.is_some());
        assert_eq!(record.cores[0].hardware_faults, 0);
    }

    #[test]
    fn test_run_all_fills_series_and_sink() {
        struct Counting(usize);
        impl RoundSink for Counting {
            fn on_round_committed(&mut self, _record: &RoundRecord) {
                self.0 += 1;
            }
        }

        let mut o = Orchestrator::new(config(2, "MWAIT"), Box::new(SimulatedProvider::new()));
        let mut sink = Counting(0);
        let series = o.run_all(&mut sink, &AtomicBool::new(false)).unwrap();

        assert!(series.is_complete());
        assert_eq!(sink.0, 2);
    }

    #[test]
    fn test_cancel_before_first_round() {
        let mut o = Orchestrator::new(config(2, "POLL"), Box::new(SimulatedProvider::new()));
        let series = o.run_all(&mut NullSink, &AtomicBool::new(true)).unwrap();
        assert!(series.is_empty());
        assert!(!series.is_complete());
    }

    #[test]
    fn test_cancel_keeps_committed_rounds() {
        struct CancelAfterFirst<'a>(&'a AtomicBool);
        impl RoundSink for CancelAfterFirst<'_> {
            fn on_round_committed(&mut self, _record: &RoundRecord) {
                self.0.store(true, Ordering::Relaxed);
            }
        }

        let cancel = AtomicBool::new(false);
        let mut o = Orchestrator::new(config(2, "MWAIT"), Box::new(SimulatedProvider::new()));
        let series = o.run_all(&mut CancelAfterFirst(&cancel), &cancel).unwrap();

        assert_eq!(series.len(), 1);
        assert!(series.get(0).is_some());
        assert!(!series.is_complete());
    }

    /// Records one hardware change, then fails the way a bad idle state does
    #[derive(Default)]
    struct FailingPrepare {
        touched: u32,
        cleaned: u32,
    }

    impl CounterProvider for FailingPrepare {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn prepare(&mut self, _cfg: &MeasurementConfig) -> Result<(), ProviderError> {
            self.touched += 1;
            Err(ConfigError::IdleStateNotFound("C1".to_string()).into())
        }

        fn cleanup(&mut self) {
            self.cleaned += 1;
        }

        fn now(&self) -> Ticks {
            Ticks(0)
        }

        fn ticks_to_ns(&self, ticks: Ticks) -> Nanos {
            Nanos(ticks.0)
        }

        fn ns_to_ticks(&self, ns: Nanos) -> Ticks {
            Ticks(ns.0)
        }

        fn read_global_start_counters(&self) -> Result<GlobalCounters, ProviderError> {
            Ok(GlobalCounters::default())
        }

        fn read_global_final_counters(&self) -> Result<GlobalCounters, ProviderError> {
            Ok(GlobalCounters::default())
        }

        fn read_local_start_counters(&self, _core: CoreId) -> Result<LocalCounters, ProviderError> {
            Ok(LocalCounters::default())
        }

        fn read_local_final_counters(&self, _core: CoreId) -> Result<LocalCounters, ProviderError> {
            Ok(LocalCounters::default())
        }

        fn sleep_once(&self, _ctx: &SleepContext<'_>) -> Wake {
            Wake::Signaled
        }
    }

    #[test]
    fn test_failed_prepare_is_cleaned_up() {
        let mut o = Orchestrator::new(config(2, "MWAIT"), Box::new(FailingPrepare::default()));
        let err = o.run_all(&mut NullSink, &AtomicBool::new(false)).unwrap_err();

        assert!(matches!(
            err,
            MeasureError::Provider(ProviderError::Config(ConfigError::IdleStateNotFound(_)))
        ));
        assert_eq!(o.provider().touched, 1);
        assert_eq!(o.provider().cleaned, 1);
    }

    #[test]
    fn test_poll_cores_for_unselected_idle_cores() {
        let cfg = MeasurementConfig::build(ConfigInput {
            duration: Duration::from_millis(5),
            idle_cores: 1,
            cpu_selection: "cpu_nr".to_string(),
            pin_threads: false,
            cpus: (0..3).map(CpuId).collect(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.mechanism(CoreId(2)), EntryMechanism::Poll);

        let mut o = Orchestrator::new(cfg, Box::new(SimulatedProvider::new()));
        o.prepare().unwrap();
        let record = o.run_round(0).unwrap();
        assert_eq!(record.cores[0].mechanism, "HALTWAIT");
        assert_eq!(record.cores[2].mechanism, "POLL");
        assert!(record.valid);
    }
}
