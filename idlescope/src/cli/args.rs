//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigInput;
use crate::domain::CpuId;
use crate::provider::ProviderKind;

#[derive(Parser, Debug)]
#[command(
    name = "idlescope",
    about = "Measure idle-state wakeup latency, energy and residency across cores",
    after_help = "\
EXAMPLES:
    sudo idlescope                                  10 rounds of 100ms, MWAIT on every core
    sudo idlescope --idle-cores 2 --count 50        Two sleeping cores, the rest poll
    sudo idlescope --mechanism IOPORT --io-port 0x414
    idlescope --provider sim --no-pin --export r.json   Dry run without root"
)]
pub struct Args {
    /// Duration of each measurement in milliseconds
    #[arg(long, default_value = "100", value_name = "MS")]
    pub duration_ms: u64,

    /// Number of measurements (clamped to 1000)
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Entry mechanism: MWAIT (HLT/WFI), IOPORT or POLL
    #[arg(short, long, default_value = "MWAIT")]
    pub mechanism: String,

    /// Number of cores using the entry mechanism; the others poll (-1 = all)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    pub idle_cores: i64,

    /// How sleeping cores are chosen: core (spread over siblings) or cpu_nr
    #[arg(long, default_value = "core")]
    pub cpu_selection: String,

    /// I/O port read by the IOPORT mechanism (hex with 0x prefix, or decimal)
    #[arg(long, value_name = "PORT")]
    pub io_port: Option<String>,

    /// Deepest cpuidle state the kernel may enter (e.g. C6)
    #[arg(long, value_name = "NAME")]
    pub idle_state: Option<String>,

    /// Deactivate package C-states for the duration of the run
    #[arg(long)]
    pub deactivate_pcstates: bool,

    /// Redos of an invalid round before it is accepted anyway
    #[arg(long, default_value = "10")]
    pub max_retries: u32,

    /// Wakeups of a sleeping follower that invalidate a round
    #[arg(long, default_value = "10")]
    pub spurious_threshold: u64,

    /// Only use the first N online CPUs
    #[arg(long, value_name = "N")]
    pub cores: Option<usize>,

    /// Counter provider: auto (this machine's hardware) or sim
    #[arg(long, default_value = "auto")]
    pub provider: ProviderKind,

    /// Do not pin measurement threads to their CPUs
    #[arg(long)]
    pub no_pin: bool,

    /// Export results as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Export results as an attribute tree below DIR
    #[arg(long, value_name = "DIR")]
    pub export_dir: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Raw configuration for the given participating CPUs
    pub fn config_input(&self, cpus: Vec<CpuId>) -> ConfigInput {
        ConfigInput {
            duration: Duration::from_millis(self.duration_ms),
            measurement_count: self.count,
            mechanism: self.mechanism.clone(),
            idle_cores: self.idle_cores,
            cpu_selection: self.cpu_selection.clone(),
            io_port: self.io_port.clone(),
            idle_state: self.idle_state.clone(),
            deactivate_package_cstates: self.deactivate_pcstates,
            max_retries: self.max_retries,
            spurious_wake_threshold: self.spurious_threshold,
            pin_threads: !self.no_pin,
            cpus,
        }
    }
}
