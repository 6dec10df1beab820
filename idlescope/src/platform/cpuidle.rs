//! cpuidle state limiting
//!
//! The kernel picks the idle state a halted CPU enters. Disabling every state
//! deeper than the requested one through
//! `/sys/devices/system/cpu/cpuN/cpuidle/stateK/disable` makes a halt-and-wait
//! round land in that state. The original `disable` values are saved and put
//! back by [`IdleStateLimiter::restore`].

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::domain::{ConfigError, CpuId, ProviderError};

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// One cpuidle state of one CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleState {
    pub index: usize,
    pub name: String,
    /// Exit latency in microseconds
    pub latency_us: u64,
    pub disabled: bool,
}

/// Restricts the idle states the kernel may pick on a set of CPUs
#[derive(Debug)]
pub struct IdleStateLimiter {
    root: PathBuf,
    states: Vec<(CpuId, Vec<IdleState>)>,
    /// (cpu, state index, original disable value) for every write made
    saved: Vec<(CpuId, usize, bool)>,
}

impl IdleStateLimiter {
    /// Read the cpuidle states of `cpus` below `root` (normally [`SYSFS_CPU_ROOT`])
    pub fn discover(root: impl Into<PathBuf>, cpus: &[CpuId]) -> Result<Self, ProviderError> {
        let root = root.into();
        let mut states = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            states.push((cpu, read_states(&root, cpu)?));
        }
        Ok(Self { root, states, saved: Vec::new() })
    }

    pub fn states(&self, cpu: CpuId) -> Option<&[IdleState]> {
        self.states.iter().find(|(c, _)| *c == cpu).map(|(_, s)| s.as_slice())
    }

    /// Discover the states of `cpus` and limit them to `name` in one step
    pub fn apply(root: impl Into<PathBuf>, cpus: &[CpuId], name: &str) -> Result<Self, ProviderError> {
        let mut limiter = Self::discover(root, cpus)?;
        let disabled = limiter.limit_to(name)?;
        info!("Limited idle states to {name} ({disabled} deeper states disabled)");
        Ok(limiter)
    }

    /// Index of state `name` on every CPU; fails if any CPU lacks it
    pub fn validate(&self, name: &str) -> Result<Vec<usize>, ConfigError> {
        self.states
            .iter()
            .map(|(_, states)| {
                states
                    .iter()
                    .find(|s| s.name.eq_ignore_ascii_case(name))
                    .map(|s| s.index)
                    .ok_or_else(|| ConfigError::IdleStateNotFound(name.to_string()))
            })
            .collect()
    }

    /// Allow states up to and including `name`, disable all deeper ones
    ///
    /// Nothing is written unless `name` exists on every CPU. A failed write
    /// puts back the values already changed. Returns the number of states
    /// disabled across all CPUs.
    pub fn limit_to(&mut self, name: &str) -> Result<usize, ProviderError> {
        let targets = self.validate(name)?;
        match self.write_limits(&targets) {
            Ok(disabled) => Ok(disabled),
            Err(e) => {
                self.restore();
                Err(e)
            }
        }
    }

    fn write_limits(&mut self, targets: &[usize]) -> Result<usize, ProviderError> {
        let mut disabled = 0;
        for ((cpu, states), &target) in self.states.iter().zip(targets) {
            for state in states {
                let disable = state.index > target;
                if disable == state.disabled {
                    continue;
                }
                write_disable(&self.root, *cpu, state.index, disable)?;
                self.saved.push((*cpu, state.index, state.disabled));
                if disable {
                    disabled += 1;
                }
            }
            debug!("{cpu}: idle states limited to index {target}");
        }
        Ok(disabled)
    }

    /// Put back every `disable` value changed by `limit_to`
    pub fn restore(&mut self) {
        for (cpu, index, original) in self.saved.drain(..).rev() {
            if let Err(e) = write_disable(&self.root, cpu, index, original) {
                warn!("Could not restore cpuidle state{index} on {cpu}: {e}");
            }
        }
    }
}

fn state_dir(root: &Path, cpu: CpuId, index: usize) -> PathBuf {
    root.join(format!("cpu{}", cpu.0)).join("cpuidle").join(format!("state{index}"))
}

fn read_states(root: &Path, cpu: CpuId) -> Result<Vec<IdleState>, ProviderError> {
    let mut states = Vec::new();
    for index in 0.. {
        let dir = state_dir(root, cpu, index);
        if !dir.is_dir() {
            break;
        }
        let name = fs::read_to_string(dir.join("name"))?.trim().to_string();
        let latency_us = fs::read_to_string(dir.join("latency"))?.trim().parse().unwrap_or(0);
        let disabled = fs::read_to_string(dir.join("disable"))?.trim() == "1";
        states.push(IdleState { index, name, latency_us, disabled });
    }

    if states.is_empty() {
        return Err(ProviderError::DeviceMissing(format!(
            "{}/cpu{}/cpuidle",
            root.display(),
            cpu.0
        )));
    }
    Ok(states)
}

fn write_disable(root: &Path, cpu: CpuId, index: usize, disable: bool) -> Result<(), ProviderError> {
    let path = state_dir(root, cpu, index).join("disable");
    fs::write(path, if disable { "1" } else { "0" })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(cpus: &[u32], names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for cpu in cpus {
            for (i, name) in names.iter().enumerate() {
                let state = dir.path().join(format!("cpu{cpu}/cpuidle/state{i}"));
                fs::create_dir_all(&state).unwrap();
                fs::write(state.join("name"), format!("{name}\n")).unwrap();
                fs::write(state.join("latency"), format!("{}\n", i * 10)).unwrap();
                fs::write(state.join("disable"), "0\n").unwrap();
            }
        }
        dir
    }

    fn disable_value(root: &Path, cpu: u32, index: usize) -> String {
        fs::read_to_string(state_dir(root, CpuId(cpu), index).join("disable"))
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn test_discover_reads_states() {
        let dir = fake_sysfs(&[0], &["POLL", "C1", "C6"]);
        let limiter = IdleStateLimiter::discover(dir.path(), &[CpuId(0)]).unwrap();
        let states = limiter.states(CpuId(0)).unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states[2].name, "C6");
        assert_eq!(states[2].latency_us, 20);
    }

    #[test]
    fn test_limit_and_restore() {
        let dir = fake_sysfs(&[0, 1], &["POLL", "C1", "C1E", "C6"]);
        let cpus = [CpuId(0), CpuId(1)];
        let mut limiter = IdleStateLimiter::discover(dir.path(), &cpus).unwrap();

        let disabled = limiter.limit_to("c1").unwrap();
        assert_eq!(disabled, 4);
        assert_eq!(disable_value(dir.path(), 1, 1), "0");
        assert_eq!(disable_value(dir.path(), 1, 2), "1");
        assert_eq!(disable_value(dir.path(), 0, 3), "1");

        limiter.restore();
        assert_eq!(disable_value(dir.path(), 0, 3), "0");
        assert_eq!(disable_value(dir.path(), 1, 2), "0");
    }

    #[test]
    fn test_unknown_state_is_config_error() {
        let dir = fake_sysfs(&[0], &["POLL", "C1"]);
        let mut limiter = IdleStateLimiter::discover(dir.path(), &[CpuId(0)]).unwrap();
        let err = limiter.limit_to("C10").unwrap_err();
        assert!(matches!(err, ProviderError::Config(ConfigError::IdleStateNotFound(_))));
    }

    #[test]
    fn test_state_missing_on_one_cpu_writes_nothing() {
        let dir = fake_sysfs(&[0], &["POLL", "C1", "C6"]);
        let cpu1 = dir.path().join("cpu1/cpuidle");
        for (i, name) in ["POLL", "C6"].iter().enumerate() {
            let state = cpu1.join(format!("state{i}"));
            fs::create_dir_all(&state).unwrap();
            fs::write(state.join("name"), format!("{name}\n")).unwrap();
            fs::write(state.join("latency"), "0\n").unwrap();
            fs::write(state.join("disable"), "0\n").unwrap();
        }

        let mut limiter = IdleStateLimiter::discover(dir.path(), &[CpuId(0), CpuId(1)]).unwrap();
        assert!(limiter.validate("C1").is_err());
        let err = limiter.limit_to("C1").unwrap_err();
        assert!(matches!(err, ProviderError::Config(ConfigError::IdleStateNotFound(_))));
        assert_eq!(disable_value(dir.path(), 0, 2), "0");
    }

    #[test]
    fn test_failed_write_rolls_back_earlier_cpus() {
        let dir = fake_sysfs(&[0, 1], &["POLL", "C1", "C6"]);
        let cpus = [CpuId(0), CpuId(1)];
        let mut limiter = IdleStateLimiter::discover(dir.path(), &cpus).unwrap();

        // A directory in place of cpu1's disable file makes the write fail
        let blocked = state_dir(dir.path(), CpuId(1), 2).join("disable");
        fs::remove_file(&blocked).unwrap();
        fs::create_dir(&blocked).unwrap();

        assert!(limiter.limit_to("C1").is_err());
        assert_eq!(disable_value(dir.path(), 0, 2), "0");
    }

    #[test]
    fn test_apply_limits_every_cpu() {
        let dir = fake_sysfs(&[0, 1], &["POLL", "C1", "C6"]);
        let mut limiter = IdleStateLimiter::apply(dir.path(), &[CpuId(0), CpuId(1)], "C1").unwrap();
        assert_eq!(disable_value(dir.path(), 1, 2), "1");
        limiter.restore();
        assert_eq!(disable_value(dir.path(), 1, 2), "0");
    }

    #[test]
    fn test_missing_cpuidle_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IdleStateLimiter::discover(dir.path(), &[CpuId(0)]).is_err());
    }
}
