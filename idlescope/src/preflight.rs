//! Pre-flight checks for idlescope
//!
//! Validates system requirements before any register is touched.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::MeasurementConfig;
use crate::domain::EntryMechanism;
use crate::platform::cpuidle::{IdleStateLimiter, SYSFS_CPU_ROOT};
use crate::provider::ProviderKind;

/// Run all pre-flight checks for a hardware run
///
/// The simulated provider needs none of them.
pub fn run_preflight_checks(kind: ProviderKind, cfg: &MeasurementConfig) -> Result<()> {
    if kind == ProviderKind::Sim {
        return Ok(());
    }
    check_privileges()?;
    if cfg!(target_arch = "x86_64") {
        check_msr_devices(cfg)?;
    }
    if cfg.requested_mechanism() == EntryMechanism::IoPort {
        check_io_port_device()?;
    }
    if let Some(state) = cfg.idle_state() {
        check_cpuidle(Path::new(SYSFS_CPU_ROOT), cfg, state)?;
    }
    Ok(())
}

/// Check if running as root (MSR access, /dev/port and cpuidle writes)
fn check_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: idlescope requires root privileges to access MSRs.\n\n\
         Run with: sudo idlescope ...\n\
         Or try a dry run: idlescope --provider sim --no-pin"
    );
}

fn check_msr_devices(cfg: &MeasurementConfig) -> Result<()> {
    for cpu in cfg.cpus() {
        let path = format!("/dev/cpu/{}/msr", cpu.0);
        if !Path::new(&path).exists() {
            bail!(
                "MSR device {path} not found.\n\n\
                 Load the msr driver: sudo modprobe msr"
            );
        }
    }
    Ok(())
}

fn check_io_port_device() -> Result<()> {
    if !Path::new("/dev/port").exists() {
        bail!(
            "/dev/port not found.\n\n\
             The IOPORT mechanism needs a kernel built with CONFIG_DEVPORT."
        );
    }
    Ok(())
}

/// Check that every participating CPU exposes cpuidle and knows `state`
fn check_cpuidle(root: &Path, cfg: &MeasurementConfig, state: &str) -> Result<()> {
    for cpu in cfg.cpus() {
        let dir = root.join(format!("cpu{}", cpu.0)).join("cpuidle");
        if !dir.is_dir() {
            bail!(
                "{} not found, cannot limit idle states to {state}.\n\n\
                 Is a cpuidle driver loaded? Check: cat {}/cpuidle/current_driver",
                dir.display(),
                root.display()
            );
        }
    }

    let limiter = IdleStateLimiter::discover(root, cfg.cpus())
        .with_context(|| format!("Failed to read cpuidle states below {}", root.display()))?;
    limiter.validate(state).with_context(|| {
        format!("Idle state {state} must exist on every measured CPU (see cpuN/cpuidle/stateK/name)")
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigInput;
    use crate::domain::{ConfigError, CpuId};

    fn cfg(cpus: &[u32]) -> MeasurementConfig {
        MeasurementConfig::build(ConfigInput {
            cpus: cpus.iter().copied().map(CpuId).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_sim_needs_no_checks() {
        assert!(run_preflight_checks(ProviderKind::Sim, &cfg(&[0])).is_ok());
    }

    fn fake_cpuidle(root: &Path, cpu: u32, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            let state = root.join(format!("cpu{cpu}/cpuidle/state{i}"));
            std::fs::create_dir_all(&state).unwrap();
            std::fs::write(state.join("name"), format!("{name}\n")).unwrap();
            std::fs::write(state.join("latency"), "0\n").unwrap();
            std::fs::write(state.join("disable"), "0\n").unwrap();
        }
    }

    #[test]
    fn test_cpuidle_presence() {
        let root = tempfile::tempdir().unwrap();
        fake_cpuidle(root.path(), 0, &["POLL", "C1", "C6"]);

        assert!(check_cpuidle(root.path(), &cfg(&[0]), "C6").is_ok());
        let err = check_cpuidle(root.path(), &cfg(&[0, 1]), "C6").unwrap_err();
        assert!(err.to_string().contains("cpu1"));
    }

    #[test]
    fn test_cpuidle_state_missing_on_one_cpu() {
        let root = tempfile::tempdir().unwrap();
        fake_cpuidle(root.path(), 0, &["POLL", "C1", "C6"]);
        fake_cpuidle(root.path(), 1, &["POLL", "C6"]);

        let err = check_cpuidle(root.path(), &cfg(&[0, 1]), "C1").unwrap_err();
        assert!(err.chain().any(|c| c.downcast_ref::<ConfigError>().is_some()));
        assert!(check_cpuidle(root.path(), &cfg(&[0, 1]), "c6").is_ok());
    }
}
