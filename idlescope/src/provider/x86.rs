//! x86_64 provider: TSC timestamps, RAPL energy and C-state residency MSRs
//!
//! Registers are accessed through the `msr` driver (`/dev/cpu/N/msr`), one
//! handle per participating CPU. A read issued from a pinned thread through
//! its own CPU's handle is local to that core.
//!
//! Intel parts report package and core residency plus unhalted reference
//! cycles (fixed counter 2). AMD parts report package and per-core energy.

#![allow(unsafe_code)] // cpuid and rdtsc intrinsics

use std::arch::x86_64::{__cpuid, _rdtsc};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::time::{Duration, Instant};

use idlescope_common::{CoreResidency, PackageResidency};
use log::{debug, info, warn};

use super::{CounterProvider, GlobalCounters, LocalCounters, SleepContext, Wake};
use crate::config::MeasurementConfig;
use crate::domain::{CoreId, CpuId, EntryMechanism, Nanos, ProviderError, Ticks};
use crate::platform::cpuidle::{IdleStateLimiter, SYSFS_CPU_ROOT};

const MSR_RAPL_POWER_UNIT: u64 = 0x606;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
const MSR_AMD_RAPL_POWER_UNIT: u64 = 0xC001_0299;
const MSR_AMD_CORE_ENERGY_STATUS: u64 = 0xC001_029A;
const MSR_AMD_PKG_ENERGY_STATUS: u64 = 0xC001_029B;

const MSR_PKG_C2_RESIDENCY: u64 = 0x60D;
const MSR_PKG_C3_RESIDENCY: u64 = 0x3F8;
const MSR_PKG_C6_RESIDENCY: u64 = 0x3F9;
const MSR_PKG_C7_RESIDENCY: u64 = 0x3FA;
const MSR_CORE_C3_RESIDENCY: u64 = 0x3FC;
const MSR_CORE_C6_RESIDENCY: u64 = 0x3FD;
const MSR_CORE_C7_RESIDENCY: u64 = 0x3FE;

const MSR_PKG_CST_CONFIG_CONTROL: u64 = 0xE2;
const IA32_FIXED_CTR2: u64 = 0x30B;
const IA32_FIXED_CTR_CTRL: u64 = 0x38D;
const IA32_PERF_GLOBAL_CTRL: u64 = 0x38F;

/// Package C-state limit field of MSR_PKG_CST_CONFIG_CONTROL
const PKG_CST_LIMIT_MASK: u64 = 0b111;

/// Upper bound for waiting on the next RAPL update (updates come every ~1ms)
const RAPL_UPDATE_TIMEOUT: Duration = Duration::from_millis(20);

const TSC_CALIBRATION_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

/// Result of the identification cpuid leaves
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub vendor: Vendor,
    pub family: u32,
    pub model: u32,
    pub mwait: bool,
    pub invariant_tsc: bool,
}

impl CpuInfo {
    pub fn detect() -> Self {
        // SAFETY: cpuid is available on every x86_64 CPU
        let (leaf0, leaf1, ext) = unsafe { (__cpuid(0), __cpuid(1), __cpuid(0x8000_0007)) };

        let vendor = match (leaf0.ebx, leaf0.edx, leaf0.ecx) {
            (0x756E_6547, 0x4965_6E69, 0x6C65_746E) => Vendor::Intel,
            (0x6874_7541, 0x6974_6E65, 0x444D_4163) => Vendor::Amd,
            _ => Vendor::Unknown,
        };
        let (family, model) = family_model(leaf1.eax);

        Self {
            vendor,
            family,
            model,
            mwait: leaf1.ecx & (1 << 3) != 0,
            invariant_tsc: ext.edx & (1 << 8) != 0,
        }
    }
}

/// Display family and model from cpuid leaf 1 EAX
pub fn family_model(eax: u32) -> (u32, u32) {
    let family_id = (eax >> 8) & 0xf;
    let model_id = (eax >> 4) & 0xf;

    let family = if family_id == 0xf { family_id + ((eax >> 20) & 0xff) } else { family_id };
    let model = if family_id == 0x6 || family_id == 0xf {
        model_id + (((eax >> 16) & 0xf) << 4)
    } else {
        model_id
    };
    (family, model)
}

/// Energy status unit exponent (bits 12:8 of the power unit MSR)
pub fn energy_status_unit(power_unit: u64) -> u32 {
    // Masked to 5 bits, cannot truncate
    #[allow(clippy::cast_possible_truncation)]
    let esu = ((power_unit >> 8) & 0b1_1111) as u32;
    esu
}

fn tsc() -> Ticks {
    // SAFETY: rdtsc has no preconditions
    Ticks(unsafe { _rdtsc() })
}

/// TSC frequency in kHz, from sysfs if the kernel exports it, calibrated
/// against the monotonic clock otherwise
fn tsc_khz() -> u64 {
    let exported = fs::read_to_string(format!("{SYSFS_CPU_ROOT}/cpu0/tsc_freq_khz"))
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&khz| khz > 0);
    if let Some(khz) = exported {
        return khz;
    }

    let wall = Instant::now();
    let start = tsc();
    std::thread::sleep(TSC_CALIBRATION_WINDOW);
    let ticks = tsc().saturating_since(start).0;
    let elapsed_us = u64::try_from(wall.elapsed().as_micros()).unwrap_or(u64::MAX).max(1);
    let khz = ticks.saturating_mul(1000) / elapsed_us;
    debug!("Calibrated TSC at {khz} kHz");
    khz.max(1)
}

/// One CPU's `/dev/cpu/N/msr` handle
#[derive(Debug)]
struct MsrDevice {
    cpu: CpuId,
    file: File,
}

impl MsrDevice {
    fn open(cpu: CpuId) -> Result<Self, ProviderError> {
        let path = format!("/dev/cpu/{}/msr", cpu.0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| ProviderError::DeviceMissing(path))?;
        Ok(Self { cpu, file })
    }

    fn read(&self, reg: &'static str, addr: u64) -> Result<u64, ProviderError> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, addr)
            .map_err(|source| ProviderError::RegisterAccess { reg, addr, cpu: self.cpu, source })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&self, reg: &'static str, addr: u64, value: u64) -> Result<(), ProviderError> {
        self.file
            .write_all_at(&value.to_le_bytes(), addr)
            .map_err(|source| ProviderError::RegisterAccess { reg, addr, cpu: self.cpu, source })
    }

    /// Read-modify-write; returns the previous value
    fn update(
        &self,
        reg: &'static str,
        addr: u64,
        f: impl FnOnce(u64) -> u64,
    ) -> Result<u64, ProviderError> {
        let old = self.read(reg, addr)?;
        self.write(reg, addr, f(old))?;
        Ok(old)
    }
}

/// Register values changed by `prepare`, per device
#[derive(Debug, Default)]
struct Saved {
    pkg_cst_limit: Option<u64>,
    fixed_ctr_ctrl: Vec<(usize, u64)>,
    perf_global_ctrl: Vec<(usize, u64)>,
}

#[derive(Debug)]
pub struct X86Provider {
    info: CpuInfo,
    tsc_khz: u64,
    energy_unit: u32,
    power_unit_msr: u64,
    pkg_energy_msr: u64,
    /// Indexed by core identity
    devices: Vec<MsrDevice>,
    io_port: Option<(File, u16)>,
    idle_limiter: Option<IdleStateLimiter>,
    saved: Saved,
}

impl X86Provider {
    pub fn new() -> Result<Self, ProviderError> {
        let info = CpuInfo::detect();
        info!(
            "CPU vendor {:?}, family 0x{:x}, model 0x{:x}",
            info.vendor, info.family, info.model
        );
        if !info.mwait {
            warn!("monitor/mwait not supported by this CPU");
        }
        if !info.invariant_tsc {
            warn!("TSC not invariant, idle-state statistics are potentially meaningless");
        }
        if info.vendor == Vendor::Unknown {
            warn!("Unknown CPU vendor, energy and residency counters are unavailable");
        }

        let (power_unit_msr, pkg_energy_msr) = match info.vendor {
            Vendor::Amd => (MSR_AMD_RAPL_POWER_UNIT, MSR_AMD_PKG_ENERGY_STATUS),
            _ => (MSR_RAPL_POWER_UNIT, MSR_PKG_ENERGY_STATUS),
        };

        Ok(Self {
            info,
            tsc_khz: tsc_khz(),
            energy_unit: 0,
            power_unit_msr,
            pkg_energy_msr,
            devices: Vec::new(),
            io_port: None,
            idle_limiter: None,
            saved: Saved::default(),
        })
    }

    fn has_energy(&self) -> bool {
        self.info.vendor != Vendor::Unknown
    }

    fn device(&self, core: CoreId) -> Result<&MsrDevice, ProviderError> {
        self.devices
            .get(core.index())
            .ok_or_else(|| ProviderError::DeviceMissing(format!("msr device for {core}")))
    }

    fn pkg_energy(&self) -> Result<u64, ProviderError> {
        Ok(self.device(CoreId::LEADER)?.read("PKG_ENERGY_STATUS", self.pkg_energy_msr)?
            & self.counter_mask())
    }

    /// Spin until the package energy counter changes so the start value sits
    /// at the beginning of an update interval
    fn wait_for_rapl_update(&self) -> Result<u64, ProviderError> {
        let original = self.pkg_energy()?;
        let started = Instant::now();
        loop {
            let current = self.pkg_energy()?;
            if current != original {
                return Ok(current);
            }
            if started.elapsed() > RAPL_UPDATE_TIMEOUT {
                warn!("Package energy counter did not update within {RAPL_UPDATE_TIMEOUT:?}");
                return Ok(current);
            }
            std::hint::spin_loop();
        }
    }

    fn pkg_residency(&self) -> Result<Option<PackageResidency>, ProviderError> {
        if self.info.vendor != Vendor::Intel {
            return Ok(None);
        }
        let dev = self.device(CoreId::LEADER)?;
        Ok(Some(PackageResidency {
            c2: dev.read("PKG_C2_RESIDENCY", MSR_PKG_C2_RESIDENCY)?,
            c3: dev.read("PKG_C3_RESIDENCY", MSR_PKG_C3_RESIDENCY)?,
            c6: dev.read("PKG_C6_RESIDENCY", MSR_PKG_C6_RESIDENCY)?,
            c7: dev.read("PKG_C7_RESIDENCY", MSR_PKG_C7_RESIDENCY)?,
        }))
    }

    fn local(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        let dev = self.device(core)?;
        match self.info.vendor {
            Vendor::Intel => Ok(LocalCounters {
                unhalted: Some(dev.read("IA32_FIXED_CTR2", IA32_FIXED_CTR2)?),
                residency: Some(CoreResidency {
                    c3: dev.read("CORE_C3_RESIDENCY", MSR_CORE_C3_RESIDENCY)?,
                    c6: dev.read("CORE_C6_RESIDENCY", MSR_CORE_C6_RESIDENCY)?,
                    c7: dev.read("CORE_C7_RESIDENCY", MSR_CORE_C7_RESIDENCY)?,
                }),
                energy: None,
            }),
            Vendor::Amd => Ok(LocalCounters {
                energy: Some(
                    dev.read("AMD_CORE_ENERGY_STATUS", MSR_AMD_CORE_ENERGY_STATUS)?
                        & self.counter_mask(),
                ),
                ..LocalCounters::default()
            }),
            Vendor::Unknown => Ok(LocalCounters::default()),
        }
    }

    /// Apply the package C-state limit and enable fixed counter 2 on every CPU
    fn init_intel_counters(&mut self, deactivate_pcstates: bool) {
        for (i, dev) in self.devices.iter().enumerate() {
            match dev.update("PKG_CST_CONFIG_CONTROL", MSR_PKG_CST_CONFIG_CONTROL, |v| {
                if deactivate_pcstates {
                    v & !PKG_CST_LIMIT_MASK
                } else {
                    v | PKG_CST_LIMIT_MASK
                }
            }) {
                Ok(old) => {
                    self.saved.pkg_cst_limit.get_or_insert(old & PKG_CST_LIMIT_MASK);
                }
                Err(e) => warn!("Could not change package C-state settings: {e}"),
            }

            let fixed = dev
                .update("IA32_FIXED_CTR_CTRL", IA32_FIXED_CTR_CTRL, |v| v | (0b11 << 8))
                .map(|old| self.saved.fixed_ctr_ctrl.push((i, old)))
                .and_then(|()| {
                    dev.update("IA32_PERF_GLOBAL_CTRL", IA32_PERF_GLOBAL_CTRL, |v| v | (1 << 34))
                })
                .map(|old| self.saved.perf_global_ctrl.push((i, old)));
            if let Err(e) = fixed {
                warn!("Could not enable the unhalted cycles counter: {e}");
            }
        }
    }

    fn restore_intel_counters(&mut self) {
        let saved = std::mem::take(&mut self.saved);

        if let Some(limit) = saved.pkg_cst_limit {
            for dev in &self.devices {
                if let Err(e) = dev.update("PKG_CST_CONFIG_CONTROL", MSR_PKG_CST_CONFIG_CONTROL, |v| {
                    (v & !PKG_CST_LIMIT_MASK) | limit
                }) {
                    warn!("Could not restore package C-state settings: {e}");
                }
            }
        }

        for (i, value) in saved.perf_global_ctrl.into_iter().rev() {
            if let Err(e) = self.devices[i].write("IA32_PERF_GLOBAL_CTRL", IA32_PERF_GLOBAL_CTRL, value) {
                warn!("Could not restore IA32_PERF_GLOBAL_CTRL: {e}");
            }
        }
        for (i, value) in saved.fixed_ctr_ctrl.into_iter().rev() {
            if let Err(e) = self.devices[i].write("IA32_FIXED_CTR_CTRL", IA32_FIXED_CTR_CTRL, value) {
                warn!("Could not restore IA32_FIXED_CTR_CTRL: {e}");
            }
        }
    }
}

impl CounterProvider for X86Provider {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn prepare(&mut self, cfg: &MeasurementConfig) -> Result<(), ProviderError> {
        // Everything that can fail on bad input is checked before the first MSR write
        self.devices = cfg.cpus().iter().map(|&cpu| MsrDevice::open(cpu)).collect::<Result<_, _>>()?;

        if self.has_energy() {
            let unit = self.device(CoreId::LEADER)?.read("RAPL_POWER_UNIT", self.power_unit_msr)?;
            self.energy_unit = energy_status_unit(unit);
            info!("RAPL energy unit: 1/{} J", 1u64 << self.energy_unit);
        }

        if cfg.requested_mechanism() == EntryMechanism::IoPort {
            let port = cfg.io_port().ok_or(crate::domain::ConfigError::MissingIoPort)?;
            let file = File::open("/dev/port")
                .map_err(|_| ProviderError::DeviceMissing("/dev/port".to_string()))?;
            info!("Using I/O port 0x{port:x}");
            self.io_port = Some((file, port));
        }

        let limiter = match cfg.idle_state() {
            Some(state) => {
                let limiter = IdleStateLimiter::discover(SYSFS_CPU_ROOT, cfg.cpus())?;
                limiter.validate(state)?;
                Some((limiter, state))
            }
            None => None,
        };

        if self.info.vendor == Vendor::Intel {
            self.init_intel_counters(cfg.deactivate_package_cstates());
        } else if cfg.deactivate_package_cstates() {
            warn!("Package C-states can only be deactivated on Intel CPUs");
        }

        if let Some((mut limiter, state)) = limiter {
            let disabled = limiter.limit_to(state)?;
            info!("Limited idle states to {state} ({disabled} deeper states disabled)");
            self.idle_limiter = Some(limiter);
        }

        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut limiter) = self.idle_limiter.take() {
            limiter.restore();
        }
        if self.info.vendor == Vendor::Intel {
            self.restore_intel_counters();
        }
        self.io_port = None;
        self.devices.clear();
    }

    fn now(&self) -> Ticks {
        tsc()
    }

    fn ticks_to_ns(&self, ticks: Ticks) -> Nanos {
        let ns = u128::from(ticks.0) * 1_000_000 / u128::from(self.tsc_khz);
        Nanos(u64::try_from(ns).unwrap_or(u64::MAX))
    }

    fn ns_to_ticks(&self, ns: Nanos) -> Ticks {
        let ticks = u128::from(ns.0) * u128::from(self.tsc_khz) / 1_000_000;
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    fn energy_to_uj(&self, raw: u64) -> u64 {
        let uj = (u128::from(raw) * 1_000_000) >> self.energy_unit;
        u64::try_from(uj).unwrap_or(u64::MAX)
    }

    fn read_global_start_counters(&self) -> Result<GlobalCounters, ProviderError> {
        let energy = if self.has_energy() { Some(self.wait_for_rapl_update()?) } else { None };
        Ok(GlobalCounters { energy, residency: self.pkg_residency()? })
    }

    fn read_global_final_counters(&self) -> Result<GlobalCounters, ProviderError> {
        let energy = if self.has_energy() { Some(self.pkg_energy()?) } else { None };
        Ok(GlobalCounters { energy, residency: self.pkg_residency()? })
    }

    fn read_local_start_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        self.local(core)
    }

    fn read_local_final_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        self.local(core)
    }

    fn sleep_once(&self, ctx: &SleepContext<'_>) -> Wake {
        if ctx.mechanism == EntryMechanism::IoPort {
            if let Some((file, port)) = &self.io_port {
                let mut byte = [0u8; 1];
                if let Err(e) = file.read_exact_at(&mut byte, u64::from(*port)) {
                    debug!("{}: I/O port read failed: {e}", ctx.core);
                }
            }
        }
        self.halt_wait(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_model_decoding() {
        // Family 6, extended model 0x9, model 0xE -> 0x9E (Coffee Lake)
        assert_eq!(family_model(0x0009_06EA), (6, 0x9E));
        // Family 0xF with extended family 0x8 -> 0x17 (Zen)
        assert_eq!(family_model(0x0080_0F11), (0x17, 0x1));
    }

    #[test]
    fn test_energy_status_unit() {
        // Typical Intel RAPL_POWER_UNIT: ESU = 14 (61 uJ)
        assert_eq!(energy_status_unit(0x000A_0E03), 14);
        assert_eq!(energy_status_unit(0), 0);
    }

    #[test]
    fn test_tsc_is_monotonic() {
        let a = tsc();
        let b = tsc();
        assert!(b >= a);
    }
}
