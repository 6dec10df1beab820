//! Attribute tree export
//!
//! ```text
//! <dir>/idle_measurements/
//!     energy_consumption  start_time  end_time  total_ticks  duration
//!     c2  c3  c6  c7  attempts  valid
//!     cpu0/
//!         wakeups  wakeup_time  unhalted  c3  c6  c7  energy_consumption
//!     cpu1/
//!     ...
//! ```
//!
//! Every file holds one decimal value per round, in round order. Quantities
//! the provider did not report are left out.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use idlescope_common::{PerCoreResult, RoundRecord};
use log::debug;

use crate::domain::ExportError;
use crate::results::ResultSeries;

pub const ROOT_DIR: &str = "idle_measurements";

/// Write `series` below `dir`; returns the tree's root directory
pub fn write_attribute_tree(dir: &Path, series: &ResultSeries) -> Result<PathBuf, ExportError> {
    let root = dir.join(ROOT_DIR);
    create_dir(&root)?;
    let rounds: Vec<&RoundRecord> = series.iter().collect();

    let global: [(&str, fn(&RoundRecord) -> Option<u64>); 12] = [
        ("energy_consumption", |r| r.global.energy_uj),
        ("start_time", |r| Some(r.global.start_ticks)),
        ("end_time", |r| Some(r.global.end_ticks)),
        ("total_ticks", |r| Some(r.global.total_ticks)),
        ("duration", |r| Some(r.global.duration_ns)),
        ("c2", |r| r.global.residency.map(|p| p.c2)),
        ("c3", |r| r.global.residency.map(|p| p.c3)),
        ("c6", |r| r.global.residency.map(|p| p.c6)),
        ("c7", |r| r.global.residency.map(|p| p.c7)),
        ("attempts", |r| Some(u64::from(r.attempts))),
        ("valid", |r| Some(u64::from(r.valid))),
        ("energy_wrapped", |r| Some(u64::from(r.global.energy_wrapped))),
    ];
    for (name, value) in global {
        write_column(&root.join(name), rounds.iter().map(|r| value(r)))?;
    }

    let per_core: [(&str, fn(&PerCoreResult) -> Option<u64>); 8] = [
        ("wakeups", |c| Some(c.wakeups)),
        ("spurious_wakeups", |c| Some(c.spurious_wakeups)),
        ("wakeup_time", |c| Some(c.wakeup_latency_ns)),
        ("unhalted", |c| c.unhalted),
        ("c3", |c| c.residency.map(|r| r.c3)),
        ("c6", |c| c.residency.map(|r| r.c6)),
        ("c7", |c| c.residency.map(|r| r.c7)),
        ("energy_consumption", |c| c.energy_uj),
    ];
    let core_count = rounds.iter().map(|r| r.cores.len()).max().unwrap_or(0);
    for index in 0..core_count {
        let cpu_dir = root.join(format!("cpu{index}"));
        create_dir(&cpu_dir)?;
        for (name, value) in per_core {
            let column = rounds.iter().map(|r| r.cores.get(index).and_then(value));
            write_column(&cpu_dir.join(name), column)?;
        }
    }

    debug!("Wrote {} rounds to {}", rounds.len(), root.display());
    Ok(root)
}

/// Write one value per line; skipped entirely if no round has a value
fn write_column(path: &Path, values: impl Iterator<Item = Option<u64>>) -> Result<(), ExportError> {
    let values: Vec<Option<u64>> = values.collect();
    if values.iter().all(Option::is_none) {
        return Ok(());
    }

    let mut content = String::new();
    for value in values {
        let _ = writeln!(content, "{}", value.unwrap_or(0));
    }
    fs::write(path, content).map_err(|source| ExportError::WriteFailed {
        path: path.display().to_string(),
        source,
    })
}

fn create_dir(path: &Path) -> Result<(), ExportError> {
    fs::create_dir_all(path).map_err(|source| ExportError::WriteFailed {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use idlescope_common::{CoreResidency, GlobalResult};

    fn round(energy: u64, wakeups: u64) -> RoundRecord {
        RoundRecord {
            global: GlobalResult { energy_uj: Some(energy), duration_ns: 100, ..Default::default() },
            cores: vec![
                PerCoreResult { core: 0, wakeups, ..Default::default() },
                PerCoreResult {
                    core: 1,
                    wakeups: 1,
                    residency: Some(CoreResidency { c3: 0, c6: 7, c7: 0 }),
                    ..Default::default()
                },
            ],
            attempts: 1,
            valid: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_tree_layout() {
        let mut series = ResultSeries::with_capacity(2);
        series.commit(0, round(10, 3)).unwrap();
        series.commit(1, round(20, 4)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let root = write_attribute_tree(dir.path(), &series).unwrap();

        let read = |p: &str| fs::read_to_string(root.join(p)).unwrap();
        assert_eq!(read("energy_consumption"), "10\n20\n");
        assert_eq!(read("duration"), "100\n100\n");
        assert_eq!(read("cpu0/wakeups"), "3\n4\n");
        assert_eq!(read("cpu1/c6"), "7\n7\n");
    }

    #[test]
    fn test_unreported_quantities_are_omitted() {
        let mut series = ResultSeries::with_capacity(1);
        series.commit(0, round(10, 3)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let root = write_attribute_tree(dir.path(), &series).unwrap();

        assert!(!root.join("c2").exists());
        assert!(!root.join("cpu0/unhalted").exists());
        assert!(!root.join("cpu0/c6").exists());
        assert!(root.join("cpu1/c6").exists());
    }
}
