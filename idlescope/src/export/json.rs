use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use idlescope_common::RoundRecord;
use serde::{Deserialize, Serialize};

use crate::config::MeasurementConfig;
use crate::domain::ExportError;
use crate::results::ResultSeries;

/// Configuration as recorded next to the results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub core_count: usize,
    pub cpus: Vec<u32>,
    pub target_duration_ns: u64,
    pub measurement_count: usize,
    pub mechanism: String,
    /// Mechanism actually used by each core
    pub mechanisms: Vec<String>,
    pub idle_cores: usize,
    pub cpu_selection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_state: Option<String>,
    pub deactivate_package_cstates: bool,
    pub max_retries: u32,
    pub spurious_wake_threshold: u64,
}

impl From<&MeasurementConfig> for ConfigSummary {
    fn from(cfg: &MeasurementConfig) -> Self {
        Self {
            core_count: cfg.core_count(),
            cpus: cfg.cpus().iter().map(|c| c.0).collect(),
            target_duration_ns: u64::try_from(cfg.target_duration().as_nanos()).unwrap_or(u64::MAX),
            measurement_count: cfg.measurement_count(),
            mechanism: cfg.requested_mechanism().to_string(),
            mechanisms: cfg.mechanisms().iter().map(ToString::to_string).collect(),
            idle_cores: cfg.idle_cores(),
            cpu_selection: cfg.cpu_selection().to_string(),
            io_port: cfg.io_port(),
            idle_state: cfg.idle_state().map(str::to_string),
            deactivate_package_cstates: cfg.deactivate_package_cstates(),
            max_retries: cfg.max_retries(),
            spurious_wake_threshold: cfg.spurious_wake_threshold(),
        }
    }
}

/// Top-level JSON document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementDocument {
    pub provider: String,
    pub config: ConfigSummary,
    pub rounds: Vec<RoundRecord>,
}

/// JSON exporter for a finished run
pub struct JsonExporter {
    document: MeasurementDocument,
}

impl JsonExporter {
    pub fn new(provider: &str, cfg: &MeasurementConfig, series: &ResultSeries) -> Self {
        Self {
            document: MeasurementDocument {
                provider: provider.to_string(),
                config: ConfigSummary::from(cfg),
                rounds: series.iter().cloned().collect(),
            },
        }
    }

    pub fn document(&self) -> &MeasurementDocument {
        &self.document
    }

    pub fn write_to(&self, writer: impl Write) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(writer, &self.document)?;
        Ok(())
    }

    /// Write the document to `path`, replacing any existing file
    pub fn export(&self, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path).map_err(|source| ExportError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigInput;
    use crate::domain::CpuId;
    use idlescope_common::{GlobalResult, PerCoreResult};

    fn series() -> (MeasurementConfig, ResultSeries) {
        let cfg = MeasurementConfig::build(ConfigInput {
            measurement_count: 1,
            cpus: vec![CpuId(0), CpuId(2)],
            ..Default::default()
        })
        .unwrap();
        let mut series = ResultSeries::with_capacity(1);
        series
            .commit(
                0,
                RoundRecord {
                    global: GlobalResult { energy_uj: Some(1234), ..Default::default() },
                    cores: vec![PerCoreResult { core: 1, cpu: 2, ..Default::default() }],
                    attempts: 2,
                    valid: true,
                    ..Default::default()
                },
            )
            .unwrap();
        (cfg, series)
    }

    #[test]
    fn test_document_parses_back() {
        let (cfg, series) = series();
        let exporter = JsonExporter::new("sim", &cfg, &series);

        let mut buf = Vec::new();
        exporter.write_to(&mut buf).unwrap();
        let parsed: MeasurementDocument = serde_json::from_slice(&buf).unwrap();

        assert_eq!(&parsed, exporter.document());
        assert_eq!(parsed.config.cpus, vec![0, 2]);
        assert_eq!(parsed.config.mechanism, "HALTWAIT");
        assert_eq!(parsed.rounds[0].global.energy_uj, Some(1234));
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let (cfg, series) = series();
        let dir = tempfile::tempdir().unwrap();
        let err = JsonExporter::new("sim", &cfg, &series)
            .export(&dir.path().join("missing").join("out.json"))
            .unwrap_err();
        assert!(matches!(err, ExportError::WriteFailed { .. }));
    }
}
