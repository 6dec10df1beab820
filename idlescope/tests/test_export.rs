use std::sync::atomic::AtomicBool;
use std::time::Duration;

use idlescope::config::{ConfigInput, MeasurementConfig};
use idlescope::domain::CpuId;
use idlescope::export::json::MeasurementDocument;
use idlescope::export::{write_attribute_tree, JsonExporter};
use idlescope::measure::Orchestrator;
use idlescope::provider::sim::SimulatedProvider;
use idlescope::results::{NullSink, ResultSeries};

fn measure() -> (MeasurementConfig, ResultSeries) {
    let cfg = MeasurementConfig::build(ConfigInput {
        duration: Duration::from_millis(3),
        measurement_count: 2,
        idle_cores: 1,
        pin_threads: false,
        cpus: (0..2).map(CpuId).collect(),
        ..Default::default()
    })
    .expect("valid configuration");
    let mut orchestrator = Orchestrator::new(cfg.clone(), Box::new(SimulatedProvider::new()));
    let series = orchestrator
        .run_all(&mut NullSink, &AtomicBool::new(false))
        .expect("measurement should complete");
    (cfg, series)
}

#[test]
fn test_json_export_round_trips() {
    let (cfg, series) = measure();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("results.json");

    JsonExporter::new("sim", &cfg, &series).export(&path).expect("export");

    let content = std::fs::read_to_string(&path).expect("read back");
    let doc: MeasurementDocument = serde_json::from_str(&content).expect("valid JSON");
    assert_eq!(doc.provider, "sim");
    assert_eq!(doc.config.mechanisms, vec!["HALTWAIT", "POLL"]);
    assert_eq!(doc.rounds.len(), 2);
    for (stored, exported) in series.iter().zip(&doc.rounds) {
        assert_eq!(stored, exported);
    }
}

#[test]
fn test_attribute_tree_has_one_line_per_round() {
    let (_, series) = measure();
    let dir = tempfile::tempdir().expect("tempdir");

    let root = write_attribute_tree(dir.path(), &series).expect("write tree");

    for file in ["energy_consumption", "duration", "cpu0/wakeups", "cpu1/wakeup_time", "cpu0/c6"] {
        let content = std::fs::read_to_string(root.join(file)).expect(file);
        assert_eq!(content.lines().count(), 2, "{file}");
    }
    // The simulated provider has no package residency counters
    assert!(!root.join("c7").exists());
}
