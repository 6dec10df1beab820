//! Per-round publication
//!
//! The orchestrator calls [`RoundSink::on_round_committed`] right after a
//! round lands in the result series.

use crossbeam_channel::Sender;
use idlescope_common::RoundRecord;
use log::{info, warn};

use crate::domain::Nanos;

pub trait RoundSink {
    fn on_round_committed(&mut self, record: &RoundRecord);
}

/// Discards every round
#[derive(Debug, Default)]
pub struct NullSink;

impl RoundSink for NullSink {
    fn on_round_committed(&mut self, _record: &RoundRecord) {}
}

/// Logs a one-line summary per round
#[derive(Debug, Default)]
pub struct LogSink;

impl RoundSink for LogSink {
    fn on_round_committed(&mut self, record: &RoundRecord) {
        let energy = record
            .global
            .energy_uj
            .map_or_else(|| "n/a".to_string(), |uj| format!("{uj}uJ"));
        if record.valid {
            info!(
                "Round {}: {} energy {} ({} redos)",
                record.index,
                Nanos(record.global.duration_ns),
                energy,
                record.redos()
            );
        } else {
            warn!(
                "Round {} accepted after {} attempts despite: {}",
                record.index,
                record.attempts,
                record.violations.join("; ")
            );
        }
    }
}

/// Forwards committed rounds to another thread
///
/// A disconnected receiver is not an error; the measurement keeps going.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<RoundRecord>,
    disconnected: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<RoundRecord>) -> Self {
        Self { tx, disconnected: false }
    }
}

impl RoundSink for ChannelSink {
    fn on_round_committed(&mut self, record: &RoundRecord) {
        if self.disconnected {
            return;
        }
        if self.tx.send(record.clone()).is_err() {
            self.disconnected = true;
        }
    }
}
