//! Fixed-capacity result series
//!
//! One slot per round index. Capacity is fixed when the series is created
//! (and never above [`MAX_NUMBER_OF_MEASUREMENTS`]); committing a round
//! replaces the slot as a whole.

use idlescope_common::{RoundRecord, MAX_NUMBER_OF_MEASUREMENTS};

use crate::domain::MeasureError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSeries {
    slots: Vec<Option<RoundRecord>>,
}

impl ResultSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: vec![None; capacity.min(MAX_NUMBER_OF_MEASUREMENTS)] }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store `record` at `index`, replacing any earlier record there
    pub fn commit(&mut self, index: usize, mut record: RoundRecord) -> Result<(), MeasureError> {
        let capacity = self.capacity();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(MeasureError::IndexOutOfRange { index, capacity })?;
        record.index = index;
        *slot = Some(record);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&RoundRecord> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Committed rounds in index order
    pub fn iter(&self) -> impl Iterator<Item = &RoundRecord> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every slot holds a round
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Rounds that were accepted only because the retry budget ran out
    pub fn invalid_rounds(&self) -> usize {
        self.iter().filter(|r| !r.valid).count()
    }
}
