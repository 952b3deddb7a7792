//! Two-phase iteration record store
//!
//! Phase 1 appends a record right after the stimulus ran; phase 2 merges the
//! analysis into it. Records are append-only and keep iteration order.
//! [`RecorderHandle`] gives other threads a live view: a prefix of finished
//! records plus, at most, one in-flight phase-1 record.

use crate::types::{AnalysisResult, FrameRef, IterationRecord};
use std::sync::{Arc, PoisonError, RwLock};

/// Position of a record in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId(usize);

impl RecordId {
    pub fn index(self) -> usize {
        self.0
    }
}

type SharedRecords = Arc<RwLock<Vec<IterationRecord>>>;

/// Read-only view of a recorder, cheap to clone and send across threads
#[derive(Debug, Clone, Default)]
pub struct RecorderHandle {
    records: SharedRecords,
}

impl RecorderHandle {
    pub fn snapshot(&self) -> Vec<IterationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records whose analysis (or failure handling) is complete
    pub fn finished_count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.is_finished())
            .count()
    }

    pub fn latest(&self) -> Option<IterationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

/// Owning side of the record store; only the engine writes
#[derive(Debug, Default)]
pub struct ResultRecorder {
    records: SharedRecords,
}

impl ResultRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            records: Arc::clone(&self.records),
        }
    }

    /// Phase 1: append a record for an executed stimulus
    pub fn begin(&mut self, record: IterationRecord) -> RecordId {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        records.push(record);
        RecordId(records.len() - 1)
    }

    /// Apply an in-place update to a record; false if the id is unknown
    pub fn update(&mut self, id: RecordId, f: impl FnOnce(&mut IterationRecord)) -> bool {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(id.0) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Phase 2: merge the analysis and close the record
    pub fn complete(
        &mut self,
        id: RecordId,
        analysis: AnalysisResult,
        main: Option<FrameRef>,
        post: Option<FrameRef>,
        ended_at_ms: u64,
    ) -> bool {
        self.update(id, |record| {
            record.analysis = Some(analysis);
            record.frames.main = main;
            record.frames.post = post;
            record.ended_at_ms = Some(ended_at_ms);
        })
    }

    pub fn get(&self, id: RecordId) -> Option<IterationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<IterationRecord> {
        self.handle().snapshot()
    }
}
