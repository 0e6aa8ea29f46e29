//! 📦 The shared nouns of the pipeline: records, batches, and what became of them.
//!
//! 🧾 A `Record` is an ordered map (serde_json is built with `preserve_order`),
//! so fields come out in the order the parser declared them. The batches that
//! carry records around don't care what's inside, which is how the same batcher
//! also groups migration tasks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 🪵 One structured log record. Empty means "this line was skipped".
pub type Record = Map<String, Value>;

/// 🏷️ The grouping key used when nobody asked for a specific one.
pub const DEFAULT_GROUP_KEY: &str = "all";

/// 📏 How much room a record takes in a bulk body, give or take the action line.
pub fn record_size(record: &Record) -> usize {
    serde_json::to_vec(record).map(|bytes| bytes.len()).unwrap_or(0)
}

/// 📍 Where a record was read: which input, which line, which record of that line.
///
/// Lines that explode into several records (CloudTrail `Records`, CloudWatch
/// envelopes) tell their records apart by `ordinal`. Two identical lines are
/// still two positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub origin: Arc<str>,
    /// 1-based line number at which the decoder emitted the record
    pub line: u64,
    pub ordinal: u32,
}

impl SourcePosition {
    pub fn new(origin: impl Into<Arc<str>>, line: u64, ordinal: u32) -> Self {
        Self {
            origin: origin.into(),
            line,
            ordinal,
        }
    }
}

/// 🪵📍 A record plus where it came from. This is what the bulk indexer takes.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedRecord {
    pub record: Record,
    pub position: SourcePosition,
}

impl SourcedRecord {
    pub fn new(record: Record, position: SourcePosition) -> Self {
        Self { record, position }
    }

    /// 📜 One record per line of `origin`, numbered from line 1.
    pub fn from_lines(origin: &str, records: Vec<Record>) -> Vec<SourcedRecord> {
        let origin: Arc<str> = Arc::from(origin);
        records
            .into_iter()
            .zip(1u64..)
            .map(|(record, line)| SourcedRecord::new(record, SourcePosition::new(origin.clone(), line, 0)))
            .collect()
    }
}

/// 📦 A flushed group of items plus the running total that tipped it over.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// 🏷️ grouping key, `"all"` unless something more interesting was derived
    pub key: String,
    pub items: Vec<T>,
    /// 📊 sum of item sizes (bytes) or item count, depending on the threshold unit
    pub total: usize,
}

impl<T> Batch<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            items: Vec::new(),
            total: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 🚫 A record the engine refused, with the receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub record: Record,
    pub index_name: String,
    pub error_type: String,
    pub error_reason: String,
}

impl FailedRecord {
    /// 📎 The record with `index_name`, `error_type` and `error_reason` stapled on,
    /// which is the shape the failure export writes.
    pub fn annotated(&self) -> Record {
        let mut annotated = self.record.clone();
        annotated.insert("index_name".into(), Value::String(self.index_name.clone()));
        annotated.insert("error_type".into(), Value::String(self.error_type.clone()));
        annotated.insert("error_reason".into(), Value::String(self.error_reason.clone()));
        annotated
    }
}

/// ✅🚫 How one bulk submission went. Every input record lands in exactly one of the two.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    pub succeeded: Vec<Record>,
    pub failed: Vec<FailedRecord>,
}

impl BulkResult {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// 🧮 Fold another result into this one. Used when a batch was split after a 413.
    pub fn absorb(&mut self, other: BulkResult) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// 📊 End-of-run tally, printed as a table by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub lines_read: u64,
    pub records_parsed: u64,
    pub lines_skipped: u64,
    pub batches_submitted: u64,
    pub records_indexed: u64,
    pub records_failed: u64,
    pub oversize_events: u64,
    pub final_batch_size: usize,
}

impl RunSummary {
    /// 🧮 Add another worker's counters to this one. The batch size is set once, at the end.
    pub fn absorb(&mut self, other: &RunSummary) {
        self.lines_read += other.lines_read;
        self.records_parsed += other.records_parsed;
        self.lines_skipped += other.lines_skipped;
        self.batches_submitted += other.batches_submitted;
        self.records_indexed += other.records_indexed;
        self.records_failed += other.records_failed;
        self.oversize_events += other.oversize_events;
    }
}
