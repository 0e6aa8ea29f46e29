//! 📦 Batching: pile items up per key until the pile is big enough, then ship it.
//!
//! 🎬 *[a record arrives. then another. then nine thousand more. at some point
//! somebody has to say "that's a batch" and close the lid.]*
//!
//! The same `RecordBatcher` groups parsed records for the bulk indexer and
//! object descriptors for the task scanner; it only knows keys and sizes.
//! `BatchSizeController` is the adaptive record-count ceiling that shrinks every
//! time the engine answers 413.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::common::{Batch, DEFAULT_GROUP_KEY};

/// 📉 How much one 413 takes off the batch size.
pub const SHRINK_STEP: usize = 2000;

/// 🧱 Sizes below this are left alone, no matter how many 413s arrive.
pub const SHRINK_FLOOR: usize = 4000;

/// 📏 What the threshold counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdUnit {
    /// sum of declared item sizes
    Bytes,
    /// every item counts as one
    Count,
}

/// 📏 Flush once a group's running total reaches `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Threshold {
    pub unit: ThresholdUnit,
    pub limit: usize,
}

impl Threshold {
    pub fn bytes(limit: usize) -> Self {
        Self {
            unit: ThresholdUnit::Bytes,
            limit,
        }
    }

    pub fn count(limit: usize) -> Self {
        Self {
            unit: ThresholdUnit::Count,
            limit,
        }
    }

    /// 📐 The amount an item contributes, given its declared size.
    pub fn weigh(&self, declared_size: usize) -> usize {
        match self.unit {
            ThresholdUnit::Bytes => declared_size,
            ThresholdUnit::Count => 1,
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        // 📦 10 MiB, the classic bulk sweet spot
        Threshold::bytes(10 * 1024 * 1024)
    }
}

/// ⚙️ `[batching]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    #[serde(default)]
    pub threshold: Threshold,
    /// 🔢 starting record-count ceiling per bulk request, before any 413 shrinks it
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    /// 🗂️ group migration tasks by destination directory
    #[serde(default)]
    pub merge_by_destination: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            threshold: Threshold::default(),
            initial_batch_size: default_initial_batch_size(),
            merge_by_destination: false,
        }
    }
}

fn default_initial_batch_size() -> usize {
    10_000
}

/// 📦 Per-key accumulator. Each group is flushed exactly once: when its total
/// first reaches the threshold, or by `finish` if it is still non-empty.
#[derive(Debug)]
pub struct RecordBatcher<T> {
    threshold: Threshold,
    groups: BTreeMap<String, Batch<T>>,
}

impl<T> RecordBatcher<T> {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            groups: BTreeMap::new(),
        }
    }

    /// ➕ Add an item under `key` (or `"all"`). Returns the group if this item tipped it over.
    pub fn push(&mut self, key: Option<&str>, item: T, declared_size: usize) -> Option<Batch<T>> {
        let key = key.unwrap_or(DEFAULT_GROUP_KEY);
        let group = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| Batch::new(key));
        group.items.push(item);
        group.total += self.threshold.weigh(declared_size);
        if group.total >= self.threshold.limit {
            debug!("📦 flushing '{}' at {} ({} items)", key, group.total, group.items.len());
            return self.groups.remove(key);
        }
        None
    }

    /// 🏁 End of input: every non-empty group, in key order.
    pub fn finish(self) -> Vec<Batch<T>> {
        self.groups
            .into_values()
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    pub fn pending_items(&self) -> usize {
        self.groups.values().map(Batch::len).sum()
    }
}

/// 🎚️ The adaptive batch size. Shared by every sink worker in the process; the
/// persisted copy lives in the pipeline state record.
#[derive(Debug)]
pub struct BatchSizeController {
    current: AtomicUsize,
}

impl BatchSizeController {
    pub fn new(initial: usize) -> Self {
        Self {
            current: AtomicUsize::new(initial.max(1)),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// 📉 One 413 happened. Returns the size to use from now on.
    pub fn shrink(&self) -> usize {
        let outcome = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size >= SHRINK_FLOOR).then(|| size - SHRINK_STEP)
            });
        match outcome {
            Ok(previous) => {
                let next = previous - SHRINK_STEP;
                warn!("📉 engine said 413, batch size {previous} -> {next}");
                next
            }
            Err(unchanged) => {
                warn!("🧱 engine said 413 but batch size {unchanged} is already below the floor");
                unchanged
            }
        }
    }

    /// 🤝 Adopt a smaller size learned elsewhere (another invocation, the state store).
    pub fn adopt_min(&self, size: usize) {
        self.current.fetch_min(size.max(1), Ordering::SeqCst);
    }
}
