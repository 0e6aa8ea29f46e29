//! 🧵 Workers: the ones who actually do the work while the Supervisor takes the credit.
//!
//! 🚀 One source, many sinks, one channel of `WorkItem`s between them. Each
//! worker returns its own slice of the `RunSummary` when it's done, and the
//! Supervisor adds them up.

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::common::{Batch, RunSummary, SourcedRecord};

mod sink_worker;
mod source_worker;

pub(super) use sink_worker::SinkWorker;
pub(super) use source_worker::SourceWorker;

/// 🏗️ A background worker. Start it, get a handle, await the tally.
pub(super) trait Worker {
    fn start(self) -> JoinHandle<Result<RunSummary>>;
}

/// 📦 One batch plus where it came from. The origin names the failure export file.
#[derive(Debug, Clone)]
pub(super) struct WorkItem {
    pub(super) origin: String,
    pub(super) batch: Batch<SourcedRecord>,
}
