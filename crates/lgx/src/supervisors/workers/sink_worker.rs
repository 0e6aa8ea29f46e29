//! 🎬 *[a channel fills with batches. somewhere, a sink waits.]*
//! *[the engine says 413. the sink does not panic. the sink re-chunks.]*
//!
//! 🗑️ Drains `WorkItem`s, slices each batch to the current adaptive size,
//! and submits the slices. An `Oversize` answer puts the slice back at the
//! front of the queue in smaller pieces: the controller's new size if that
//! actually helps, otherwise halves. A single record that is still too big
//! becomes a failed record, because no amount of splitting will fix it.
//!
//! Anything else the indexer gives up on stops this worker, but only after the
//! records already refused by earlier chunks have been exported. Refused
//! records are exported and counted, never raised.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{WorkItem, Worker};
use crate::common::{BulkResult, FailedRecord, RunSummary, SourcedRecord};
use crate::error::IndexError;
use crate::failures::FailureSink;
use crate::indexer::BulkIndexer;

/// 🏷️ `error_type` of a record that is too large to ever be accepted.
const PAYLOAD_TOO_LARGE: &str = "payload_too_large";

#[derive(Debug)]
pub(in crate::supervisors) struct SinkWorker {
    rx: Receiver<WorkItem>,
    indexer: BulkIndexer,
    failures: Arc<dyn FailureSink>,
    index_name: String,
    report: RunSummary,
}

/// ✂️ Split `records` into runs of at most `size`, keeping order.
fn slice(records: Vec<SourcedRecord>, size: usize) -> VecDeque<Vec<SourcedRecord>> {
    let size = size.max(1);
    let mut slices = VecDeque::new();
    let mut rest = records;
    while rest.len() > size {
        let tail = rest.split_off(size);
        slices.push_back(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        slices.push_back(rest);
    }
    slices
}

impl SinkWorker {
    pub(in crate::supervisors) fn new(
        rx: Receiver<WorkItem>,
        indexer: BulkIndexer,
        failures: Arc<dyn FailureSink>,
        index_name: String,
    ) -> Self {
        Self {
            rx,
            indexer,
            failures,
            index_name,
            report: RunSummary::default(),
        }
    }

    async fn handle(&mut self, item: WorkItem) -> Result<()> {
        let mut pending = slice(item.batch.items, self.indexer.batch_size().current());
        let mut outcome = BulkResult::default();
        let mut gave_up = None;
        while let Some(chunk) = pending.pop_front() {
            self.report.batches_submitted += 1;
            match self.indexer.submit(&chunk, &self.index_name).await {
                Ok(result) => outcome.absorb(result),
                Err(IndexError::Oversize { new_batch_size, .. }) => {
                    self.report.oversize_events += 1;
                    if chunk.len() == 1 {
                        warn!(origin = %item.origin, "🧱 a single record is too large for the engine, giving up on it");
                        outcome.failed.extend(chunk.into_iter().map(|sourced| FailedRecord {
                            record: sourced.record,
                            index_name: self.index_name.clone(),
                            error_type: PAYLOAD_TOO_LARGE.to_string(),
                            error_reason: "record exceeds the engine's request size limit on its own".to_string(),
                        }));
                        continue;
                    }
                    let next = if new_batch_size < chunk.len() {
                        new_batch_size
                    } else {
                        chunk.len().div_ceil(2)
                    };
                    debug!(origin = %item.origin, from = chunk.len(), to = next, "✂️ re-chunking after 413");
                    for piece in slice(chunk, next).into_iter().rev() {
                        pending.push_front(piece);
                    }
                }
                Err(err) => {
                    gave_up = Some(err);
                    break;
                }
            }
        }

        self.report.records_indexed += outcome.succeeded_count() as u64;
        self.report.records_failed += outcome.failed.len() as u64;
        let exported = self
            .failures
            .export(&item.origin, &outcome.failed)
            .await
            .with_context(|| format!("💀 Failed to export refused records from '{}'", item.origin));
        match gave_up {
            Some(err) => {
                if let Err(export_err) = exported {
                    warn!("{export_err:#}");
                }
                Err(err).with_context(|| {
                    format!("💀 Bulk indexing into '{}' failed for input '{}'", self.index_name, item.origin)
                })
            }
            None => exported.map(|_| ()),
        }
    }
}

impl Worker for SinkWorker {
    fn start(mut self) -> JoinHandle<Result<RunSummary>> {
        tokio::spawn(async move {
            debug!("📥 SinkWorker started draining channel...");
            while let Ok(item) = self.rx.recv().await {
                debug!(origin = %item.origin, records = item.batch.len(), "🪣 SinkWorker received batch");
                self.handle(item).await?;
            }
            debug!("🏁 SinkWorker: channel closed and drained. Shutting down.");
            Ok(self.report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::batcher::BatchSizeController;
    use crate::common::{Batch, Record};
    use crate::engine::{EngineClient, EngineConfig};
    use crate::retry::tests::instant_controller;
    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn records(n: usize) -> Vec<SourcedRecord> {
        let plain: Vec<Record> = (0..n)
            .map(|i| json!({ "i": i }).as_object().cloned().unwrap_or_default())
            .collect();
        SourcedRecord::from_lines("app.log", plain)
    }

    /// 🗃️ Keeps whatever it is asked to export, in memory.
    #[derive(Debug, Default)]
    struct KeepingSink {
        kept: Mutex<Vec<FailedRecord>>,
    }

    #[async_trait]
    impl FailureSink for KeepingSink {
        async fn export(&self, _key: &str, failed: &[FailedRecord]) -> Result<Option<PathBuf>> {
            self.kept.lock().expect("kept records").extend(failed.iter().cloned());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn the_one_where_a_dying_batch_still_files_its_refusals() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                json!({ "items": [{ "index": {
                    "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "bad i" }
                } }] })
                .to_string(),
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = EngineClient::new(EngineConfig {
            url: server.uri(),
            ..EngineConfig::default()
        })?;
        let indexer = BulkIndexer::new(
            Arc::new(engine),
            instant_controller(1),
            Arc::new(BatchSizeController::new(1)),
            false,
        );
        let sink = Arc::new(KeepingSink::default());
        let (_tx, rx) = async_channel::bounded(1);
        let mut worker = SinkWorker::new(rx, indexer, sink.clone(), "logs".to_string());

        let items = records(2);
        let outcome = worker
            .handle(WorkItem {
                origin: "app.log".to_string(),
                batch: Batch {
                    key: "all".to_string(),
                    total: items.len(),
                    items,
                },
            })
            .await;

        assert!(outcome.is_err());
        let kept = sink.kept.lock().expect("kept records");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record["i"], 0);
        assert_eq!(kept[0].error_type, "mapper_parsing_exception");
        assert_eq!(worker.report.records_failed, 1);
        Ok(())
    }

    #[test]
    fn the_one_where_slices_keep_their_order() {
        let slices = slice(records(5), 2);
        let sizes: Vec<usize> = slices.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(slices[2][0].record["i"], 4);
        assert_eq!(slice(records(3), 0).len(), 3);
        assert!(slice(Vec::new(), 10).is_empty());
    }
}
