//! 🎬 *[a directory of gzipped logs. the source worker cracks its knuckles.]*
//!
//! 📖 Reads every configured input in order, splits it into lines, decodes
//! them, and batches the records by the configured threshold. Each file gets
//! its own decoder (multiline state must not leak across files) and its own
//! batcher, so every batch carries exactly one origin. Every record is stamped
//! with the line it was emitted at and its ordinal on that line, which is what
//! its document id is made of.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Sender;
use flate2::read::MultiGzDecoder;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{WorkItem, Worker};
use crate::app_config::PipelineConfig;
use crate::batcher::{RecordBatcher, Threshold};
use crate::common::{Batch, Record, RunSummary, SourcePosition, SourcedRecord, record_size};
use crate::parsers::RecordDecoder;
use crate::progress::ProgressMetrics;

#[derive(Debug)]
pub(in crate::supervisors) struct SourceWorker {
    tx: Sender<WorkItem>,
    pipeline: PipelineConfig,
    threshold: Threshold,
}

impl SourceWorker {
    pub(in crate::supervisors) fn new(tx: Sender<WorkItem>, pipeline: PipelineConfig, threshold: Threshold) -> Self {
        Self {
            tx,
            pipeline,
            threshold,
        }
    }

    /// 📂 Whole file as bytes, inflated if it ends in `.gz`.
    async fn read_input(path: &Path) -> Result<Vec<u8>> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("💀 Failed to read input '{}'. Does it exist? Can we read it?", path.display()))?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            let display = path.display().to_string();
            return tokio::task::spawn_blocking(move || {
                let mut inflated = Vec::new();
                MultiGzDecoder::new(raw.as_slice())
                    .read_to_end(&mut inflated)
                    .with_context(|| format!("💀 '{display}' claims to be gzip but does not inflate"))?;
                Ok(inflated)
            })
            .await
            .context("💀 Decompression task panicked")?;
        }
        Ok(raw)
    }

    async fn send(&self, origin: &str, batch: Batch<SourcedRecord>) -> Result<()> {
        debug!(origin, records = batch.len(), "📤 batch ready");
        self.tx
            .send(WorkItem {
                origin: origin.to_string(),
                batch,
            })
            .await
            .context("💀 Every sink worker has hung up. Check the log above for why the last one quit.")
    }

    async fn process_file(&self, path: &Path, progress: &mut ProgressMetrics) -> Result<RunSummary> {
        let bytes = Self::read_input(path).await?;
        let origin = path.display().to_string();
        let shared_origin: Arc<str> = Arc::from(origin.as_str());
        let mut decoder = RecordDecoder::from_config(&self.pipeline)?;
        let mut batcher = RecordBatcher::new(self.threshold);
        let mut line_number = 0u64;

        let mut start = 0;
        let mut line_ends = memchr::memchr_iter(b'\n', &bytes).collect::<Vec<_>>();
        if start < bytes.len() && line_ends.last().is_none_or(|&end| end + 1 < bytes.len()) {
            // 🧵 the last line had no newline, it still counts
            line_ends.push(bytes.len());
        }
        for end in line_ends {
            let line = String::from_utf8_lossy(&bytes[start..end]);
            start = end + 1;
            line_number += 1;
            for sourced in stamp(&shared_origin, line_number, decoder.decode_line(&line)) {
                let size = record_size(&sourced.record);
                if let Some(batch) = batcher.push(None, sourced, size) {
                    self.send(&origin, batch).await?;
                }
            }
        }
        // 🧵 whatever the assembler was still holding belongs just past the last line
        for sourced in stamp(&shared_origin, line_number + 1, decoder.finish()) {
            let size = record_size(&sourced.record);
            if let Some(batch) = batcher.push(None, sourced, size) {
                self.send(&origin, batch).await?;
            }
        }
        for batch in batcher.finish() {
            self.send(&origin, batch).await?;
        }

        let stats = decoder.stats();
        progress.update(bytes.len() as u64, stats.lines_read, stats.records_parsed);
        info!(
            origin,
            lines = stats.lines_read,
            records = stats.records_parsed,
            skipped = stats.lines_skipped,
            "📖 input consumed"
        );
        Ok(RunSummary {
            lines_read: stats.lines_read,
            records_parsed: stats.records_parsed,
            lines_skipped: stats.lines_skipped,
            ..RunSummary::default()
        })
    }
}

/// 📍 Give each record emitted at `line` its position.
fn stamp(origin: &Arc<str>, line: u64, records: Vec<Record>) -> impl Iterator<Item = SourcedRecord> + '_ {
    records
        .into_iter()
        .zip(0u32..)
        .map(move |(record, ordinal)| SourcedRecord::new(record, SourcePosition::new(origin.clone(), line, ordinal)))
}

impl Worker for SourceWorker {
    fn start(self) -> JoinHandle<Result<RunSummary>> {
        tokio::spawn(async move {
            let mut total_size = 0;
            for path in &self.pipeline.inputs {
                total_size += tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            }
            let mut progress = ProgressMetrics::new(self.pipeline.log_type.to_string(), total_size);
            let mut summary = RunSummary::default();
            for path in &self.pipeline.inputs {
                let report = self.process_file(path, &mut progress).await?;
                summary.absorb(&report);
            }
            progress.finish();
            debug!("🏁 SourceWorker: inputs exhausted, closing the channel");
            self.tx.close();
            Ok(summary)
        })
    }
}
