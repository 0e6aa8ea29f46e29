//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where log lines pile up by the million..."
//! 🎬 "One supervisor dared to index them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor wires the run together:
//!
//! ```text
//!   SourceWorker ──(async-channel, bounded)──► SinkWorker × sink_parallelism
//!    read files                                  chunk by adaptive batch size
//!    decode lines                                BulkIndexer::submit
//!    batch by threshold                          re-chunk on 413, export failures
//! ```
//!
//! The pipeline state is read once at the start and written once at the end.
//! In between, the adaptive batch size lives in memory, shared by every sink.
//!
//! 🔒 The workers stay private to this module. Nobody outside gets to start one.

mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::batcher::BatchSizeController;
use crate::bootstrap::IndexBootstrapper;
use crate::common::RunSummary;
use crate::engine::EngineClient;
use crate::failures::{ExportFormat, FailureSink, FileFailureSink};
use crate::indexer::BulkIndexer;
use crate::parsers::RecordDecoder;
use crate::retry::RetryController;
use crate::state::{self, StateStore};
use workers::{SinkWorker, SourceWorker, Worker};

/// ⚙️ `[runtime]` section: how wide the pipeline runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// 📬 batches allowed in flight between source and sinks
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 🧵 concurrent bulk submitters
    #[serde(default = "default_sink_parallelism", alias = "num_sink_workers")]
    pub sink_parallelism: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            sink_parallelism: default_sink_parallelism(),
        }
    }
}

fn default_queue_capacity() -> usize {
    8
}

fn default_sink_parallelism() -> usize {
    1
}

/// 📦 Owns the shared pieces of one run and hands them out to workers.
#[derive(Debug)]
pub struct Supervisor {
    app_config: AppConfig,
    engine: Arc<EngineClient>,
    store: Arc<dyn StateStore>,
    batch_size: Arc<BatchSizeController>,
}

impl Supervisor {
    /// 🏗️ Validate the config and build the shared pieces. Broken parser
    /// settings and unknown enrichments fail here, before any file is opened.
    pub fn new(app_config: AppConfig) -> Result<Self> {
        RecordDecoder::from_config(&app_config.pipeline)?;
        let engine = Arc::new(EngineClient::new(app_config.engine.clone())?);
        let store = state::store_from_config(&app_config.state, app_config.batching.initial_batch_size);
        let batch_size = Arc::new(BatchSizeController::new(app_config.batching.initial_batch_size));
        Ok(Self {
            app_config,
            engine,
            store,
            batch_size,
        })
    }

    fn failure_sink(&self) -> Arc<dyn FailureSink> {
        let pipeline = &self.app_config.pipeline;
        Arc::new(FileFailureSink::new(
            self.app_config.failures.directory.clone(),
            &pipeline.source_kind,
            &pipeline.index_name(),
            ExportFormat::for_json_native(pipeline.log_type.is_json_native()),
        ))
    }

    /// 🧵 Run source and sinks to completion and return the tally.
    pub async fn run(&self) -> Result<RunSummary> {
        let state = self
            .store
            .load()
            .await
            .context("💀 Failed to read the pipeline state at startup")?;
        self.batch_size.adopt_min(state.batch_size);
        info!(
            version = state.version,
            batch_size = self.batch_size.current(),
            "🗄️ pipeline state loaded"
        );

        if self.app_config.pipeline.bootstrap_on_run {
            let setup_retry = RetryController::tokio(self.app_config.retry.setup.to_policy());
            IndexBootstrapper::new(self.engine.clone(), setup_retry, self.store.clone(), &self.app_config)
                .run()
                .await
                .context("💀 Bootstrap before indexing failed")?;
        }

        let runtime = &self.app_config.runtime;
        let (tx, rx) = async_channel::bounded(runtime.queue_capacity.max(1));
        let indexer = BulkIndexer::new(
            self.engine.clone(),
            RetryController::tokio(self.app_config.retry.bulk.to_policy()),
            self.batch_size.clone(),
            self.app_config.pipeline.document_ids,
        );
        let failure_sink = self.failure_sink();
        let index_name = self.app_config.pipeline.index_name();

        let sink_handles: Vec<_> = (0..runtime.sink_parallelism.max(1))
            .map(|_| SinkWorker::new(rx.clone(), indexer.clone(), failure_sink.clone(), index_name.clone()).start())
            .collect();
        drop(rx);
        let source_handle = SourceWorker::new(
            tx,
            self.app_config.pipeline.clone(),
            self.app_config.batching.threshold,
        )
        .start();

        let mut summary = RunSummary::default();
        let source_outcome = source_handle.await.context("💀 Source worker panicked")?;
        let mut first_error = source_outcome.as_ref().err().map(|err| format!("{err:#}"));
        if let Ok(report) = &source_outcome {
            summary.absorb(report);
        }
        for handle in sink_handles {
            match handle.await.context("💀 Sink worker panicked")? {
                Ok(report) => summary.absorb(&report),
                Err(err) => {
                    warn!("💀 sink worker failed: {err:#}");
                    first_error.get_or_insert_with(|| format!("{err:#}"));
                }
            }
        }

        // 📉 whatever we learned about the engine's size limit survives the run, even a failed one
        summary.final_batch_size = self.batch_size.current();
        state::record_batch_size(self.store.as_ref(), summary.final_batch_size)
            .await
            .context("💀 Failed to persist the learned batch size")?;

        if let Some(err) = first_error {
            anyhow::bail!("💀 Pipeline run did not complete: {err}");
        }
        info!(
            indexed = summary.records_indexed,
            failed = summary.records_failed,
            skipped = summary.lines_skipped,
            "✅ run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::io::Write;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
    use wiremock::matchers::{method, path};

    /// 🪞 Answers a bulk request with a 201 for every document, echoing the `_id`s back.
    struct EchoBulk;

    impl Respond for EchoBulk {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body = String::from_utf8_lossy(&request.body);
            let items: Vec<Value> = body
                .lines()
                .step_by(2)
                .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                .map(|action| json!({ "index": { "_id": action["index"]["_id"], "status": 201 } }))
                .collect();
            ResponseTemplate::new(200).set_body_string(json!({ "errors": false, "items": items }).to_string())
        }
    }

    fn config(server: &MockServer, input: &std::path::Path, failed_dir: &std::path::Path) -> AppConfig {
        toml::from_str(&format!(
            r#"
            [engine]
            url = "{uri}"

            [pipeline]
            log_type = "json"
            index_prefix = "app"
            inputs = ["{input}"]

            [batching]
            threshold = {{ unit = "count", limit = 2 }}

            [failures]
            directory = "{failed}"
            "#,
            uri = server.uri(),
            input = input.display(),
            failed = failed_dir.display(),
        ))
        .expect("valid test config")
    }

    #[tokio::test]
    async fn the_one_where_a_whole_file_makes_it_into_the_index() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/_bulk"))
            .respond_with(EchoBulk)
            .expect(3)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("app.log");
        let mut file = std::fs::File::create(&input)?;
        for i in 0..5 {
            writeln!(file, r#"{{"seq":{i},"msg":"hello"}}"#)?;
        }
        writeln!(file, "this is not json")?;
        drop(file);

        let summary = Supervisor::new(config(&server, &input, &dir.path().join("failed")))?
            .run()
            .await?;
        assert_eq!(summary.lines_read, 6);
        assert_eq!(summary.records_parsed, 5);
        assert_eq!(summary.lines_skipped, 1);
        assert_eq!(summary.batches_submitted, 3);
        assert_eq!(summary.records_indexed, 5);
        assert_eq!(summary.records_failed, 0);
        assert_eq!(summary.final_batch_size, 10_000);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_413_splits_the_batch_and_the_lesson_sticks() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/_bulk"))
            .respond_with(ResponseTemplate::new(413))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/app/_bulk"))
            .respond_with(EchoBulk)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("app.log");
        std::fs::write(&input, "{\"a\":1}\n{\"a\":2}\n")?;
        let state_path = dir.path().join("state.json");

        let mut app_config = config(&server, &input, &dir.path().join("failed"));
        app_config.state.path = Some(state_path.clone());
        let summary = Supervisor::new(app_config)?.run().await?;

        assert_eq!(summary.oversize_events, 1);
        assert_eq!(summary.records_indexed, 2);
        assert_eq!(summary.final_batch_size, 8_000);
        let stored: crate::state::PipelineState = serde_json::from_slice(&std::fs::read(&state_path)?)?;
        assert_eq!(stored.batch_size, 8_000);
        Ok(())
    }

    #[test]
    fn the_one_where_an_unknown_enrichment_stops_the_show_early() {
        let mut app_config: AppConfig = toml::from_str(
            r#"
            [pipeline]
            log_type = "json"
            index_prefix = "app"
            enrichments = ["horoscope"]
            "#,
        )
        .expect("valid test config");
        assert!(Supervisor::new(app_config.clone()).is_err());
        app_config.pipeline.enrichments.clear();
        assert!(Supervisor::new(app_config).is_ok());
    }
}
