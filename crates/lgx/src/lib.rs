//! 🪵 lgx: turns log text into search-engine documents and keeps the index tidy afterwards.
//!
//! 🎬 *[a load balancer writes a line. a CDN writes ten thousand. a database writes
//! a slow query that spans six lines and somehow still deserves respect.]*
//!
//! 🏗️ The crate is laid out leaves-first:
//! parsers → batcher → indexer (via retry) → {indexed, failed}, with the lifecycle
//! compiler and the bootstrapper running once up front so the index exists before
//! the first bulk request shows up uninvited.
//!
//! 🦆 the duck is load-bearing. do not remove the duck.

pub mod app_config;
pub mod batcher;
pub mod bootstrap;
pub mod common;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod failures;
pub mod indexer;
pub mod lifecycle;
pub mod parsers;
pub mod partition;
pub mod progress;
pub mod retry;
pub mod state;
pub mod supervisors;
pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::app_config::AppConfig;
use crate::bootstrap::IndexBootstrapper;
use crate::common::{Record, RunSummary};
use crate::engine::EngineClient;
use crate::parsers::RecordDecoder;
use crate::retry::RetryController;
use crate::state::PipelineState;
use crate::supervisors::Supervisor;
use crate::tasks::{ObjectDescriptor, TaskMessage, TaskScanner};

/// 🚀 Run the whole pipeline: read the configured inputs, parse, batch, bulk index,
/// export failures, and hand back the tally.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    info!(
        "🪵 lgx run starting: log_type={}, index_prefix={}",
        app_config.pipeline.log_type, app_config.pipeline.index_prefix
    );
    let supervisor = Supervisor::new(app_config).context("💀 Failed to assemble the pipeline")?;
    supervisor.run().await.context("💀 Pipeline run failed")
}

/// 🏗️ Run only the one-time setup sequence (roles, ISM, template, saved views, alias).
pub async fn bootstrap(app_config: AppConfig) -> Result<PipelineState> {
    let engine = Arc::new(
        EngineClient::new(app_config.engine.clone())
            .context("💀 Failed to build the engine client for bootstrap")?,
    );
    let store = state::store_from_config(&app_config.state, app_config.batching.initial_batch_size);
    let retry = RetryController::tokio(app_config.retry.setup.to_policy());
    let bootstrapper = IndexBootstrapper::new(engine, retry, store, &app_config);
    bootstrapper.run().await.context("💀 Bootstrap sequence failed")
}

/// 📜 Render the ISM policy document the bootstrapper would PUT, without talking to anybody.
pub fn render_policy(app_config: &AppConfig) -> serde_json::Value {
    let states = lifecycle::compile(&app_config.lifecycle.thresholds());
    lifecycle::policy_document(&states, &app_config.lifecycle.policy_meta(&app_config.pipeline.index_prefix))
}

/// 🔬 Decode raw text with the configured format, envelope mode and enrichments.
/// Handy for "why did my line get skipped?" investigations at 2am.
pub fn parse_text(app_config: &AppConfig, text: &str) -> Result<Vec<Record>> {
    let mut decoder = RecordDecoder::from_config(&app_config.pipeline)
        .context("💀 Failed to build the record decoder")?;
    let mut records = Vec::new();
    for line in text.lines() {
        records.extend(decoder.decode_line(line));
    }
    records.extend(decoder.finish());
    Ok(records)
}

/// 🗂️ Rewrite one object path with the configured partition policies.
pub fn rewrite_path(app_config: &AppConfig, path: &str) -> String {
    partition::rewrite(path, &app_config.partitions)
}

/// 📨 Group object descriptors into task messages using the batching threshold.
pub fn plan_tasks(app_config: &AppConfig, descriptors: Vec<ObjectDescriptor>) -> Vec<TaskMessage> {
    TaskScanner::new(
        app_config.tasks.clone(),
        app_config.batching.threshold,
        app_config.batching.merge_by_destination,
        app_config.partitions.clone(),
    )
    .scan(descriptors)
}
