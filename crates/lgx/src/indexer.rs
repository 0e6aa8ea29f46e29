//! 📦 BulkIndexer: one batch in, a verdict for every record out.
//!
//! 🎬 *[two thousand records board the bulk request. one thousand nine hundred
//! and ninety-seven get off at the index. three have some explaining to do.]*
//!
//! The body is the classic action/document NDJSON pairing, in input order. Each
//! action line carries a deterministic `_id`: blake3 of the index name and the
//! record's source position (input, line, ordinal). A redelivered batch
//! overwrites instead of duplicating, two identical lines stay two documents,
//! and the response items can be matched back to records by id instead of by trust.
//!
//! Status handling on the request as a whole:
//! - `< 300`: read the per-item verdicts
//! - `413`: shrink the shared batch size and hand back `Oversize`, no retry
//! - anything else: retry under the bulk policy, then give up on the whole batch

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::batcher::BatchSizeController;
use crate::common::{BulkResult, FailedRecord, Record, SourcePosition, SourcedRecord};
use crate::engine::{EngineClient, EngineResponse};
use crate::error::IndexError;
use crate::retry::RetryController;

const OPERATION: &str = "bulk";

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// 🪪 Deterministic document id: same index + same source position = same id, every time.
pub fn document_id(index_name: &str, position: &SourcePosition) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(index_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(position.origin.as_bytes());
    hasher.update(b"\n");
    hasher.update(&position.line.to_le_bytes());
    hasher.update(&position.ordinal.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// 📝 Render the NDJSON body: one action line, one document line, per record.
pub fn render_bulk<'a>(records: impl IntoIterator<Item = &'a Record>, ids: &[Option<String>]) -> String {
    let mut body = String::new();
    for (position, record) in records.into_iter().enumerate() {
        let action = match ids.get(position).and_then(Option::as_ref) {
            Some(id) => json!({ "index": { "_id": id } }),
            None => json!({ "index": {} }),
        };
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&Value::Object(record.clone()).to_string());
        body.push('\n');
    }
    body
}

/// 📦 Submits batches to `{index}/_bulk`.
#[derive(Debug, Clone)]
pub struct BulkIndexer {
    engine: Arc<EngineClient>,
    retry: RetryController,
    batch_size: Arc<BatchSizeController>,
    document_ids: bool,
}

impl BulkIndexer {
    pub fn new(
        engine: Arc<EngineClient>,
        retry: RetryController,
        batch_size: Arc<BatchSizeController>,
        document_ids: bool,
    ) -> Self {
        Self {
            engine,
            retry,
            batch_size,
            document_ids,
        }
    }

    pub fn batch_size(&self) -> &BatchSizeController {
        &self.batch_size
    }

    /// 🚀 Submit one batch. Every record comes back in exactly one of
    /// `succeeded` / `failed`, or the whole call errors.
    pub async fn submit(&self, batch: &[SourcedRecord], index_name: &str) -> Result<BulkResult, IndexError> {
        if batch.is_empty() {
            return Ok(BulkResult::default());
        }
        let ids: Vec<Option<String>> = batch
            .iter()
            .map(|sourced| self.document_ids.then(|| document_id(index_name, &sourced.position)))
            .collect();
        let body = render_bulk(batch.iter().map(|sourced| &sourced.record), &ids);
        let url = self.engine.url(&format!("{index_name}/_bulk"));
        debug!(index = %index_name, records = batch.len(), bytes = body.len(), "📡 submitting bulk request");

        let response = self
            .retry
            .run(OPERATION, None, || {
                let request = self.engine.ndjson_request(&url, body.clone());
                async move {
                    let response = self.engine.execute(OPERATION, request).await?;
                    self.judge(response, index_name)
                }
            })
            .await?;

        let parsed: BulkResponse = response.json(OPERATION)?;
        let result = self.correlate(index_name, batch, &ids, parsed.items)?;
        debug!(
            index = %index_name,
            succeeded = result.succeeded_count(),
            failed = result.failed.len(),
            "✅ bulk request settled"
        );
        Ok(result)
    }

    fn judge(&self, response: EngineResponse, index_name: &str) -> Result<EngineResponse, IndexError> {
        match response.status {
            status if status < 300 => Ok(response),
            413 => Err(IndexError::Oversize {
                index: index_name.to_string(),
                new_batch_size: self.batch_size.shrink(),
            }),
            status => Err(IndexError::from_status(OPERATION, status, response.body)),
        }
    }

    fn correlate(
        &self,
        index_name: &str,
        batch: &[SourcedRecord],
        ids: &[Option<String>],
        items: Vec<HashMap<String, BulkItem>>,
    ) -> Result<BulkResult, IndexError> {
        let mismatch = |detail: String| IndexError::CorrelationMismatch {
            index: index_name.to_string(),
            detail,
        };
        if items.len() != batch.len() {
            return Err(mismatch(format!("{} items for {} records", items.len(), batch.len())));
        }
        // 📬 each item is {"index": {...}} (or "create"), we only want the inside
        let items: Vec<BulkItem> = items
            .into_iter()
            .filter_map(|item| item.into_values().next())
            .collect();
        if items.len() != batch.len() {
            return Err(mismatch("an item arrived without an action body".to_string()));
        }

        let verdicts: Vec<&BulkItem> = if self.document_ids {
            let by_id: HashMap<&str, &BulkItem> = items
                .iter()
                .filter_map(|item| item.id.as_deref().map(|id| (id, item)))
                .collect();
            if by_id.len() != items.len() {
                return Err(mismatch("response items without a unique _id".to_string()));
            }
            ids.iter()
                .map(|id| {
                    let id = id.as_deref().unwrap_or_default();
                    by_id
                        .get(id)
                        .copied()
                        .ok_or_else(|| mismatch(format!("no item for _id {id}")))
                })
                .collect::<Result<_, _>>()?
        } else {
            items.iter().collect()
        };

        let mut result = BulkResult::default();
        for (sourced, item) in batch.iter().zip(verdicts) {
            let record = &sourced.record;
            if item.status < 300 {
                result.succeeded.push(record.clone());
                continue;
            }
            let (error_type, error_reason) = match &item.error {
                Some(error) => (
                    error.error_type.clone().unwrap_or_else(|| format!("status_{}", item.status)),
                    error.reason.clone().unwrap_or_default(),
                ),
                None => (format!("status_{}", item.status), String::new()),
            };
            debug!(index = %index_name, status = item.status, "🚫 record rejected: {error_type}: {error_reason}");
            result.failed.push(FailedRecord {
                record: record.clone(),
                index_name: index_name.to_string(),
                error_type,
                error_reason,
            });
        }
        Ok(result)
    }
}
