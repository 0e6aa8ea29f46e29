//! 🚫 Failed-record export: the records the engine refused, written somewhere a human can look.
//!
//! Layout under the configured root:
//!
//! ```text
//!   error/<source-kind>/index-prefix=<prefix>/date=<yyyy-MM-dd>/<key>.<csv|json>
//! ```
//!
//! JSON-native formats go out as JSON lines (they were JSON to begin with).
//! Everything else goes out as CSV with a header row. Each record carries
//! `index_name`, `error_type` and `error_reason` next to its own fields.
//! Exports for the same key on the same day append to the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::common::{FailedRecord, Record};

/// ⚙️ `[failures]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FailureConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("failed")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    JsonLines,
    Csv,
}

impl ExportFormat {
    pub fn for_json_native(json_native: bool) -> Self {
        if json_native { Self::JsonLines } else { Self::Csv }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::JsonLines => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// 🚫 Somewhere failed records go to be looked at later.
#[async_trait]
pub trait FailureSink: std::fmt::Debug + Send + Sync {
    /// Write `failed` under `key`. Returns where they went, or `None` if there was nothing to write.
    async fn export(&self, key: &str, failed: &[FailedRecord]) -> Result<Option<PathBuf>>;
}

/// 📁 Local directory tree in the export layout.
#[derive(Debug, Clone)]
pub struct FileFailureSink {
    root: PathBuf,
    source_kind: String,
    index_prefix: String,
    format: ExportFormat,
    /// 🔒 sink workers share one sink; the header check and the append must not interleave
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileFailureSink {
    pub fn new(root: impl Into<PathBuf>, source_kind: &str, index_prefix: &str, format: ExportFormat) -> Self {
        Self {
            root: root.into(),
            source_kind: source_kind.to_string(),
            index_prefix: index_prefix.to_string(),
            format,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// 🧭 Where records for `key` exported on `date` live.
    pub fn object_path(&self, key: &str, date: NaiveDate) -> PathBuf {
        let file_name = format!("{}.{}", sanitize_key(key), self.format.extension());
        self.root
            .join("error")
            .join(&self.source_kind)
            .join(format!("index-prefix={}", self.index_prefix))
            .join(format!("date={}", date.format("%Y-%m-%d")))
            .join(file_name)
    }
}

/// 🧱 How many `-N` siblings a CSV export may spill into before giving up.
const MAX_CSV_SPILLS: usize = 64;

/// 📎 `dir/name.csv` → `dir/name-N.csv`.
fn spill_path(base: &Path, n: usize) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("batch");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{n}.{ext}"),
        None => format!("{stem}-{n}"),
    };
    base.with_file_name(name)
}

/// 🧽 Keys may be whole object paths; the export wants one file name.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .trim_matches('/')
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    let cleaned = cleaned.strip_suffix(".gz").unwrap_or(&cleaned).to_string();
    if cleaned.is_empty() { "batch".to_string() } else { cleaned }
}

fn csv_cell(value: Option<&Value>) -> String {
    let raw = match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    };
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

fn csv_row(cells: impl IntoIterator<Item = String>) -> String {
    let mut row = cells.into_iter().collect::<Vec<_>>().join(",");
    row.push('\n');
    row
}

/// 📋 Column order: every field in order of first appearance.
fn union_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// 📋 Header of an existing CSV export. Field names never need quoting, but strip them if they have it.
async fn existing_header(path: &Path) -> Result<Option<Vec<String>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text.lines().next().map(|line| {
            line.split(',')
                .map(|cell| cell.trim_matches('"').to_string())
                .collect()
        })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("💀 Failed to read existing export '{}'", path.display())),
    }
}

/// 🗂️ First CSV file for this key whose header can hold every column in `columns`.
/// Returns the path and, when the file already exists, its header.
/// Appending under a narrower header would silently drop fields, so a batch
/// with new columns moves on to `name-1.csv`, `name-2.csv`, and so on.
async fn csv_target(base: &Path, columns: &[String]) -> Result<(PathBuf, Option<Vec<String>>)> {
    for n in 0..=MAX_CSV_SPILLS {
        let candidate = if n == 0 { base.to_path_buf() } else { spill_path(base, n) };
        match existing_header(&candidate).await? {
            None => return Ok((candidate, None)),
            Some(header) if columns.iter().all(|c| header.contains(c)) => return Ok((candidate, Some(header))),
            Some(header) => {
                let missing: Vec<&str> = columns
                    .iter()
                    .filter(|c| !header.contains(c))
                    .map(String::as_str)
                    .collect();
                warn!(
                    path = %candidate.display(),
                    missing = %missing.join(","),
                    "📋 existing export header lacks columns, trying the next file"
                );
            }
        }
    }
    anyhow::bail!(
        "💀 No CSV export file next to '{}' has a header for these columns, even after {MAX_CSV_SPILLS} spills",
        base.display()
    )
}

#[async_trait]
impl FailureSink for FileFailureSink {
    async fn export(&self, key: &str, failed: &[FailedRecord]) -> Result<Option<PathBuf>> {
        if failed.is_empty() {
            return Ok(None);
        }
        let base = self.object_path(key, Utc::now().date_naive());
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("💀 Failed to create export directory '{}'", parent.display()))?;
        }
        let records: Vec<Record> = failed.iter().map(FailedRecord::annotated).collect();
        let _guard = self.write_lock.lock().await;

        let mut body = String::new();
        let path = match self.format {
            ExportFormat::JsonLines => {
                for record in &records {
                    body.push_str(&Value::Object(record.clone()).to_string());
                    body.push('\n');
                }
                base
            }
            ExportFormat::Csv => {
                let wanted = union_columns(&records);
                let (path, header) = csv_target(&base, &wanted).await?;
                let columns = match header {
                    Some(columns) => columns,
                    None => {
                        body.push_str(&csv_row(wanted.iter().map(|c| csv_cell(Some(&Value::String(c.clone()))))));
                        wanted
                    }
                };
                for record in &records {
                    body.push_str(&csv_row(columns.iter().map(|c| csv_cell(record.get(c)))));
                }
                path
            }
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("💀 Failed to open export file '{}'", path.display()))?;
        file.write_all(body.as_bytes())
            .await
            .with_context(|| format!("💀 Failed to write failed records to '{}'", path.display()))?;
        file.flush().await.context("💀 Failed to flush the failure export")?;
        info!("🚫 exported {} failed record(s) to {}", failed.len(), path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failed(record: Value, reason: &str) -> FailedRecord {
        FailedRecord {
            record: record.as_object().cloned().unwrap_or_default(),
            index_name: "alb-logs".into(),
            error_type: "mapper_parsing_exception".into(),
            error_reason: reason.into(),
        }
    }

    #[test]
    fn the_one_where_the_path_follows_the_layout() {
        let sink = FileFailureSink::new("/out", "s3", "alb-logs", ExportFormat::Csv);
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).expect("valid date");
        assert_eq!(
            sink.object_path("AWSLogs/123/elb/file.log.gz", date),
            PathBuf::from("/out/error/s3/index-prefix=alb-logs/date=2024-03-09/AWSLogs_123_elb_file.log.csv")
        );
        assert_eq!(sink.object_path("", date).file_name().and_then(|n| n.to_str()), Some("batch.csv"));
    }

    #[tokio::test]
    async fn the_one_where_csv_gets_one_header_and_honest_quoting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = FileFailureSink::new(dir.path(), "s3", "alb-logs", ExportFormat::Csv);
        let first = sink
            .export("input.log", &[failed(json!({"client_ip": "10.0.0.1", "request": "GET /a,b"}), "bad \"bytes\"")])
            .await?
            .expect("something was written");
        let second = sink
            .export("input.log", &[failed(json!({"client_ip": "10.0.0.2", "request": "GET /"}), "nope")])
            .await?
            .expect("something was written");
        assert_eq!(first, second);

        let text = std::fs::read_to_string(&first)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "client_ip,request,index_name,error_type,error_reason");
        assert_eq!(
            lines[1],
            r#"10.0.0.1,"GET /a,b",alb-logs,mapper_parsing_exception,"bad ""bytes""""#
        );
        assert_eq!(lines[2], "10.0.0.2,GET /,alb-logs,mapper_parsing_exception,nope");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_new_columns_get_a_file_of_their_own() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = FileFailureSink::new(dir.path(), "s3", "rds", ExportFormat::Csv);
        let first = sink
            .export("mysql.log", &[failed(json!({"log-detail": "slow query", "rds_log_type": "slowquery"}), "a")])
            .await?
            .expect("something was written");
        let second = sink
            .export(
                "mysql.log",
                &[failed(json!({"err_level": "Warning", "err_detail": "disk full", "rds_log_type": "error"}), "b")],
            )
            .await?
            .expect("something was written");
        assert_ne!(first, second);
        assert_eq!(second.file_name().and_then(|n| n.to_str()), Some("mysql.log-1.csv"));

        let spilled = std::fs::read_to_string(&second)?;
        let lines: Vec<&str> = spilled.lines().collect();
        assert_eq!(lines[0], "err_level,err_detail,rds_log_type,index_name,error_type,error_reason");
        assert!(lines[1].contains("disk full"));
        assert!(!std::fs::read_to_string(&first)?.contains("disk full"));

        // 🔁 a later batch that fits the original header goes back there
        let third = sink
            .export("mysql.log", &[failed(json!({"log-detail": "lock wait"}), "c")])
            .await?
            .expect("something was written");
        assert_eq!(third, first);
        Ok(())
    }

    #[test]
    fn the_one_where_spills_keep_the_extension() {
        assert_eq!(
            spill_path(Path::new("/x/date=2024-01-01/app.csv"), 3),
            PathBuf::from("/x/date=2024-01-01/app-3.csv")
        );
    }

    #[tokio::test]
    async fn the_one_where_json_native_records_stay_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = FileFailureSink::new(dir.path(), "s3", "waf", ExportFormat::JsonLines);
        let path = sink
            .export("waf-batch", &[failed(json!({"action": "BLOCK", "httpRequest": {"uri": "/"}}), "r")])
            .await?
            .expect("something was written");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
        let line = std::fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(line.trim())?;
        assert_eq!(parsed["httpRequest"]["uri"], "/");
        assert_eq!(parsed["error_type"], "mapper_parsing_exception");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nothing_failed_and_nothing_is_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = FileFailureSink::new(dir.path(), "s3", "x", ExportFormat::Csv);
        assert!(sink.export("k", &[]).await?.is_none());
        assert!(!dir.path().join("error").exists());
        Ok(())
    }
}
