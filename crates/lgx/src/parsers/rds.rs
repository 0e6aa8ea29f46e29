//! 🐬 RDS MySQL: four record shapes sharing one stream.
//!
//! The log group tells us which one we are looking at
//! (`/aws/rds/instance/<db>/error`, `/slowquery`, `/general`, `/audit`); we never
//! guess from the line itself. When the sub-pattern for that category does not
//! match, the line is still kept, just as `log-detail` text.

use std::fmt;

use anyhow::Result;
use regex::Regex;
use serde_json::Value;

use super::timestamp::TimeRule;
use super::{RecordParser, normalize_numeric};
use crate::common::Record;

/// 🏷️ The fallback field for lines no sub-pattern could make sense of.
pub const LOG_DETAIL_FIELD: &str = "log-detail";

/// 🏷️ Which of the four shapes a record came from.
pub const CATEGORY_FIELD: &str = "rds_log_type";

/// 🧵 A new multiline event starts at a slow-query header, an ISO timestamp, or an audit timestamp.
pub const RDS_EVENT_START: &str = r"^(?:# Time: |\d{4}-\d{2}-\d{2}T\d{2}:\d{2}|\d{8} \d{2}:\d{2}:\d{2},)";

const ERROR_PATTERN: &str = r"(?s)^(?P<time>\d{4}-\d{2}-\d{2}T\S+)\s+(?P<thread_id>\d+)\s+\[(?P<err_level>[^\]]+)\]\s+(?:\[(?P<err_code>[^\]]*)\]\s+\[(?P<err_subsystem>[^\]]*)\]\s+)?(?P<err_detail>.*?)\s*$";

const SLOW_QUERY_PATTERN: &str = r"(?s)^# Time: (?P<time>\S+)\s+# User@Host: (?P<db_user>[^\[]*)\[(?P<db_user_name>[^\]]*)\] @\s+(?P<db_host>\S*)\s*\[(?P<db_ip>[^\]]*)\]\s+Id:\s+(?P<thread_id>\d+)\s+# Query_time: (?P<query_time>[\d.]+)\s+Lock_time: (?P<lock_time>[\d.]+)\s+Rows_sent: (?P<rows_sent>\d+)\s+Rows_examined: (?P<rows_examined>\d+)\s+(?:use (?P<database>[^;]+);\s+)?SET timestamp=(?P<timestamp>\d+);\s*(?P<query>.*?)\s*$";

const GENERAL_PATTERN: &str = r"(?s)^(?P<time>\d{4}-\d{2}-\d{2}T\S+)\s+(?P<thread_id>\d+)\s+(?P<command>[A-Za-z ]+?)\t(?P<argument>.*?)\s*$";

const AUDIT_PATTERN: &str = r"(?s)^(?P<time>\d{8} \d{2}:\d{2}:\d{2}),(?P<server_host>[^,]*),(?P<username>[^,]*),(?P<host>[^,]*),(?P<connection_id>[^,]*),(?P<query_id>[^,]*),(?P<operation>[^,]*),(?P<database>[^,]*),(?P<object>.*),(?P<retcode>[^,]*?)\s*$";

const NUMERIC: &[&str] = &[
    "thread_id",
    "query_time",
    "lock_time",
    "rows_sent",
    "rows_examined",
    "connection_id",
    "query_id",
    "retcode",
];

/// 🐬 The four categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdsCategory {
    Error,
    SlowQuery,
    General,
    Audit,
}

impl RdsCategory {
    /// 🏷️ From a log group (`/aws/rds/instance/db-1/slowquery`) or a bare category name.
    pub fn from_group(group: &str) -> Option<Self> {
        let tail = group
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(group)
            .to_ascii_lowercase();
        match tail.as_str() {
            "error" => Some(RdsCategory::Error),
            "slowquery" | "slow_query" => Some(RdsCategory::SlowQuery),
            "general" => Some(RdsCategory::General),
            "audit" => Some(RdsCategory::Audit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RdsCategory::Error => "error",
            RdsCategory::SlowQuery => "slowquery",
            RdsCategory::General => "general",
            RdsCategory::Audit => "audit",
        }
    }
}

impl fmt::Display for RdsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct SubPattern {
    regex: Regex,
    time: TimeRule,
}

impl SubPattern {
    fn new(pattern: &str, time: TimeRule) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            time,
        })
    }
}

/// 🐬 Multiplexing parser. `default_category` covers input with no log group attached.
#[derive(Debug, Clone)]
pub struct RdsParser {
    error: SubPattern,
    slow_query: SubPattern,
    general: SubPattern,
    audit: SubPattern,
    default_category: Option<RdsCategory>,
}

impl RdsParser {
    pub fn new(default_category: Option<&str>) -> Result<Self> {
        let default_category = match default_category {
            Some(name) => Some(RdsCategory::from_group(name).ok_or_else(|| {
                anyhow::anyhow!("💀 unknown rds category '{name}', expected error, slowquery, general or audit")
            })?),
            None => None,
        };
        Ok(Self {
            error: SubPattern::new(ERROR_PATTERN, TimeRule::rfc3339("time"))?,
            slow_query: SubPattern::new(SLOW_QUERY_PATTERN, TimeRule::epoch_seconds("timestamp"))?,
            general: SubPattern::new(GENERAL_PATTERN, TimeRule::rfc3339("time"))?,
            audit: SubPattern::new(AUDIT_PATTERN, TimeRule::format("time", "%Y%m%d %H:%M:%S"))?,
            default_category,
        })
    }

    fn sub_pattern(&self, category: RdsCategory) -> &SubPattern {
        match category {
            RdsCategory::Error => &self.error,
            RdsCategory::SlowQuery => &self.slow_query,
            RdsCategory::General => &self.general,
            RdsCategory::Audit => &self.audit,
        }
    }

    /// 🐬 Parse one event of a known (or unknown) category. Never empty for non-blank input.
    pub fn parse_category(&self, message: &str, category: Option<RdsCategory>) -> Record {
        let mut record = Record::new();
        let message = message.trim_end();
        if message.trim().is_empty() {
            return record;
        }
        let structured = category.and_then(|category| {
            let sub = self.sub_pattern(category);
            let captures = sub.regex.captures(message)?;
            let mut structured = Record::new();
            for field in sub.regex.capture_names().flatten() {
                let raw = captures.name(field).map(|m| m.as_str()).unwrap_or("-");
                let value = if NUMERIC.contains(&field) {
                    normalize_numeric(raw)
                } else {
                    raw.to_string()
                };
                structured.insert(field.to_string(), Value::String(value));
            }
            sub.time.apply(&mut structured);
            Some(structured)
        });
        match structured {
            Some(structured) => record = structured,
            None => {
                record.insert(LOG_DETAIL_FIELD.into(), Value::String(message.to_string()));
            }
        }
        record.insert(
            CATEGORY_FIELD.into(),
            Value::String(category.map(|c| c.as_str()).unwrap_or("unknown").to_string()),
        );
        record
    }
}

impl RecordParser for RdsParser {
    fn parse(&self, line: &str) -> Record {
        self.parse_category(line, self.default_category)
    }

    fn parse_all(&self, line: &str, source_group: Option<&str>) -> Vec<Record> {
        let category = source_group
            .and_then(RdsCategory::from_group)
            .or(self.default_category);
        let record = self.parse_category(line, category);
        if record.is_empty() { Vec::new() } else { vec![record] }
    }
}
