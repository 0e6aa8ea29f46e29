//! 🦆 JSON-native formats: the line is already a document, we just tidy it up.
//!
//! - `json`: any JSON object per line, with the configurable time knobs.
//! - `waf`: web ACL logs, epoch-millis `timestamp`, plus a readable `webaclName`.
//! - `cloudtrail`: a `{"Records":[...]}` file explodes into one record per event.

use serde_json::Value;

use super::RecordParser;
use super::timestamp::TimeRule;
use crate::common::Record;

fn parse_object(line: &str) -> Option<Record> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// 🦆 Generic JSON-lines parser.
#[derive(Debug, Clone)]
pub struct JsonParser {
    time: TimeRule,
}

impl JsonParser {
    pub fn new(time: TimeRule) -> Self {
        Self { time }
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, line: &str) -> Record {
        let Some(mut record) = parse_object(line) else {
            return Record::new();
        };
        self.time.apply(&mut record);
        record
    }
}

/// 🛡️ Web ACL logs.
#[derive(Debug, Clone)]
pub struct WafParser {
    time: TimeRule,
}

impl Default for WafParser {
    fn default() -> Self {
        Self {
            time: TimeRule::epoch_millis("timestamp"),
        }
    }
}

impl RecordParser for WafParser {
    fn parse(&self, line: &str) -> Record {
        let Some(mut record) = parse_object(line) else {
            return Record::new();
        };
        // 🏷️ arn:aws:wafv2:<region>:<acct>:regional/webacl/<name>/<id>
        let acl_name = record
            .get("webaclId")
            .and_then(Value::as_str)
            .and_then(|arn| arn.split('/').nth(2))
            .map(str::to_string);
        if let Some(name) = acl_name {
            record.insert("webaclName".into(), Value::String(name));
        }
        let host = record
            .get("httpRequest")
            .and_then(|req| req.get("headers"))
            .and_then(Value::as_array)
            .and_then(|headers| {
                headers.iter().find_map(|header| {
                    let name = header.get("name")?.as_str()?;
                    name.eq_ignore_ascii_case("host")
                        .then(|| header.get("value").and_then(Value::as_str))
                        .flatten()
                })
            })
            .map(str::to_string);
        if let Some(host) = host {
            record.insert("host".into(), Value::String(host));
        }
        self.time.apply(&mut record);
        record
    }
}

/// 🕵️ CloudTrail, delivered either as whole files (`Records` array) or one event per line.
#[derive(Debug, Clone)]
pub struct CloudTrailParser {
    time: TimeRule,
}

impl Default for CloudTrailParser {
    fn default() -> Self {
        Self {
            time: TimeRule::rfc3339("eventTime"),
        }
    }
}

impl RecordParser for CloudTrailParser {
    fn parse(&self, line: &str) -> Record {
        self.parse_all(line, None).into_iter().next().unwrap_or_default()
    }

    fn parse_all(&self, line: &str, _source_group: Option<&str>) -> Vec<Record> {
        let Some(mut document) = parse_object(line) else {
            return Vec::new();
        };
        let events = match document.remove("Records") {
            Some(Value::Array(events)) => events
                .into_iter()
                .filter_map(|event| match event {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Some(_) => Vec::new(),
            None => vec![document],
        };
        events
            .into_iter()
            .map(|mut event| {
                self.time.apply(&mut event);
                event
            })
            .collect()
    }
}
