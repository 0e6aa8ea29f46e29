//! 🧩 Regex formats: one fixed pattern per format, named groups in declared order.
//!
//! 🎬 *[forty-seven capture groups walk into a load balancer log.]*
//!
//! The named capture groups ARE the declared field list, so "every declared
//! field is populated" holds by construction: a group that did not participate
//! (the optional tail of an older log version) is filled with the `-`
//! placeholder, and numeric placeholders become `0`.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use super::timestamp::TimeRule;
use super::{RecordParser, normalize_numeric};
use crate::common::Record;

/// ⚖️ Application load balancer access logs.
const ELB_PATTERN: &str = r#"^(?P<type>[^ ]*) (?P<time>[^ ]*) (?P<elb>[^ ]*) (?P<client_ip>[^ ]*):(?P<client_port>[0-9]*) (?P<target_ip>[^ ]*)[:-](?P<target_port>[0-9]*) (?P<request_processing_time>[-.0-9]*) (?P<target_processing_time>[-.0-9]*) (?P<response_processing_time>[-.0-9]*) (?P<elb_status_code>[-0-9]*) (?P<target_status_code>[-0-9]*) (?P<received_bytes>[-0-9]*) (?P<sent_bytes>[-0-9]*) "(?P<request_verb>[^ ]*) (?P<request_url>[^"]*) (?P<request_proto>- |[^ "]*)" "(?P<user_agent>[^"]*)" (?P<ssl_cipher>[A-Z0-9_-]+) (?P<ssl_protocol>[A-Za-z0-9.-]*) (?P<target_group_arn>[^ ]*) "(?P<trace_id>[^"]*)" "(?P<domain_name>[^"]*)" "(?P<chosen_cert_arn>[^"]*)" (?P<matched_rule_priority>[-.0-9]*) (?P<request_creation_time>[^ ]*) "(?P<actions_executed>[^"]*)" "(?P<redirect_url>[^"]*)" "(?P<error_reason>[^ ]*)" "(?P<target_port_list>[^"]*)" "(?P<target_status_code_list>[^"]*)"(?: "(?P<classification>[^ ]*)" "(?P<classification_reason>[^ ]*)")?"#;

const ELB_NUMERIC: &[&str] = &[
    "client_port",
    "target_port",
    "request_processing_time",
    "target_processing_time",
    "response_processing_time",
    "elb_status_code",
    "target_status_code",
    "received_bytes",
    "sent_bytes",
    "matched_rule_priority",
];

/// 🪣 S3 server access logs. Quoted fields keep their quotes in the pattern and lose them after.
const S3_ACCESS_PATTERN: &str = r#"^(?P<bucket_owner>[^ ]*) (?P<bucket>[^ ]*) \[(?P<time>[^\]]*)\] (?P<remote_ip>[^ ]*) (?P<requester>[^ ]*) (?P<request_id>[^ ]*) (?P<operation>[^ ]*) (?P<key>[^ ]*) (?P<request_uri>"[^"]*"|-) (?P<http_status>-|[0-9]*) (?P<error_code>[^ ]*) (?P<bytes_sent>[^ ]*) (?P<object_size>[^ ]*) (?P<total_time>[^ ]*) (?P<turn_around_time>[^ ]*) (?P<referrer>"[^"]*"|-) (?P<user_agent>"[^"]*"|-) (?P<version_id>[^ ]*)(?: (?P<host_id>[^ ]*) (?P<signature_version>[^ ]*) (?P<cipher_suite>[^ ]*) (?P<authentication_type>[^ ]*) (?P<host_header>[^ ]*) (?P<tls_version>[^ ]*))?"#;

const S3_ACCESS_NUMERIC: &[&str] = &[
    "http_status",
    "bytes_sent",
    "object_size",
    "total_time",
    "turn_around_time",
];

/// 🌐 nginx `combined`, optionally with `$http_x_forwarded_for` tacked on.
const NGINX_PATTERN: &str = r#"^(?P<remote_addr>[^ ]+) - (?P<remote_user>[^ ]+) \[(?P<time_local>[^\]]+)\] "(?P<request_method>[^ "]+) (?P<request_uri>[^ "]+) (?P<request_protocol>[^"]*)" (?P<status>[0-9]{3}) (?P<body_bytes_sent>[-0-9]+) "(?P<http_referer>[^"]*)" "(?P<http_user_agent>[^"]*)"(?: "(?P<http_x_forwarded_for>[^"]*)")?"#;

const NGINX_NUMERIC: &[&str] = &["status", "body_bytes_sent"];

/// 🧩 A regex-backed parser. Built-ins use the constructors below; `regex` takes
/// a user pattern with named groups.
#[derive(Debug, Clone)]
pub struct RegexParser {
    regex: Regex,
    fields: Vec<String>,
    numeric: Vec<String>,
    strip_quotes: bool,
    time: TimeRule,
}

impl RegexParser {
    pub fn new(pattern: &str, numeric: &[&str], time: TimeRule) -> Result<Self> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("💀 log pattern does not compile: {pattern}"))?;
        let fields: Vec<String> = regex.capture_names().flatten().map(str::to_string).collect();
        if fields.is_empty() {
            anyhow::bail!("💀 log pattern has no named capture groups, so it would produce empty records: {pattern}");
        }
        Ok(Self {
            regex,
            fields,
            numeric: numeric.iter().map(|f| f.to_string()).collect(),
            strip_quotes: false,
            time,
        })
    }

    pub fn elb() -> Result<Self> {
        Self::new(ELB_PATTERN, ELB_NUMERIC, TimeRule::rfc3339("time"))
    }

    pub fn s3_access() -> Result<Self> {
        let mut parser = Self::new(
            S3_ACCESS_PATTERN,
            S3_ACCESS_NUMERIC,
            TimeRule::format("time", "%d/%b/%Y:%H:%M:%S %z"),
        )?;
        parser.strip_quotes = true;
        Ok(parser)
    }

    pub fn nginx() -> Result<Self> {
        Self::new(
            NGINX_PATTERN,
            NGINX_NUMERIC,
            TimeRule::format("time_local", "%d/%b/%Y:%H:%M:%S %z"),
        )
    }

    /// 📋 The declared field list, in capture order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl RecordParser for RegexParser {
    fn parse(&self, line: &str) -> Record {
        let mut record = Record::new();
        let Some(captures) = self.regex.captures(line) else {
            return record;
        };
        for field in &self.fields {
            let raw = captures.name(field).map(|m| m.as_str()).unwrap_or("-");
            let raw = if self.strip_quotes {
                raw.strip_prefix('"')
                    .and_then(|r| r.strip_suffix('"'))
                    .unwrap_or(raw)
            } else {
                raw
            };
            let value = if self.numeric.iter().any(|n| n == field) {
                normalize_numeric(raw)
            } else {
                raw.to_string()
            };
            record.insert(field.clone(), Value::String(value));
        }
        self.time.apply(&mut record);
        record
    }
}
