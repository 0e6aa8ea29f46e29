//! 🔬 Parsers: text in, `Record` out.
//!
//! 🎬 *[a line arrives. nobody knows what it means. the format tag does.]*
//!
//! Every format is a strategy behind the `RecordParser` trait, and the set of
//! formats is closed: `LogFormat` names them, `FormatParser::from_format`
//! builds them, and an unknown tag is a configuration error, never a guess.
//! `RecordDecoder` wraps the chosen parser with envelope decoding, multiline
//! assembly, enrichment, and the read/parsed/skipped counters.
//!
//! 🦆 Unparseable lines are skipped and counted. They never raise.

pub mod columnar;
pub mod envelope;
pub mod json_formats;
pub mod rds;
pub mod regex_formats;
pub mod timestamp;

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::app_config::PipelineConfig;
use crate::common::Record;
use crate::enrich::{Enricher, Enrichment};

pub use columnar::ColumnarParser;
pub use envelope::{EnvelopeMode, SourceEvent, explode_cloudwatch};
pub use json_formats::{CloudTrailParser, JsonParser, WafParser};
pub use rds::{RdsCategory, RdsParser};
pub use regex_formats::RegexParser;
pub use timestamp::{TIMESTAMP_FIELD, TimeRule};

/// 🔬 One format's text → record conversion.
pub trait RecordParser: fmt::Debug + Send + Sync {
    /// 📄 One line, one record. An empty record means the line was skipped.
    fn parse(&self, line: &str) -> Record;

    /// 📄→📄📄 One line, any number of records. `source_group` is the envelope's
    /// log group when there is one; multiplexed formats pick their shape from it.
    fn parse_all(&self, line: &str, _source_group: Option<&str>) -> Vec<Record> {
        let record = self.parse(line);
        if record.is_empty() { Vec::new() } else { vec![record] }
    }
}

/// 🔢 Numeric placeholder rule: `-` (and nothing at all) means zero.
pub fn normalize_numeric(raw: &str) -> String {
    match raw {
        "-" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

/// 🏷️ The closed registry of format tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Elb,
    Cloudfront,
    S3Access,
    VpcFlow,
    Waf,
    Cloudtrail,
    RdsMysql,
    Nginx,
    Json,
    Regex,
}

impl LogFormat {
    pub const ALL: [LogFormat; 10] = [
        LogFormat::Elb,
        LogFormat::Cloudfront,
        LogFormat::S3Access,
        LogFormat::VpcFlow,
        LogFormat::Waf,
        LogFormat::Cloudtrail,
        LogFormat::RdsMysql,
        LogFormat::Nginx,
        LogFormat::Json,
        LogFormat::Regex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Elb => "elb",
            LogFormat::Cloudfront => "cloudfront",
            LogFormat::S3Access => "s3_access",
            LogFormat::VpcFlow => "vpc_flow",
            LogFormat::Waf => "waf",
            LogFormat::Cloudtrail => "cloudtrail",
            LogFormat::RdsMysql => "rds_mysql",
            LogFormat::Nginx => "nginx",
            LogFormat::Json => "json",
            LogFormat::Regex => "regex",
        }
    }

    /// 🦆 Formats whose records are JSON documents to begin with. Their failures
    /// are exported as JSON lines instead of CSV.
    pub fn is_json_native(&self) -> bool {
        matches!(self, LogFormat::Waf | LogFormat::Cloudtrail | LogFormat::Json)
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(tag: &str) -> Result<Self> {
        LogFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == tag)
            .ok_or_else(|| {
                let known: Vec<&str> = LogFormat::ALL.iter().map(LogFormat::as_str).collect();
                anyhow::anyhow!("💀 unknown log format '{tag}', expected one of: {}", known.join(", "))
            })
    }
}

/// ⚙️ Knobs for the generic parsers and the multiline assembler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParserOptions {
    /// 🕰️ field carrying the event time (`json` / `regex`)
    #[serde(default)]
    pub time_key: Option<String>,
    /// 🕰️ strptime-style format, or `epoch_seconds` / `epoch_millis`
    #[serde(default)]
    pub time_format: Option<String>,
    /// 🌍 fixed UTC offset for naive times, like `+08:00`
    #[serde(default)]
    pub time_offset: Option<String>,
    /// 🧩 named-group pattern for the `regex` format
    #[serde(default)]
    pub log_pattern: Option<String>,
    /// 🧵 a line matching this starts a new multiline event
    #[serde(default)]
    pub multiline_start: Option<String>,
    /// 🐬 rds category to assume when no log group travels with the line
    #[serde(default)]
    pub rds_category: Option<String>,
}

/// 🔬 The built parser for a format. Enum dispatch keeps the registry closed.
#[derive(Debug, Clone)]
pub enum FormatParser {
    Regex(RegexParser),
    Columnar(ColumnarParser),
    Json(JsonParser),
    Waf(WafParser),
    CloudTrail(CloudTrailParser),
    Rds(RdsParser),
}

impl FormatParser {
    pub fn from_format(format: LogFormat, options: &ParserOptions) -> Result<Self> {
        let configured_time = || {
            TimeRule::configured(
                options.time_key.as_deref(),
                options.time_format.as_deref(),
                options.time_offset.as_deref(),
            )
        };
        Ok(match format {
            LogFormat::Elb => FormatParser::Regex(RegexParser::elb()?),
            LogFormat::S3Access => FormatParser::Regex(RegexParser::s3_access()?),
            LogFormat::Nginx => FormatParser::Regex(RegexParser::nginx()?),
            LogFormat::Regex => {
                let pattern = options
                    .log_pattern
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .context("💀 log_type 'regex' needs pipeline.parser.log_pattern")?;
                FormatParser::Regex(RegexParser::new(pattern, &[], configured_time()?)?)
            }
            LogFormat::Cloudfront => FormatParser::Columnar(ColumnarParser::cloudfront()),
            LogFormat::VpcFlow => FormatParser::Columnar(ColumnarParser::vpc_flow()),
            LogFormat::Waf => FormatParser::Waf(WafParser::default()),
            LogFormat::Cloudtrail => FormatParser::CloudTrail(CloudTrailParser::default()),
            LogFormat::RdsMysql => FormatParser::Rds(RdsParser::new(options.rds_category.as_deref())?),
            LogFormat::Json => FormatParser::Json(JsonParser::new(configured_time()?)),
        })
    }
}

impl RecordParser for FormatParser {
    fn parse(&self, line: &str) -> Record {
        match self {
            FormatParser::Regex(p) => p.parse(line),
            FormatParser::Columnar(p) => p.parse(line),
            FormatParser::Json(p) => p.parse(line),
            FormatParser::Waf(p) => p.parse(line),
            FormatParser::CloudTrail(p) => p.parse(line),
            FormatParser::Rds(p) => p.parse(line),
        }
    }

    fn parse_all(&self, line: &str, source_group: Option<&str>) -> Vec<Record> {
        match self {
            FormatParser::Regex(p) => p.parse_all(line, source_group),
            FormatParser::Columnar(p) => p.parse_all(line, source_group),
            FormatParser::Json(p) => p.parse_all(line, source_group),
            FormatParser::Waf(p) => p.parse_all(line, source_group),
            FormatParser::CloudTrail(p) => p.parse_all(line, source_group),
            FormatParser::Rds(p) => p.parse_all(line, source_group),
        }
    }
}

/// 🧵 Glues continuation lines onto the event they belong to.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    start: Regex,
    pending: Option<String>,
}

impl LineAssembler {
    pub fn new(start_pattern: &str) -> Result<Self> {
        Ok(Self {
            start: Regex::new(start_pattern)
                .with_context(|| format!("💀 multiline_start does not compile: {start_pattern}"))?,
            pending: None,
        })
    }

    /// 🧵 Feed a physical line; get back the previous event once a new one starts.
    pub fn push(&mut self, line: &str) -> Option<String> {
        if self.start.is_match(line) {
            return self.pending.replace(line.to_string());
        }
        match self.pending.as_mut() {
            Some(pending) => {
                pending.push('\n');
                pending.push_str(line);
                None
            }
            // orphaned continuation at the top of the input stands on its own
            None => Some(line.to_string()),
        }
    }

    pub fn finish(&mut self) -> Option<String> {
        self.pending.take()
    }
}

/// 📊 Line-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub lines_read: u64,
    pub records_parsed: u64,
    pub lines_skipped: u64,
}

/// 🔬 Parser + envelope + multiline + enrichments, with counters.
#[derive(Debug)]
pub struct RecordDecoder {
    parser: FormatParser,
    envelope: EnvelopeMode,
    assembler: Option<LineAssembler>,
    enrichers: Vec<Enricher>,
    stats: DecodeStats,
}

impl RecordDecoder {
    pub fn new(
        parser: FormatParser,
        envelope: EnvelopeMode,
        assembler: Option<LineAssembler>,
        enrichers: Vec<Enricher>,
    ) -> Self {
        Self {
            parser,
            envelope,
            assembler,
            enrichers,
            stats: DecodeStats::default(),
        }
    }

    /// ⚙️ Build from the pipeline section. Unknown enrichments and broken
    /// patterns fail here, before any input is read.
    pub fn from_config(pipeline: &PipelineConfig) -> Result<Self> {
        let parser = FormatParser::from_format(pipeline.log_type, &pipeline.parser)
            .with_context(|| format!("💀 Failed to build the '{}' parser", pipeline.log_type))?;
        let enrichers = Enricher::resolve(&pipeline.enrichments)?;
        // 🧵 envelopes already deliver whole events; plain rds files need stitching
        let multiline = match (&pipeline.parser.multiline_start, pipeline.log_type, pipeline.envelope) {
            (Some(pattern), _, _) => Some(pattern.as_str()),
            (None, LogFormat::RdsMysql, EnvelopeMode::None) => Some(rds::RDS_EVENT_START),
            _ => None,
        };
        let assembler = multiline.map(LineAssembler::new).transpose()?;
        Ok(Self::new(parser, pipeline.envelope, assembler, enrichers))
    }

    /// 📄 Decode one physical line.
    pub fn decode_line(&mut self, line: &str) -> Vec<Record> {
        self.stats.lines_read += 1;
        let line = line.strip_suffix('\r').unwrap_or(line);
        match self.envelope {
            EnvelopeMode::CloudWatch => {
                let events = explode_cloudwatch(line);
                if events.is_empty() {
                    self.stats.lines_skipped += 1;
                    trace!("⏭️ no data events on line {}", self.stats.lines_read);
                    return Vec::new();
                }
                let mut records = Vec::new();
                for event in events {
                    records.extend(self.decode_event(&event));
                }
                records
            }
            EnvelopeMode::None => match self.assembler.as_mut().map(|a| a.push(line)) {
                Some(Some(event)) => self.decode_text(&event, None),
                Some(None) => Vec::new(),
                None => self.decode_text(line, None),
            },
        }
    }

    /// 🏁 Flush whatever the multiline assembler is still holding.
    pub fn finish(&mut self) -> Vec<Record> {
        match self.assembler.as_mut().and_then(LineAssembler::finish) {
            Some(event) => self.decode_text(&event, None),
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    fn decode_event(&mut self, event: &SourceEvent) -> Vec<Record> {
        let mut records = self.decode_text(&event.message, Some(&event.log_group));
        for record in &mut records {
            record
                .entry("log_group")
                .or_insert_with(|| Value::String(event.log_group.clone()));
            record
                .entry("log_stream")
                .or_insert_with(|| Value::String(event.log_stream.clone()));
            if record.contains_key(TIMESTAMP_FIELD) {
                continue;
            }
            if let Some(instant) = event.timestamp.and_then(|ms| timestamp::from_epoch_millis(ms as f64)) {
                record.insert(TIMESTAMP_FIELD.into(), Value::String(timestamp::canonical(instant)));
            }
        }
        records
    }

    fn decode_text(&mut self, text: &str, source_group: Option<&str>) -> Vec<Record> {
        if text.trim().is_empty() {
            self.stats.lines_skipped += 1;
            return Vec::new();
        }
        let mut records = self.parser.parse_all(text, source_group);
        if records.is_empty() {
            self.stats.lines_skipped += 1;
            trace!("⏭️ skipped unparseable input: {:.120}", text);
            return records;
        }
        for record in &mut records {
            for enricher in &self.enrichers {
                for (field, value) in enricher.enrich(record) {
                    record.entry(field).or_insert(value);
                }
            }
        }
        self.stats.records_parsed += records.len() as u64;
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::rds::{CATEGORY_FIELD, LOG_DETAIL_FIELD};

    fn pipeline(toml_text: &str) -> PipelineConfig {
        toml::from_str(toml_text).expect("valid pipeline toml")
    }

    #[test]
    fn the_one_where_every_tag_round_trips_through_from_str() {
        for format in LogFormat::ALL {
            assert_eq!(format.as_str().parse::<LogFormat>().ok(), Some(format));
        }
        let err = "syslog-ng".parse::<LogFormat>().expect_err("closed registry");
        assert!(err.to_string().contains("rds_mysql"));
    }

    #[test]
    fn the_one_where_regex_without_a_pattern_is_a_config_error() {
        let options = ParserOptions::default();
        assert!(FormatParser::from_format(LogFormat::Regex, &options).is_err());
        let options = ParserOptions {
            log_pattern: Some(r"^(?P<level>\w+): (?P<msg>.*)$".into()),
            ..Default::default()
        };
        let parser = FormatParser::from_format(LogFormat::Regex, &options).expect("valid pattern");
        assert_eq!(parser.parse("WARN: disk at 91%")["msg"], "disk at 91%");
    }

    #[test]
    fn the_one_where_the_decoder_counts_what_it_skips() -> Result<()> {
        let mut decoder = RecordDecoder::from_config(&pipeline(
            r#"
            log_type = "nginx"
            index_prefix = "web"
            enrichments = ["user_agent"]
            "#,
        ))?;
        let good = r#"203.0.113.9 - - [10/Oct/2023:13:55:36 -0700] "GET / HTTP/1.1" 200 12 "-" "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/118.0""#;
        assert_eq!(decoder.decode_line(good).len(), 1);
        assert!(decoder.decode_line("definitely not nginx").is_empty());
        assert!(decoder.decode_line("").is_empty());
        let stats = decoder.stats();
        assert_eq!(stats, DecodeStats { lines_read: 3, records_parsed: 1, lines_skipped: 2 });
        Ok(())
    }

    #[test]
    fn the_one_where_enrichment_adds_fields_without_clobbering() -> Result<()> {
        let mut decoder = RecordDecoder::from_config(&pipeline(
            r#"
            log_type = "json"
            index_prefix = "app"
            enrichments = ["user_agent", "url_path"]
            "#,
        ))?;
        let records = decoder.decode_line(
            r#"{"user_agent":"Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Version/17.0 Mobile/15E148 Safari/604.1","uri":"/shop/cart?item=42","ua_os":"mine"}"#,
        );
        let record = &records[0];
        assert_eq!(record["ua_browser"], "Safari");
        assert_eq!(record["ua_os"], "mine");
        assert_eq!(record["url_path"], "/shop/cart");
        Ok(())
    }

    #[test]
    fn the_one_where_cloudwatch_envelopes_carry_the_log_group_into_rds() -> Result<()> {
        let mut decoder = RecordDecoder::from_config(&pipeline(
            r#"
            log_type = "rds_mysql"
            index_prefix = "rds"
            envelope = "cloud_watch"
            "#,
        ))?;
        let line = r#"{"messageType":"DATA_MESSAGE","logGroup":"/aws/rds/instance/db-1/error","logStream":"db-1","logEvents":[{"id":"1","timestamp":1672531200000,"message":"2023-01-01T00:00:00.000000Z 0 [Note] [MY-010311] [Server] Server socket created."},{"id":"2","timestamp":1672531200500,"message":"plain words"}]}{"messageType":"CONTROL_MESSAGE","logGroup":"","logStream":"","logEvents":[]}"#;
        let records = decoder.decode_line(line);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["err_level"], "Note");
        assert_eq!(records[0]["log_group"], "/aws/rds/instance/db-1/error");
        assert_eq!(records[1][LOG_DETAIL_FIELD], "plain words");
        assert_eq!(records[1][CATEGORY_FIELD], "error");
        // 🕰️ the fallback record borrows the envelope's timestamp
        assert_eq!(records[1][TIMESTAMP_FIELD], "2023-01-01T00:00:00.500Z");
        Ok(())
    }

    #[test]
    fn the_one_where_plain_rds_files_get_stitched_back_together() -> Result<()> {
        let mut decoder = RecordDecoder::from_config(&pipeline(
            r#"
            log_type = "rds_mysql"
            index_prefix = "rds"
            [parser]
            rds_category = "slowquery"
            "#,
        ))?;
        let text = "# Time: 2023-01-01T00:00:01.000000Z\n# User@Host: admin[admin] @  [10.0.0.1]  Id:    12\n# Query_time: 2.5  Lock_time: 0.0 Rows_sent: 1  Rows_examined: 0\nSET timestamp=1672531201;\nselect sleep(2);\n# Time: 2023-01-01T00:00:05.000000Z\n# User@Host: app[app] @  [10.0.0.2]  Id:    13\n# Query_time: 3.0  Lock_time: 0.0 Rows_sent: 0  Rows_examined: 9\nSET timestamp=1672531205;\nupdate t set a = 1;";
        let mut records = Vec::new();
        for line in text.lines() {
            records.extend(decoder.decode_line(line));
        }
        assert_eq!(records.len(), 1, "second event is still being assembled");
        records.extend(decoder.finish());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["query"], "select sleep(2);");
        assert_eq!(records[1]["rows_examined"], "9");
        Ok(())
    }

    #[test]
    fn the_one_where_an_unknown_enrichment_stops_the_show() {
        let result = RecordDecoder::from_config(&pipeline(
            r#"
            log_type = "elb"
            index_prefix = "alb"
            enrichments = ["geoip_but_from_vibes"]
            "#,
        ));
        assert!(result.is_err());
    }
}
