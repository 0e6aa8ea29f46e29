//! 🔌 Enrichments: extra fields derived from fields a record already has.
//!
//! The list is named in config and resolved once at startup. A name nobody
//! recognises fails the whole run right there, instead of silently doing
//! nothing to every record for the next six hours.
//!
//! Enrichments only ever ADD fields. A field the parser already set wins.

use std::fmt;

use anyhow::Result;
use reqwest::Url;
use serde_json::{Map, Value};

use crate::common::Record;

/// 🔌 `enrich(record) -> fields`.
pub trait Enrichment: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn enrich(&self, record: &Record) -> Record;
}

fn first_text<'a>(record: &'a Record, candidates: &[&str]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|field| record.get(*field).and_then(Value::as_str))
        .find(|value| !value.is_empty() && *value != "-")
}

/// 🕵️ Browser / OS / device family from a user-agent string.
#[derive(Debug, Clone, Default)]
pub struct UserAgentEnricher;

const USER_AGENT_FIELDS: &[&str] = &["user_agent", "cs_user_agent", "http_user_agent", "userAgent"];

impl UserAgentEnricher {
    fn browser(ua: &str) -> &'static str {
        let lower = ua.to_ascii_lowercase();
        if ["bot", "spider", "crawl"].iter().any(|b| lower.contains(b)) {
            "Bot"
        } else if ua.contains("Edg/") || ua.contains("Edge/") {
            "Edge"
        } else if ua.contains("OPR/") || ua.contains("Opera") {
            "Opera"
        } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
            "Firefox"
        } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
            "Chrome"
        } else if ua.contains("Safari/") {
            "Safari"
        } else if lower.starts_with("curl/") {
            "curl"
        } else {
            "Other"
        }
    }

    fn os(ua: &str) -> &'static str {
        if ua.contains("Windows") {
            "Windows"
        } else if ua.contains("Android") {
            "Android"
        } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
            "iOS"
        } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
            "macOS"
        } else if ua.contains("Linux") || ua.contains("X11") {
            "Linux"
        } else {
            "Other"
        }
    }

    fn device(ua: &str) -> &'static str {
        let lower = ua.to_ascii_lowercase();
        if ["bot", "spider", "crawl"].iter().any(|b| lower.contains(b)) {
            "Spider"
        } else if ua.contains("iPad") || ua.contains("Tablet") {
            "Tablet"
        } else if ua.contains("Mobile") || ua.contains("iPhone") || ua.contains("Android") {
            "Mobile"
        } else {
            "Desktop"
        }
    }
}

impl Enrichment for UserAgentEnricher {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    fn enrich(&self, record: &Record) -> Record {
        let mut fields = Map::new();
        let Some(ua) = first_text(record, USER_AGENT_FIELDS) else {
            return fields;
        };
        fields.insert("ua_browser".into(), Value::String(Self::browser(ua).into()));
        fields.insert("ua_os".into(), Value::String(Self::os(ua).into()));
        fields.insert("ua_device".into(), Value::String(Self::device(ua).into()));
        fields
    }
}

/// 🧭 Path and query-parameter map from a request URL (absolute or relative).
#[derive(Debug, Clone, Default)]
pub struct UrlPathEnricher;

const URL_FIELDS: &[&str] = &["request_url", "cs_uri_stem", "request_uri", "uri"];

impl Enrichment for UrlPathEnricher {
    fn name(&self) -> &'static str {
        "url_path"
    }

    fn enrich(&self, record: &Record) -> Record {
        let mut fields = Map::new();
        let Some(raw) = first_text(record, URL_FIELDS) else {
            return fields;
        };
        let parsed = Url::parse(raw).or_else(|_| {
            Url::parse("http://relative.invalid/").and_then(|base| base.join(raw))
        });
        let Ok(url) = parsed else {
            return fields;
        };
        fields.insert("url_path".into(), Value::String(url.path().to_string()));
        let params: Map<String, Value> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect();
        if !params.is_empty() {
            fields.insert("url_params".into(), Value::Object(params));
        }
        fields
    }
}

/// 🔌 The closed set of enrichments, resolved by name.
#[derive(Debug, Clone)]
pub enum Enricher {
    UserAgent(UserAgentEnricher),
    UrlPath(UrlPathEnricher),
}

impl Enricher {
    pub const KNOWN: [&'static str; 2] = ["user_agent", "url_path"];

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "user_agent" => Ok(Enricher::UserAgent(UserAgentEnricher)),
            "url_path" => Ok(Enricher::UrlPath(UrlPathEnricher)),
            other => anyhow::bail!(
                "💀 unknown enrichment '{other}', expected one of: {}",
                Self::KNOWN.join(", ")
            ),
        }
    }

    pub fn resolve(names: &[String]) -> Result<Vec<Self>> {
        names.iter().map(|name| Self::from_name(name)).collect()
    }
}

impl Enrichment for Enricher {
    fn name(&self) -> &'static str {
        match self {
            Enricher::UserAgent(e) => e.name(),
            Enricher::UrlPath(e) => e.name(),
        }
    }

    fn enrich(&self, record: &Record) -> Record {
        match self {
            Enricher::UserAgent(e) => e.enrich(record),
            Enricher::UrlPath(e) => e.enrich(record),
        }
    }
}
