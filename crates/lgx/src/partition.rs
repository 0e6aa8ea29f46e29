//! 🗂️ Prefix rewriting for Hive-style `key=value` paths.
//!
//! `year=2024/month=01/dt=2024010213/part-0.gz` with the right policies becomes
//! `dt=20240102/part-0.gz`: each `key=value` segment is kept, coarsened, pinned
//! to a constant, or dropped. Segments without `=` are not partition keys and
//! pass through untouched.

use std::collections::BTreeMap;
use std::fmt::Write;

use anyhow::bail;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use tracing::warn;

use crate::parsers::timestamp::parse_naive_lenient;

/// 🗂️ What to do with one partition key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentPolicy {
    /// keep the segment exactly as it is
    Retain,
    /// reformat the value from one strptime format to another
    Time { from: String, to: String },
    /// replace the value with a constant
    Default { value: String },
}

/// 🗺️ partition key → policy. Keys not in the map are dropped.
pub type PolicyMap = BTreeMap<String, SegmentPolicy>;

fn is_valid_strftime(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// 🔍 Reject `time` policies whose formats chrono cannot read, before any path is rewritten.
pub fn validate_policies(policies: &PolicyMap) -> anyhow::Result<()> {
    for (key, policy) in policies {
        if let SegmentPolicy::Time { from, to } = policy {
            for format in [from, to] {
                if !is_valid_strftime(format) {
                    bail!("💀 Partition key '{key}' has an invalid time format '{format}'");
                }
            }
        }
    }
    Ok(())
}

/// ✂️ Rewrite `path` segment by segment.
pub fn rewrite(path: &str, policies: &PolicyMap) -> String {
    path.split('/')
        .filter_map(|segment| rewrite_segment(segment, policies))
        .collect::<Vec<_>>()
        .join("/")
}

fn rewrite_segment(segment: &str, policies: &PolicyMap) -> Option<String> {
    let Some((key, value)) = segment.split_once('=') else {
        return Some(segment.to_string());
    };
    match policies.get(key)? {
        SegmentPolicy::Retain => Some(segment.to_string()),
        SegmentPolicy::Default { value: constant } => Some(format!("{key}={constant}")),
        SegmentPolicy::Time { from, to } => match parse_naive_lenient(value, from) {
            Some(instant) => {
                let mut rewritten = format!("{key}=");
                if write!(rewritten, "{}", instant.format(to)).is_err() {
                    warn!("🗂️ cannot format '{key}' with '{to}', keeping the segment");
                    return Some(segment.to_string());
                }
                Some(rewritten)
            }
            None => {
                // 🤷 a value we can't read stays as it is rather than vanish
                warn!("🗂️ partition value '{value}' for '{key}' does not match '{from}', keeping it");
                Some(segment.to_string())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies(toml_text: &str) -> PolicyMap {
        toml::from_str(toml_text).expect("valid policy toml")
    }

    #[test]
    fn the_one_where_unknown_keys_vanish_and_defaults_stick() {
        let map = policies(
            r#"
            [c]
            type = "default"
            value = "Z"
            "#,
        );
        assert_eq!(rewrite("a/b=1/c=x/d.log", &map), "a/c=Z/d.log");
    }

    #[test]
    fn the_one_where_hours_get_rounded_down_to_days() {
        let map = policies(
            r#"
            [dt]
            type = "time"
            from = "%Y%m%d%H"
            to = "%Y%m%d"

            [region]
            type = "retain"
            "#,
        );
        assert_eq!(
            rewrite("logs/region=us-east-1/account=123/dt=2024010213/part-0.gz", &map),
            "logs/region=us-east-1/dt=20240102/part-0.gz"
        );
    }

    #[test]
    fn the_one_where_an_unreadable_time_is_left_alone() {
        let map = policies(
            r#"
            [dt]
            type = "time"
            from = "%Y-%m-%d"
            to = "%Y-%m"
            "#,
        );
        assert_eq!(rewrite("dt=yesterday/x.log", &map), "dt=yesterday/x.log");
        assert_eq!(rewrite("dt=2024-03-09/x.log", &map), "dt=2024-03/x.log");
    }

    #[test]
    fn the_one_where_a_broken_output_format_keeps_the_segment() {
        let map = policies(
            r#"
            [dt]
            type = "time"
            from = "%Y%m%d%H"
            to = "%Y%m%d%"
            "#,
        );
        assert_eq!(rewrite("dt=2024010213/x.gz", &map), "dt=2024010213/x.gz");
        let err = validate_policies(&map).expect_err("a lone % is not a format");
        assert!(err.to_string().contains("'dt'"));
    }

    #[test]
    fn the_one_where_sane_formats_pass_inspection() {
        let map = policies(
            r#"
            [dt]
            type = "time"
            from = "%Y%m%d%H"
            to = "%Y-%m-%d"

            [region]
            type = "retain"
            "#,
        );
        assert!(validate_policies(&map).is_ok());
    }

    #[test]
    fn the_one_where_plain_paths_are_untouched() {
        let map = PolicyMap::new();
        assert_eq!(rewrite("a/b/c.gz", &map), "a/b/c.gz");
        assert_eq!(rewrite("prefix/", &map), "prefix/");
        assert_eq!(rewrite("", &map), "");
    }
}
