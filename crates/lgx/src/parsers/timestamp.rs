//! 🕰️ Time, the final boss of log parsing.
//!
//! Every format has its own idea of what a timestamp looks like: RFC 3339 with
//! microseconds, `06/Feb/2019:00:00:38 +0000`, epoch seconds, epoch millis, or
//! a date and a time in two separate columns because why not. This module turns
//! all of them into one canonical `@timestamp` (RFC 3339, UTC, millisecond precision).

use chrono::format::{Parsed, StrftimeItems};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use tracing::trace;

use crate::common::Record;

/// 🏷️ The derived canonical timestamp field every parser emits.
pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// 📅 How a format finds its time.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeRule {
    /// 🤷 no time field, no `@timestamp`
    None,
    /// 📜 RFC 3339 / ISO 8601 string
    Rfc3339 { field: String },
    /// 🧩 strptime-style format; naive values are read in `offset`
    Format {
        field: String,
        format: String,
        offset: FixedOffset,
    },
    /// 🔢 epoch seconds, as a number or a numeric string
    EpochSeconds { field: String },
    /// 🔢 epoch milliseconds
    EpochMillis { field: String },
    /// 🪓 date and time living in two separate columns, read as UTC
    DateAndTime { date_field: String, time_field: String },
    /// 🎲 RFC 3339 string or an epoch number, whichever shows up
    Auto { field: String },
}

impl TimeRule {
    pub fn rfc3339(field: &str) -> Self {
        TimeRule::Rfc3339 { field: field.to_string() }
    }

    pub fn format(field: &str, format: &str) -> Self {
        TimeRule::Format {
            field: field.to_string(),
            format: format.to_string(),
            offset: utc_offset(),
        }
    }

    pub fn epoch_seconds(field: &str) -> Self {
        TimeRule::EpochSeconds { field: field.to_string() }
    }

    pub fn epoch_millis(field: &str) -> Self {
        TimeRule::EpochMillis { field: field.to_string() }
    }

    /// ⚙️ Build the rule for the generic "one log type" parsers from the three knobs:
    /// time field name, strptime format, fixed UTC offset.
    pub fn configured(
        time_key: Option<&str>,
        time_format: Option<&str>,
        time_offset: Option<&str>,
    ) -> anyhow::Result<Self> {
        let Some(field) = time_key.filter(|k| !k.is_empty()) else {
            return Ok(TimeRule::None);
        };
        let offset = match time_offset {
            Some(raw) => parse_offset(raw)
                .ok_or_else(|| anyhow::anyhow!("💀 time_offset '{raw}' is not a UTC offset like +08:00"))?,
            None => utc_offset(),
        };
        Ok(match time_format.filter(|f| !f.is_empty()) {
            Some("epoch") | Some("epoch_seconds") => TimeRule::epoch_seconds(field),
            Some("epoch_millis") => TimeRule::epoch_millis(field),
            Some(format) => TimeRule::Format {
                field: field.to_string(),
                format: format.to_string(),
                offset,
            },
            None => TimeRule::Auto { field: field.to_string() },
        })
    }

    /// 🕰️ Work out the instant this record happened, if the rule can.
    pub fn resolve(&self, record: &Record) -> Option<DateTime<Utc>> {
        match self {
            TimeRule::None => None,
            TimeRule::Rfc3339 { field } => parse_rfc3339(as_text(record.get(field)?)?.as_str()),
            TimeRule::Format { field, format, offset } => {
                parse_with_format(as_text(record.get(field)?)?.as_str(), format, *offset)
            }
            TimeRule::EpochSeconds { field } => from_epoch_seconds(as_f64(record.get(field)?)?),
            TimeRule::EpochMillis { field } => from_epoch_millis(as_f64(record.get(field)?)?),
            TimeRule::DateAndTime { date_field, time_field } => {
                let date = as_text(record.get(date_field)?)?;
                let time = as_text(record.get(time_field)?)?;
                parse_with_format(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S", utc_offset())
            }
            TimeRule::Auto { field } => {
                let value = record.get(field)?;
                match value {
                    Value::Number(_) => {
                        let raw = as_f64(value)?;
                        // 🔢 anything past year ~5138 in seconds is really millis
                        if raw.abs() >= 1e11 {
                            from_epoch_millis(raw)
                        } else {
                            from_epoch_seconds(raw)
                        }
                    }
                    _ => parse_rfc3339(as_text(value)?.as_str()),
                }
            }
        }
    }

    /// 📎 Stamp `@timestamp` onto the record when the time can be resolved.
    pub fn apply(&self, record: &mut Record) {
        if matches!(self, TimeRule::None) || record.is_empty() {
            return;
        }
        match self.resolve(record) {
            Some(instant) => {
                record.insert(TIMESTAMP_FIELD.to_string(), Value::String(canonical(instant)));
            }
            None => trace!("🕰️ no usable time for rule {:?}", self),
        }
    }
}

pub fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// 🌍 `+08:00`, `-0530`, `+02`, `Z`, `UTC` or nothing at all.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Some(utc_offset());
    }
    let (sign, rest) = match trimmed.as_bytes().first()? {
        b'+' => (1, &trimmed[1..]),
        b'-' => (-1, &trimmed[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn from_epoch_seconds(raw: f64) -> Option<DateTime<Utc>> {
    from_epoch_millis(raw * 1000.0)
}

pub fn from_epoch_millis(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(raw.round() as i64)
}

/// 🧩 Parse `value` with a strptime `format`, reading naive values in `offset`.
/// Values carrying their own offset (`%z`) keep it.
pub fn parse_with_format(value: &str, format: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let parsed = parse_lenient(value, format)?;
    if let Ok(aware) = parsed.to_datetime() {
        return Some(aware.with_timezone(&Utc));
    }
    let naive = parsed.to_naive_datetime_with_offset(0).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 🧩 Parse into a naive date-time, filling in whatever the format left out
/// (month, day, hour, minute, second) with its lowest value. `%Y%m%d%H` is a
/// perfectly respectable hour, even if chrono wants the minutes too.
pub fn parse_naive_lenient(value: &str, format: &str) -> Option<NaiveDateTime> {
    parse_lenient(value, format)?
        .to_naive_datetime_with_offset(0)
        .ok()
}

fn parse_lenient(value: &str, format: &str) -> Option<Parsed> {
    let mut parsed = Parsed::new();
    chrono::format::parse(&mut parsed, value, StrftimeItems::new(format)).ok()?;
    // 📐 week/ordinal/epoch formats carry their own calendar, defaults would contradict it
    let self_contained = ["%s", "%j", "%U", "%W", "%V"]
        .iter()
        .any(|spec| format.contains(spec));
    if !self_contained {
        // already-set fields reject a different value, which is exactly the point
        let _ = parsed.set_month(1);
        let _ = parsed.set_day(1);
        let _ = parsed.set_hour(0);
        let _ = parsed.set_minute(0);
        let _ = parsed.set_second(0);
    }
    Some(parsed)
}

/// 📜 The one true output shape: `2024-01-02T03:04:05.678Z`.
pub fn canonical(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s != "-" => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn the_one_where_offsets_come_in_every_flavour() {
        assert_eq!(parse_offset("+08:00").map(|o| o.local_minus_utc()), Some(8 * 3600));
        assert_eq!(parse_offset("-0530").map(|o| o.local_minus_utc()), Some(-(5 * 3600 + 30 * 60)));
        assert_eq!(parse_offset("+02").map(|o| o.local_minus_utc()), Some(2 * 3600));
        assert_eq!(parse_offset("UTC").map(|o| o.local_minus_utc()), Some(0));
        assert_eq!(parse_offset("eight o'clock"), None);
        assert_eq!(parse_offset("+08:75"), None);
    }

    #[test]
    fn the_one_where_a_naive_time_is_read_in_the_configured_offset() {
        let offset = parse_offset("+08:00").expect("valid offset");
        let instant = parse_with_format("2024-03-01 08:00:00", "%Y-%m-%d %H:%M:%S", offset)
            .expect("should parse");
        assert_eq!(canonical(instant), "2024-03-01T00:00:00.000Z");
    }

    #[test]
    fn the_one_where_the_value_brings_its_own_offset() {
        let instant = parse_with_format("06/Feb/2019:00:00:38 +0100", "%d/%b/%Y:%H:%M:%S %z", utc_offset())
            .expect("should parse");
        assert_eq!(canonical(instant), "2019-02-05T23:00:38.000Z");
    }

    #[test]
    fn the_one_where_an_hour_is_enough_to_be_a_datetime() {
        let naive = parse_naive_lenient("2024010213", "%Y%m%d%H").expect("should parse");
        assert_eq!(naive.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-01-02 13:00:00");
        assert_eq!(parse_naive_lenient("not-a-date", "%Y%m%d%H"), None);
    }

    #[test]
    fn the_one_where_every_rule_lands_on_the_same_instant() {
        let expected = "2023-11-14T22:13:20.000Z";
        let cases = vec![
            (TimeRule::rfc3339("t"), json!({"t": "2023-11-14T22:13:20Z"})),
            (TimeRule::epoch_seconds("t"), json!({"t": "1700000000"})),
            (TimeRule::epoch_millis("t"), json!({"t": 1_700_000_000_000_i64})),
            (TimeRule::Auto { field: "t".into() }, json!({"t": 1_700_000_000})),
            (TimeRule::Auto { field: "t".into() }, json!({"t": 1_700_000_000_000_i64})),
            (
                TimeRule::DateAndTime { date_field: "d".into(), time_field: "t".into() },
                json!({"d": "2023-11-14", "t": "22:13:20"}),
            ),
        ];
        for (rule, value) in cases {
            let mut r = record(value);
            rule.apply(&mut r);
            assert_eq!(r[TIMESTAMP_FIELD], expected, "rule {rule:?}");
        }
    }

    #[test]
    fn the_one_where_a_dash_is_not_a_time() {
        let mut r = record(json!({"t": "-"}));
        TimeRule::rfc3339("t").apply(&mut r);
        assert!(!r.contains_key(TIMESTAMP_FIELD));
    }

    #[test]
    fn the_one_where_configured_rules_reject_nonsense_offsets() {
        assert!(TimeRule::configured(Some("ts"), Some("%s"), Some("soon")).is_err());
        assert_eq!(TimeRule::configured(None, Some("%s"), None).ok(), Some(TimeRule::None));
        assert_eq!(
            TimeRule::configured(Some("ts"), Some("epoch_millis"), None).ok(),
            Some(TimeRule::epoch_millis("ts"))
        );
    }
}
