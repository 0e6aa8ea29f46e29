//! ✉️ Delivery envelopes: one physical line, many logical records.
//!
//! CloudWatch Logs subscriptions delivered through a firehose land as JSON
//! envelopes, and several envelopes are often glued together on one line with
//! no separator at all (`{...}{...}`). `StreamDeserializer` walks them one by
//! one. `CONTROL_MESSAGE` envelopes are the heartbeat the service sends to
//! check the destination is alive; they carry no data and are skipped.

use serde::Deserialize;
use tracing::{trace, warn};

/// ✉️ How physical lines are wrapped before the format parser sees them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeMode {
    /// 📄 each line is one log line
    #[default]
    None,
    /// ✉️ each line holds one or more CloudWatch Logs subscription envelopes
    CloudWatch,
}

pub const DATA_MESSAGE: &str = "DATA_MESSAGE";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudWatchEnvelope {
    message_type: String,
    #[serde(default)]
    log_group: String,
    #[serde(default)]
    log_stream: String,
    #[serde(default)]
    log_events: Vec<CloudWatchEvent>,
}

#[derive(Debug, Deserialize)]
struct CloudWatchEvent {
    #[serde(default)]
    timestamp: Option<i64>,
    message: String,
}

/// 📨 One logical log event pulled out of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub log_group: String,
    pub log_stream: String,
    /// epoch millis as stamped by the delivery service
    pub timestamp: Option<i64>,
    pub message: String,
}

/// ✉️ Explode every `DATA_MESSAGE` envelope on the line into its events.
/// Trailing garbage after the last good envelope is logged and dropped.
pub fn explode_cloudwatch(line: &str) -> Vec<SourceEvent> {
    let mut events = Vec::new();
    let stream = serde_json::Deserializer::from_str(line.trim()).into_iter::<CloudWatchEnvelope>();
    for envelope in stream {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("✉️ envelope stream broke off mid-line, keeping {} events so far: {err}", events.len());
                break;
            }
        };
        if envelope.message_type != DATA_MESSAGE {
            trace!("💓 skipping {} envelope", envelope.message_type);
            continue;
        }
        for event in envelope.log_events {
            events.push(SourceEvent {
                log_group: envelope.log_group.clone(),
                log_stream: envelope.log_stream.clone(),
                timestamp: event.timestamp,
                message: event.message,
            });
        }
    }
    events
}
