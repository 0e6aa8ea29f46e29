//! 🎨 Per-format index mappings and the curated saved-view bundles.
//!
//! Formats without an entry here get the default mapping (just `@timestamp`)
//! and no saved views. Numeric fields come out of the parsers as strings; the
//! mapping is what makes the engine store them as numbers.

use serde_json::{Map, Value, json};

use crate::parsers::LogFormat;

/// 🗺️ `(field, engine type)` pairs worth pinning down for a format.
fn typed_fields(format: LogFormat) -> &'static [(&'static str, &'static str)] {
    match format {
        LogFormat::Elb => &[
            ("client_ip", "ip"),
            ("client_port", "integer"),
            ("request_processing_time", "float"),
            ("target_processing_time", "float"),
            ("response_processing_time", "float"),
            ("elb_status_code", "integer"),
            ("target_status_code", "integer"),
            ("received_bytes", "long"),
            ("sent_bytes", "long"),
            ("ua_browser", "keyword"),
        ],
        LogFormat::Cloudfront => &[
            ("c_ip", "ip"),
            ("sc_bytes", "long"),
            ("sc_status", "integer"),
            ("cs_bytes", "long"),
            ("time_taken", "float"),
            ("time_to_first_byte", "float"),
            ("x_edge_location", "keyword"),
        ],
        LogFormat::S3Access => &[
            ("remote_ip", "ip"),
            ("http_status", "integer"),
            ("bytes_sent", "long"),
            ("object_size", "long"),
            ("total_time", "integer"),
            ("turn_around_time", "integer"),
        ],
        LogFormat::VpcFlow => &[
            ("srcaddr", "ip"),
            ("dstaddr", "ip"),
            ("srcport", "integer"),
            ("dstport", "integer"),
            ("protocol", "integer"),
            ("packets", "long"),
            ("bytes", "long"),
            ("action", "keyword"),
        ],
        LogFormat::Waf => &[("action", "keyword"), ("webaclName", "keyword"), ("host", "keyword")],
        LogFormat::Cloudtrail => &[
            ("eventName", "keyword"),
            ("eventSource", "keyword"),
            ("awsRegion", "keyword"),
            ("sourceIPAddress", "keyword"),
        ],
        LogFormat::RdsMysql => &[
            ("rds_log_type", "keyword"),
            ("query_time", "float"),
            ("lock_time", "float"),
            ("rows_sent", "long"),
            ("rows_examined", "long"),
            ("log-detail", "text"),
        ],
        LogFormat::Nginx => &[
            ("remote_addr", "ip"),
            ("status", "integer"),
            ("body_bytes_sent", "long"),
        ],
        LogFormat::Json | LogFormat::Regex => &[],
    }
}

/// 📐 The `mappings` block of the index template.
pub fn mappings(format: LogFormat, timestamp_field: &str) -> Value {
    let mut properties = Map::new();
    properties.insert(timestamp_field.to_string(), json!({ "type": "date" }));
    for (field, kind) in typed_fields(format) {
        properties.insert((*field).to_string(), json!({ "type": kind }));
    }
    json!({ "properties": properties })
}

/// 👀 Columns shown by the curated saved search. `None` means no bundle for this format.
fn curated_columns(format: LogFormat) -> Option<&'static [&'static str]> {
    let columns: &'static [&'static str] = match format {
        LogFormat::Elb => &["client_ip", "request_verb", "request_url", "elb_status_code", "target_processing_time"],
        LogFormat::Cloudfront => &["c_ip", "cs_method", "cs_uri_stem", "sc_status", "x_edge_result_type"],
        LogFormat::S3Access => &["bucket", "operation", "key", "http_status"],
        LogFormat::VpcFlow => &["srcaddr", "dstaddr", "dstport", "action"],
        LogFormat::Waf => &["action", "webaclName", "host"],
        LogFormat::Cloudtrail => &["eventName", "eventSource", "sourceIPAddress"],
        LogFormat::RdsMysql => &["rds_log_type", "query_time", "log-detail"],
        LogFormat::Nginx => &["remote_addr", "request_method", "request_uri", "status"],
        LogFormat::Json | LogFormat::Regex => return None,
    };
    Some(columns)
}

/// 📊 Saved objects for `_bulk_create`: an index pattern plus a saved search over it.
pub fn saved_objects(format: LogFormat, alias: &str, timestamp_field: &str) -> Option<Value> {
    let columns = curated_columns(format)?;
    let pattern_id = format!("{alias}-pattern");
    let search_source = json!({
        "indexRefName": "kibanaSavedObjectMeta.searchSourceJSON.index",
        "query": { "query": "", "language": "kuery" },
        "filter": [],
    });
    Some(json!([
        {
            "type": "index-pattern",
            "id": pattern_id,
            "attributes": { "title": format!("{alias}*"), "timeFieldName": timestamp_field }
        },
        {
            "type": "search",
            "id": format!("{alias}-{format}-search"),
            "attributes": {
                "title": format!("{alias} ({format})"),
                "columns": columns,
                "sort": [[timestamp_field, "desc"]],
                "kibanaSavedObjectMeta": { "searchSourceJSON": search_source.to_string() }
            },
            "references": [{
                "name": "kibanaSavedObjectMeta.searchSourceJSON.index",
                "type": "index-pattern",
                "id": pattern_id
            }]
        }
    ]))
}
