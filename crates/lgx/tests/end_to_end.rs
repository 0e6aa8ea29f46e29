//! 🎬 *[one load balancer line. one batch. one very patient mock cluster.]*
//!
//! 🧪 The whole road through the public API: raw line → records → batch → `_bulk` → verdicts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lgx::app_config::AppConfig;
use lgx::batcher::{BatchSizeController, RecordBatcher, Threshold};
use lgx::common::{SourcedRecord, record_size};
use lgx::engine::{EngineClient, EngineConfig};
use lgx::indexer::BulkIndexer;
use lgx::retry::{Backoff, RetryController, RetryPolicy};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ELB_LINE: &str = r#"https 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.086 0.048 0.037 200 200 0 57 "GET https://www.example.com:443/ HTTP/1.1" "curl/7.46.0" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 "Root=1-58337281-1d84f3d73c47ec4e58577259" "www.example.com" "arn:aws:acm:us-east-2:123456789012:certificate/12345678-1234-1234-1234-123456789012" 1 2018-07-02T22:22:48.364000Z "authenticate,forward" "-" "-" "10.0.0.1:80" "200" "-" "-""#;

fn app_config(server: &MockServer) -> AppConfig {
    toml::from_str(&format!(
        r#"
        [engine]
        url = "{}"

        [pipeline]
        log_type = "elb"
        index_prefix = "alb-logs"
        document_ids = false
        "#,
        server.uri()
    ))
    .expect("valid test config")
}

fn indexer(engine: EngineConfig) -> Result<BulkIndexer> {
    let retry = RetryController::tokio(RetryPolicy {
        max_attempts: 2,
        backoff: Backoff::Fixed(Duration::from_millis(1)),
        fatal_statuses: Vec::new(),
    });
    Ok(BulkIndexer::new(
        Arc::new(EngineClient::new(engine)?),
        retry,
        Arc::new(BatchSizeController::new(10_000)),
        false,
    ))
}

/// 📦 One line through the parser and a one-record threshold, so exactly one batch falls out.
fn one_batch(app_config: &AppConfig) -> Result<Vec<SourcedRecord>> {
    let records = lgx::parse_text(app_config, ELB_LINE)?;
    assert_eq!(records.len(), 1);
    let mut batcher = RecordBatcher::new(Threshold::count(1));
    let mut batches = Vec::new();
    for sourced in SourcedRecord::from_lines("elb.log", records) {
        let size = record_size(&sourced.record);
        batches.extend(batcher.push(None, sourced, size));
    }
    batches.extend(batcher.finish());
    assert_eq!(batches.len(), 1);
    Ok(batches.remove(0).items)
}

#[tokio::test]
async fn the_one_where_an_alb_line_lands_in_the_index() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alb-logs/_bulk"))
        .and(header("content-type", "application/x-ndjson"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "errors": false, "items": [{ "index": { "status": 201 } }] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app_config = app_config(&server);
    let batch = one_batch(&app_config)?;
    assert_eq!(batch[0].record["elb_status_code"], "200");

    let result = indexer(app_config.engine.clone())?
        .submit(&batch, &app_config.pipeline.index_name())
        .await?;
    assert_eq!(result.succeeded_count(), 1);
    assert!(result.failed.is_empty());
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_engine_refuses_the_record_and_says_why() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alb-logs/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [{ "index": {
                "status": 400,
                "error": { "type": "mapper_parsing_exception", "reason": "failed to parse field [received_bytes]" }
            } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app_config = app_config(&server);
    let batch = one_batch(&app_config)?;
    let result = indexer(app_config.engine.clone())?
        .submit(&batch, &app_config.pipeline.index_name())
        .await?;

    assert_eq!(result.succeeded_count(), 0);
    assert_eq!(result.failed.len(), 1);
    let failed = &result.failed[0];
    assert_eq!(failed.index_name, "alb-logs");
    assert_eq!(failed.error_type, "mapper_parsing_exception");
    assert_eq!(failed.error_reason, "failed to parse field [received_bytes]");
    assert_eq!(failed.record, batch[0].record);
    Ok(())
}
