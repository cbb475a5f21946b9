// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Batch fan-out tests

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use fabstir_vision_node::api::{AnalysisParams, AnalysisResult, ErrorCode, Operation};
use fabstir_vision_node::config::VisionConfig;

use super::support::{service, test_config, write_png, MockLoader, MockModel};

#[tokio::test]
async fn test_batch_preserves_order_and_isolates_failures() {
    let dir = TempDir::new().unwrap();
    let slow = write_png(dir.path(), "slow.png", 64, 48);
    let missing = dir.path().join("missing.png").to_string_lossy().into_owned();
    let fast = write_png(dir.path(), "fast.png", 32, 24);

    let model = Arc::new(MockModel {
        slow_width: Some(64),
        slow_delay: Duration::from_millis(300),
        ..MockModel::new()
    });
    let service = service(test_config(), Arc::new(MockLoader::new(model)));

    let refs = vec![slow.clone(), missing.clone(), fast.clone()];
    let batch = service
        .batch_analyze(&refs, "caption", &AnalysisParams::default())
        .await
        .unwrap();

    assert_eq!(batch.operation, Operation::Caption);
    let order: Vec<&str> = batch.items.iter().map(|i| i.image_reference.as_str()).collect();
    assert_eq!(order, vec![slow.as_str(), missing.as_str(), fast.as_str()]);

    assert!(batch.items[0].outcome.is_success());
    assert_eq!(
        batch.items[1].outcome.error().unwrap().code,
        ErrorCode::FileNotFound
    );
    match batch.items[2].outcome.result().unwrap() {
        AnalysisResult::Caption(caption) => assert_eq!(caption.metadata.image_width, 32),
        other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(batch.summary.succeeded_count, 2);
    assert_eq!(batch.summary.failed_count, 1);
    assert_eq!(
        batch.summary.succeeded_count + batch.summary.failed_count,
        refs.len()
    );
}

#[tokio::test]
async fn test_batch_respects_concurrency_gate() {
    let dir = TempDir::new().unwrap();
    let refs: Vec<String> = (0..6)
        .map(|i| write_png(dir.path(), &format!("img{}.png", i), 16, 16))
        .collect();
    let model = Arc::new(MockModel {
        delay: Duration::from_millis(100),
        ..MockModel::new()
    });
    let config = VisionConfig {
        max_concurrent_requests: 2,
        ..test_config()
    };
    let service = service(config, Arc::new(MockLoader::new(model.clone())));

    let batch = service
        .batch_analyze(&refs, "detect", &AnalysisParams::object("dog"))
        .await
        .unwrap();

    assert_eq!(batch.summary.succeeded_count, 6);
    assert!(model.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(service.available_slots(), 2);
}

#[tokio::test]
async fn test_batch_list_limits() {
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let error = service
        .batch_analyze(&[], "caption", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ValidationError);
    assert_eq!(error.reason(), Some("EMPTY_INPUT"));

    let refs: Vec<String> = (0..11).map(|i| format!("/tmp/{}.png", i)).collect();
    let error = service
        .batch_analyze(&refs, "caption", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ValidationError);
    assert_eq!(error.reason(), Some("TOO_MANY_ITEMS"));
}

#[tokio::test]
async fn test_batch_rejects_bad_operation_and_shared_params() {
    let loader = Arc::new(MockLoader::new(Arc::new(MockModel::new())));
    let service = service(test_config(), loader.clone());
    let refs = vec!["/tmp/a.png".to_string()];

    let error = service
        .batch_analyze(&refs, "batch", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidRequest);

    let error = service
        .batch_analyze(&refs, "segment", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.reason(), Some("INVALID_ENUM"));

    // Missing question fails the whole batch up front
    let error = service
        .batch_analyze(&refs, "query", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidRequest);
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn test_batch_echoes_parameters() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "a.png", 16, 16);
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let batch = service
        .batch_analyze(&[image], "QUERY", &AnalysisParams::question("What is it?"))
        .await
        .unwrap();

    assert_eq!(batch.operation, Operation::Query);
    assert_eq!(batch.parameters.question.as_deref(), Some("What is it?"));

    let json = serde_json::to_value(&batch).unwrap();
    assert_eq!(json["items"][0]["outcome"]["status"], "success");
    assert_eq!(json["summary"]["succeeded_count"], 1);
}
