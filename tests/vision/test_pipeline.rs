// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! End-to-end request tests through `VisionService`

use image::ImageFormat;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use fabstir_vision_node::api::{AnalysisParams, ErrorCode, Operation};
use fabstir_vision_node::config::VisionConfig;

use super::support::{service, test_config, write_image, write_png, MockLoader, MockModel};

#[tokio::test]
async fn test_large_image_is_resized_before_inference() {
    let dir = TempDir::new().unwrap();
    let image = write_image(dir.path(), "wide.jpg", 4000, 3000, ImageFormat::Jpeg);
    let model = Arc::new(MockModel::new());
    let service = service(test_config(), Arc::new(MockLoader::new(model.clone())));

    let result = service.caption_image(&image, "normal", false).await.unwrap();

    assert_eq!(*model.seen_dimensions.lock().unwrap(), vec![(2048, 1536)]);
    assert_eq!(result.metadata.image_width, 2048);
    assert_eq!(result.metadata.image_height, 1536);
    assert_eq!(result.metadata.original_width, 4000);
    assert_eq!(result.metadata.original_height, 3000);
    assert_eq!(result.caption, "a small brown dog sitting on grass");
}

#[tokio::test]
async fn test_small_image_is_not_upscaled() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "tiny.png", 32, 20);
    let model = Arc::new(MockModel::new());
    let service = service(test_config(), Arc::new(MockLoader::new(model.clone())));

    service.query_image(&image, "What color is it?").await.unwrap();
    assert_eq!(*model.seen_dimensions.lock().unwrap(), vec![(32, 20)]);
}

#[tokio::test]
async fn test_detect_with_no_match_returns_empty() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "street.png", 64, 48);
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let result = service.detect_objects(&image, "giraffe").await.unwrap();

    assert!(result.objects.is_empty());
    assert_eq!(result.total_found, 0);
    assert_eq!(result.object_name, "giraffe");
}

#[tokio::test]
async fn test_detect_labels_objects_with_requested_name() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "park.png", 64, 48);
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let result = service.detect_objects(&image, "dog").await.unwrap();

    assert_eq!(result.total_found, 1);
    assert_eq!(result.objects[0].label, "dog");
    let bbox = result.objects[0].bounding_box;
    assert!(bbox.x_min < bbox.x_max && bbox.y_min < bbox.y_max);
}

#[tokio::test]
async fn test_overlong_question_never_reaches_model() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel::new());
    let loader = Arc::new(MockLoader::new(model.clone()));
    let service = service(test_config(), loader.clone());

    let question = "why ".repeat(1250);
    let error = service.query_image(&image, &question).await.unwrap_err();

    assert_eq!(error.code, ErrorCode::ValidationError);
    assert_eq!(error.reason(), Some("TOO_LONG"));
    assert_eq!(model.calls(), 0);
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn test_missing_file_reports_not_found_without_loading() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nowhere.png");
    let loader = Arc::new(MockLoader::new(Arc::new(MockModel::new())));
    let service = service(test_config(), loader.clone());

    let error = service
        .caption_image(missing.to_str().unwrap(), "short", false)
        .await
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::FileNotFound);
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn test_non_image_bytes_are_unsupported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.png");
    std::fs::write(&path, b"just some text, not pixels").unwrap();
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let error = service
        .caption_image(path.to_str().unwrap(), "short", false)
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::UnsupportedFormat);
}

#[tokio::test]
async fn test_invalid_references_and_parameters() {
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let error = service.caption_image("ftp://host/a.png", "short", false).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::ValidationError);
    assert_eq!(error.reason(), Some("INVALID_REFERENCE"));

    let error = service.caption_image("../etc/passwd", "short", false).await.unwrap_err();
    assert_eq!(error.reason(), Some("INVALID_REFERENCE"));

    let error = service.caption_image("/tmp/a.png", "epic", false).await.unwrap_err();
    assert_eq!(error.reason(), Some("INVALID_ENUM"));

    let error = service.detect_objects("/tmp/a.png", "dog\u{7}").await.unwrap_err();
    assert_eq!(error.reason(), Some("INVALID_CHARACTERS"));

    let error = service.query_image("/tmp/a.png", "   ").await.unwrap_err();
    assert_eq!(error.reason(), Some("EMPTY_INPUT"));
}

#[tokio::test]
async fn test_timeout_fires_within_margin_and_frees_slot() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "slow.png", 64, 48);
    let model = Arc::new(MockModel {
        delay: Duration::from_secs(5),
        ..MockModel::new()
    });
    let config = VisionConfig {
        processing_timeout_secs: 1,
        max_concurrent_requests: 2,
        ..test_config()
    };
    let service = service(config, Arc::new(MockLoader::new(model)));

    let started = Instant::now();
    let error = service.query_image(&image, "What is this?").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.code, ErrorCode::ProcessingTimeout);
    assert_eq!(error.context["timeout_ms"], 1000);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert_eq!(service.available_slots(), 2);
}

#[tokio::test]
async fn test_composite_keeps_going_past_failed_step() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel {
        fail_query: true,
        ..MockModel::new()
    });
    let service = service(test_config(), Arc::new(MockLoader::new(model.clone())));

    let params = AnalysisParams {
        question: Some("How many?".to_string()),
        object_name: Some("dog".to_string()),
        operations: Some(vec![
            "caption".to_string(),
            "query".to_string(),
            "detect".to_string(),
        ]),
        ..AnalysisParams::default()
    };
    let result = service.analyze_image(&image, &params).await.unwrap();

    let order: Vec<Operation> = result.results.iter().map(|e| e.operation).collect();
    assert_eq!(order, vec![Operation::Caption, Operation::Query, Operation::Detect]);

    assert!(result.get(Operation::Caption).unwrap().is_success());
    assert!(result.get(Operation::Detect).unwrap().is_success());

    let failed = result.get(Operation::Query).unwrap().error().unwrap();
    assert_eq!(failed.code, ErrorCode::ModelError);
    assert!(!failed.message.contains("0xdeadbeef"));
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn test_composite_requires_operations() {
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let error = service
        .analyze_image("/tmp/a.png", &AnalysisParams::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidRequest);

    let params = AnalysisParams {
        operations: Some(vec!["caption".to_string(), "analyze".to_string()]),
        ..AnalysisParams::default()
    };
    assert!(service.analyze_image("/tmp/a.png", &params).await.is_err());
}

#[tokio::test]
async fn test_params_json_errors_are_invalid_request() {
    let error = AnalysisParams::from_json("{not json").unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidRequest);

    let params = AnalysisParams::from_json(r#"{"question": "What is it?"}"#).unwrap();
    assert_eq!(params.question.as_deref(), Some("What is it?"));
}
