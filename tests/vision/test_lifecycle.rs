// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model lifecycle tests: lazy load, shared load, FAILED and teardown

use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use fabstir_vision_node::api::ErrorCode;
use fabstir_vision_node::vision::{Device, ModelState};

use super::support::{service, test_config, write_png, MockLoader, MockModel};

#[tokio::test]
async fn test_model_not_loaded_until_first_request() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let loader = Arc::new(MockLoader::new(Arc::new(MockModel::new())));
    let service = service(test_config(), loader.clone());

    assert_eq!(service.model_status().state, ModelState::Unloaded);
    assert_eq!(loader.loads(), 0);

    service.query_image(&image, "How many dogs?").await.unwrap();

    let status = service.model_status();
    assert_eq!(status.state, ModelState::Ready);
    assert_eq!(status.device, Some(Device::Cpu));
    assert_eq!(status.load_attempts, 1);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_concurrent_first_requests_share_one_load() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel::new());
    let loader = Arc::new(MockLoader::new(model.clone()).with_delay(Duration::from_millis(200)));
    let service = service(test_config(), loader.clone());

    let requests = (0..8).map(|_| service.query_image(&image, "What is this?"));
    let results = join_all(requests).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(loader.loads(), 1);
    assert_eq!(model.calls(), 8);
    assert_eq!(service.model_status().state, ModelState::Ready);
}

#[tokio::test]
async fn test_failed_load_is_terminal_until_reset() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel::new());
    let loader = Arc::new(MockLoader::new(model.clone()).failing());
    let service = service(test_config(), loader.clone());

    let first = service.detect_objects(&image, "dog").await.unwrap_err();
    assert_eq!(first.code, ErrorCode::ModelError);
    assert_eq!(service.model_status().state, ModelState::Failed);

    // No second load attempt while FAILED
    let second = service.detect_objects(&image, "dog").await.unwrap_err();
    assert_eq!(second.code, ErrorCode::ModelError);
    assert_eq!(loader.loads(), 1);
    assert_eq!(model.calls(), 0);

    loader.fail.store(false, Ordering::SeqCst);
    service.reset().await;
    assert_eq!(service.model_status().state, ModelState::Unloaded);

    let result = service.detect_objects(&image, "dog").await.unwrap();
    assert_eq!(result.total_found, 1);
    assert_eq!(loader.loads(), 2);
    assert_eq!(service.model_status().load_attempts, 2);
}

#[tokio::test]
async fn test_load_failure_detail_never_reaches_caller() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let loader = Arc::new(MockLoader::new(Arc::new(MockModel::new())).failing());
    let service = service(test_config(), loader);

    let error = service.caption_image(&image, "short", false).await.unwrap_err();
    let json = serde_json::to_string(&error).unwrap();

    assert_eq!(error.code, ErrorCode::ModelError);
    assert!(!json.contains("CUDA"));
    assert!(!json.contains("/opt/weights"));
}

#[tokio::test]
async fn test_cleanup_releases_once_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel::new());
    let loader = Arc::new(MockLoader::new(model.clone()));
    let service = service(test_config(), loader.clone());

    // Cleanup before any load is a no-op
    service.cleanup().await;
    assert_eq!(model.releases.load(Ordering::SeqCst), 0);

    service.point_objects(&image, "dog").await.unwrap();
    assert_eq!(service.model_status().state, ModelState::Ready);

    service.cleanup().await;
    service.cleanup().await;
    assert_eq!(model.releases.load(Ordering::SeqCst), 1);
    assert_eq!(service.model_status().state, ModelState::Unloaded);

    // Next request loads again
    service.point_objects(&image, "dog").await.unwrap();
    assert_eq!(loader.loads(), 2);
}

#[tokio::test]
async fn test_cleanup_waits_for_in_flight_load() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let model = Arc::new(MockModel::new());
    let loader = Arc::new(MockLoader::new(model.clone()).with_delay(Duration::from_millis(200)));
    let service = Arc::new(service(test_config(), loader));

    let request = {
        let service = Arc::clone(&service);
        let image = image.clone();
        tokio::spawn(async move { service.query_image(&image, "What is this?").await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while service.model_status().state != ModelState::Loading {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("load should start");

    service.cleanup().await;
    assert_ne!(service.model_status().state, ModelState::Loading);

    // The request either won the race or saw the teardown; either way it finished
    let _ = request.await.unwrap();
}
