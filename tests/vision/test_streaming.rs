// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Streamed caption tests

use futures::StreamExt;
use image::ImageFormat;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use fabstir_vision_node::api::{CaptionLength, ErrorCode};
use fabstir_vision_node::config::VisionConfig;
use fabstir_vision_node::vision::{
    ColorMode, ConcurrencyGate, DecodedImage, DeviceAvailability, Dispatcher, ModelManager,
};

use super::support::{service, test_config, write_png, MockLoader, MockModel};

#[tokio::test]
async fn test_stream_fragments_assemble_full_caption() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let mut session = service.caption_image_stream(&image, "short").await.unwrap();
    let mut fragments = Vec::new();
    while let Some(fragment) = session.next_fragment().await {
        fragments.push(fragment);
    }
    assert!(fragments.len() > 1);
    assert_eq!(session.metadata().device.as_deref(), Some("cpu"));

    let result = service.finish_stream(session).await.unwrap();
    let caption = match result {
        fabstir_vision_node::AnalysisResult::Caption(caption) => caption,
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(caption.caption, fragments.concat());
    assert_eq!(caption.length, CaptionLength::Short);
}

#[tokio::test]
async fn test_streamed_and_direct_captions_match() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let direct = service.caption_image(&image, "normal", false).await.unwrap();
    let streamed = service.caption_image(&image, "normal", true).await.unwrap();
    assert_eq!(direct.caption, streamed.caption);
}

#[tokio::test]
async fn test_dropping_stream_frees_gate_slot() {
    let dir = TempDir::new().unwrap();
    let image = write_png(dir.path(), "dog.png", 64, 48);
    let config = VisionConfig {
        max_concurrent_requests: 1,
        ..test_config()
    };
    let service = service(config, Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let mut session = service.caption_image_stream(&image, "short").await.unwrap();
    assert!(session.next_fragment().await.is_some());
    assert_eq!(service.available_slots(), 0);

    drop(session);
    assert_eq!(service.available_slots(), 1);

    let answer = tokio::time::timeout(
        Duration::from_secs(5),
        service.query_image(&image, "What is this?"),
    )
    .await
    .expect("gate slot should be free");
    assert!(answer.is_ok());
}

#[tokio::test]
async fn test_stream_validation_happens_before_start() {
    let service = service(test_config(), Arc::new(MockLoader::new(Arc::new(MockModel::new()))));

    let error = service
        .caption_image_stream("/tmp/a.png", "novel")
        .await
        .err()
        .unwrap();
    assert_eq!(error.code, ErrorCode::ValidationError);
    assert_eq!(error.reason(), Some("INVALID_ENUM"));
}

fn blank_image() -> Arc<DecodedImage> {
    Arc::new(DecodedImage {
        width: 4,
        height: 4,
        color_mode: ColorMode::Rgb8,
        pixels: vec![0; 48],
        source_format: ImageFormat::Png,
        original_width: 4,
        original_height: 4,
    })
}

#[tokio::test]
async fn test_caption_stream_as_futures_stream() {
    let loader = Arc::new(MockLoader::new(Arc::new(MockModel::new())));
    let manager = Arc::new(ModelManager::with_availability(
        &test_config(),
        loader,
        DeviceAvailability::cpu_only(),
    ));
    let dispatcher = Dispatcher::new(manager, Duration::from_secs(5));
    let gate = ConcurrencyGate::new(1);

    let permit = gate.acquire().await.unwrap();
    let stream = dispatcher
        .caption_stream(blank_image(), CaptionLength::Detailed, permit)
        .await
        .unwrap();

    let fragments: Vec<String> = stream
        .into_stream()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(fragments.concat(), "a small brown dog sitting on grass");
    assert_eq!(gate.available(), 1);
}

#[tokio::test]
async fn test_caption_stream_deadline() {
    let model = Arc::new(MockModel {
        delay: Duration::from_secs(5),
        ..MockModel::new()
    });
    let manager = Arc::new(ModelManager::with_availability(
        &test_config(),
        Arc::new(MockLoader::new(model)),
        DeviceAvailability::cpu_only(),
    ));
    let dispatcher = Dispatcher::new(manager, Duration::from_millis(200));
    let gate = ConcurrencyGate::new(1);

    let permit = gate.acquire().await.unwrap();
    let stream = dispatcher
        .caption_stream(blank_image(), CaptionLength::Short, permit)
        .await
        .unwrap();

    let error = stream.collect_text().await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::ProcessingTimeout);
    assert_eq!(gate.available(), 1);
}
