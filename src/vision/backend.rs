// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model capability boundary
//!
//! The model is opaque to the rest of the crate: given a normalized image and
//! an instruction it returns text, boxes or points. Implementations own their
//! weights or remote connection; the lifecycle manager owns the implementation.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::Device;
use super::image_utils::DecodedImage;
use crate::api::request::CaptionLength;
use crate::api::results::{BoundingBox, Point};
use crate::config::ModelIdentity;

/// Raw detection returned by a backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub confidence: Option<f32>,
}

impl Detection {
    pub fn new(bounding_box: BoundingBox) -> Self {
        Self {
            bounding_box,
            confidence: None,
        }
    }
}

/// A loaded vision-language model
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn caption(&self, image: &DecodedImage, length: CaptionLength) -> Result<String>;

    /// Emit caption fragments into `sink` as they are produced
    ///
    /// Implementations stop producing once `sink` is closed. The default
    /// generates the full caption and replays it word by word.
    async fn caption_stream(
        &self,
        image: &DecodedImage,
        length: CaptionLength,
        sink: mpsc::Sender<String>,
    ) -> Result<()> {
        let caption = self.caption(image, length).await?;
        for fragment in caption.split_inclusive(' ') {
            if sink.send(fragment.to_string()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn query(&self, image: &DecodedImage, question: &str) -> Result<String>;

    async fn detect(&self, image: &DecodedImage, object_name: &str) -> Result<Vec<Detection>>;

    async fn point(&self, image: &DecodedImage, object_name: &str) -> Result<Vec<Point>>;

    /// Release device memory held by the model
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Loads a model onto a device
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, identity: &ModelIdentity, device: Device) -> Result<Arc<dyn VisionModel>>;
}
