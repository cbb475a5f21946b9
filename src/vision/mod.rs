// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Vision-language inference orchestration
//!
//! This module provides:
//! - Input validation and image acquisition/normalization
//! - Lazy lifecycle management of the shared model handle
//! - Deadline-bounded dispatch behind a concurrency gate
//! - Order-preserving batch fan-out with per-item failure isolation
//!
//! `VisionService` is the entry point; the model itself sits behind the
//! `VisionModel`/`ModelLoader` traits.

pub mod acquire;
pub mod backend;
pub mod batch;
pub mod device;
pub mod dispatcher;
pub mod gate;
#[cfg(test)]
pub(crate) mod http_fixture;
pub mod image_utils;
pub mod model_manager;
pub mod pipeline;
pub mod service;
pub mod validation;
pub mod vlm_client;

pub use acquire::ImageAcquirer;
pub use backend::{Detection, ModelLoader, VisionModel};
pub use device::{select_device, Device, DeviceAvailability};
pub use dispatcher::{CaptionStream, Dispatch, DispatchOutput, Dispatcher};
pub use gate::{ConcurrencyGate, GatePermit};
pub use image_utils::{decode_and_normalize, detect_format, ColorMode, DecodedImage};
pub use model_manager::{ModelHandle, ModelManager, ModelState, ModelStatus};
pub use service::{CaptionStreamSession, VisionService};
pub use vlm_client::{VlmClient, VlmSidecarLoader, VlmSidecarModel};
