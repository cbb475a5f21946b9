// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod vision;

pub use vision::{DevicePreference, ModelIdentity, VisionConfig, MAX_BATCH_SIZE_LIMIT};
