// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod cli;
pub mod config;
pub mod version;
pub mod vision;

// Re-export main types
pub use api::{AnalysisParams, AnalysisResult, BatchResult, ErrorCode, ErrorResult, Operation};
pub use config::VisionConfig;
pub use vision::{ModelLoader, VisionModel, VisionService, VlmSidecarLoader};
