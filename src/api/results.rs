// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Analysis result types

use serde::{Deserialize, Serialize};

use crate::api::errors::ErrorResult;
use crate::api::request::{AnalysisParams, CaptionLength, Operation};

/// Axis-aligned box in normalized image coordinates (0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y_max - self.y_min).max(0.0)
    }
}

/// Point in normalized image coordinates (0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// A detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub bounding_box: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Diagnostic metadata attached to every result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub image_reference: String,
    /// Dimensions after normalization (what the model saw)
    pub image_width: u32,
    pub image_height: u32,
    /// Dimensions as decoded, before any resize
    pub original_width: u32,
    pub original_height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionResult {
    pub caption: String,
    pub length: CaptionLength,
    pub processing_time_ms: u64,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub question: String,
    pub processing_time_ms: u64,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub object_name: String,
    pub objects: Vec<DetectedObject>,
    pub total_found: usize,
    pub processing_time_ms: u64,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointingResult {
    pub object_name: String,
    pub points: Vec<Point>,
    pub total_found: usize,
    pub processing_time_ms: u64,
    pub metadata: ResultMetadata,
}

/// One sub-operation of a composite analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeEntry {
    pub operation: Operation,
    pub outcome: Outcome,
}

/// Composite analysis: sub-results in requested order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeResult {
    pub results: Vec<CompositeEntry>,
    pub processing_time_ms: u64,
    pub metadata: ResultMetadata,
}

impl CompositeResult {
    pub fn get(&self, operation: Operation) -> Option<&Outcome> {
        self.results
            .iter()
            .find(|entry| entry.operation == operation)
            .map(|entry| &entry.outcome)
    }
}

/// Successful analysis, one variant per operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisResult {
    Caption(CaptionResult),
    Query(QueryResult),
    Detection(DetectionResult),
    Pointing(PointingResult),
    Composite(CompositeResult),
}

impl AnalysisResult {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Caption(_) => Operation::Caption,
            Self::Query(_) => Operation::Query,
            Self::Detection(_) => Operation::Detect,
            Self::Pointing(_) => Operation::Point,
            Self::Composite(_) => Operation::Analyze,
        }
    }

    pub fn processing_time_ms(&self) -> u64 {
        match self {
            Self::Caption(r) => r.processing_time_ms,
            Self::Query(r) => r.processing_time_ms,
            Self::Detection(r) => r.processing_time_ms,
            Self::Pointing(r) => r.processing_time_ms,
            Self::Composite(r) => r.processing_time_ms,
        }
    }
}

/// Exactly one of a result or an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { result: AnalysisResult },
    Failure { error: ErrorResult },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            Self::Success { result } => Some(result),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorResult> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }
}

impl From<Result<AnalysisResult, ErrorResult>> for Outcome {
    fn from(value: Result<AnalysisResult, ErrorResult>) -> Self {
        match value {
            Ok(result) => Self::Success { result },
            Err(error) => Self::Failure { error },
        }
    }
}

impl From<Outcome> for Result<AnalysisResult, ErrorResult> {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Success { result } => Ok(result),
            Outcome::Failure { error } => Err(error),
        }
    }
}

/// Per-image entry in a batch, in submission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub image_reference: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub total_elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub operation: Operation,
    pub parameters: AnalysisParams,
    pub items: Vec<BatchItem>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
