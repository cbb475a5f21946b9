// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod errors;
pub mod request;
pub mod response_formatter;
pub mod results;

pub use errors::{ErrorCode, ErrorResult, ValidationKind, VisionError};
pub use request::{
    AnalysisParams, AnalysisRequest, AnalysisTask, CaptionLength, ImageRef, Operation, RefKind,
};
pub use response_formatter::{
    batch_to_tool_json, error_to_tool_json, to_tool_json, FormatContext, ResultFormatter,
};
pub use results::{
    AnalysisResult, BatchItem, BatchResult, BatchSummary, BoundingBox, CaptionResult,
    CompositeEntry, CompositeResult, DetectedObject, DetectionResult, Outcome, Point,
    PointingResult, QueryResult, ResultMetadata,
};
