// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shapes dispatch outcomes into public results and errors
//!
//! Every failure leaving the crate passes through `ResultFormatter::format_error`,
//! which uses `VisionError::code()` for the code and only the error's public
//! message for the text.

use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::api::errors::{ErrorCode, ErrorResult, VisionError};
use crate::api::request::{AnalysisTask, CaptionLength, Operation};
use crate::api::results::{
    AnalysisResult, BatchResult, CaptionResult, CompositeEntry, CompositeResult, DetectedObject,
    DetectionResult, PointingResult, QueryResult, ResultMetadata,
};
use crate::config::VisionConfig;
use crate::vision::dispatcher::{Dispatch, DispatchOutput};
use crate::vision::image_utils::DecodedImage;
use crate::vision::validation::sanitize_string;

const MESSAGE_MAX_LEN: usize = 500;
const REFERENCE_ECHO_LEN: usize = 512;

/// Per-request facts attached to results and errors
#[derive(Debug, Clone)]
pub struct FormatContext {
    pub operation: Operation,
    pub image_reference: Option<String>,
    pub started: Instant,
}

impl FormatContext {
    pub fn new(operation: Operation, image_reference: Option<&str>) -> Self {
        Self {
            operation,
            image_reference: image_reference.map(|r| sanitize_string(r, REFERENCE_ECHO_LEN)),
            started: Instant::now(),
        }
    }

    pub fn for_operation(&self, operation: Operation) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone)]
pub struct ResultFormatter {
    max_question_length: usize,
    max_object_name_length: usize,
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(&VisionConfig::default())
    }
}

impl ResultFormatter {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            max_question_length: config.max_question_length,
            max_object_name_length: config.max_object_name_length,
        }
    }

    /// Metadata describing the image the model saw
    pub fn metadata(
        &self,
        ctx: &FormatContext,
        image: &DecodedImage,
        dispatch: Option<&Dispatch>,
    ) -> ResultMetadata {
        ResultMetadata {
            image_reference: ctx.image_reference.clone().unwrap_or_default(),
            image_width: image.width,
            image_height: image.height,
            original_width: image.original_width,
            original_height: image.original_height,
            device: dispatch.map(|d| d.device.to_string()),
            model: dispatch.map(|d| d.model.to_string()),
        }
    }

    /// Format a successful dispatch
    pub fn format_success(
        &self,
        task: &AnalysisTask,
        dispatch: Dispatch,
        image: &DecodedImage,
        ctx: &FormatContext,
    ) -> Result<AnalysisResult, ErrorResult> {
        let metadata = self.metadata(ctx, image, Some(&dispatch));
        let elapsed = ctx.started.elapsed();
        self.shape(task, dispatch.output, metadata, elapsed, ctx)
    }

    /// Format a caption assembled from a stream
    pub fn format_caption(
        &self,
        caption: String,
        length: CaptionLength,
        metadata: ResultMetadata,
        ctx: &FormatContext,
    ) -> AnalysisResult {
        AnalysisResult::Caption(CaptionResult {
            caption: caption.trim().to_string(),
            length,
            processing_time_ms: ctx.elapsed_ms(),
            metadata,
        })
    }

    fn shape(
        &self,
        task: &AnalysisTask,
        output: DispatchOutput,
        metadata: ResultMetadata,
        elapsed: Duration,
        ctx: &FormatContext,
    ) -> Result<AnalysisResult, ErrorResult> {
        let processing_time_ms = elapsed.as_millis() as u64;

        let result = match (task, output) {
            (AnalysisTask::Caption { length, .. }, DispatchOutput::Caption(caption)) => {
                AnalysisResult::Caption(CaptionResult {
                    caption: caption.trim().to_string(),
                    length: *length,
                    processing_time_ms,
                    metadata,
                })
            }
            (AnalysisTask::Query { question }, DispatchOutput::Answer(answer)) => {
                AnalysisResult::Query(QueryResult {
                    answer: answer.trim().to_string(),
                    question: sanitize_string(question, self.max_question_length),
                    processing_time_ms,
                    metadata,
                })
            }
            (AnalysisTask::Detect { object_name }, DispatchOutput::Detections(detections)) => {
                let label = sanitize_string(object_name, self.max_object_name_length);
                let objects: Vec<DetectedObject> = detections
                    .into_iter()
                    .map(|d| DetectedObject {
                        label: label.clone(),
                        bounding_box: d.bounding_box,
                        confidence: d.confidence,
                    })
                    .collect();
                AnalysisResult::Detection(DetectionResult {
                    object_name: label,
                    total_found: objects.len(),
                    objects,
                    processing_time_ms,
                    metadata,
                })
            }
            (AnalysisTask::Point { object_name }, DispatchOutput::Points(points)) => {
                AnalysisResult::Pointing(PointingResult {
                    object_name: sanitize_string(object_name, self.max_object_name_length),
                    total_found: points.len(),
                    points,
                    processing_time_ms,
                    metadata,
                })
            }
            (AnalysisTask::Analyze { tasks }, DispatchOutput::Composite(steps)) => {
                let mut results = Vec::with_capacity(steps.len());
                for (sub_task, step) in tasks.iter().zip(steps) {
                    let sub_ctx = ctx.for_operation(step.operation);
                    let outcome = match step.result {
                        Ok(output) => self.shape(
                            sub_task,
                            output,
                            metadata.clone(),
                            step.elapsed,
                            &sub_ctx,
                        ),
                        Err(e) => Err(self.format_error(&e, &sub_ctx)),
                    };
                    results.push(CompositeEntry {
                        operation: step.operation,
                        outcome: outcome.into(),
                    });
                }
                AnalysisResult::Composite(CompositeResult {
                    results,
                    processing_time_ms,
                    metadata,
                })
            }
            (task, _) => {
                let error = VisionError::Unknown {
                    detail: format!("output does not match {} task", task.operation()),
                };
                return Err(self.format_error(&error, ctx));
            }
        };

        Ok(result)
    }

    /// Classify a failure into a sanitized `ErrorResult`
    pub fn format_error(&self, error: &VisionError, ctx: &FormatContext) -> ErrorResult {
        let code = error.code();
        let elapsed_ms = ctx.elapsed_ms();

        match error.detail() {
            Some(detail) => warn!(
                operation = %ctx.operation,
                code = %code,
                elapsed_ms,
                "Request failed: {}",
                detail
            ),
            None => warn!(
                operation = %ctx.operation,
                code = %code,
                elapsed_ms,
                "Request failed: {}",
                error
            ),
        }

        let message = sanitize_string(&error.to_string(), MESSAGE_MAX_LEN);
        let mut result = ErrorResult::new(code, message)
            .with_context("operation", ctx.operation.as_str())
            .with_context("elapsed_ms", elapsed_ms);

        if let Some(reference) = &ctx.image_reference {
            result = result.with_context("image_reference", reference.as_str());
        }

        match error {
            VisionError::Validation { kind, field, .. } => {
                result = result
                    .with_context("reason", kind.as_str())
                    .with_context("field", *field);
            }
            VisionError::Timeout(limit) => {
                result = result.with_context("timeout_ms", limit.as_millis() as u64);
            }
            VisionError::FileTooLarge { limit_bytes, .. } => {
                result = result.with_context("limit_bytes", *limit_bytes);
            }
            _ => {}
        }

        result
    }
}

/// Render an outcome in the tool envelope
///
/// Success is the result object plus `"success": true`; failure is
/// `{"success": false, "error_code", "error_message", "context"}`.
pub fn to_tool_json(outcome: &Result<AnalysisResult, ErrorResult>) -> Value {
    match outcome {
        Ok(result) => success_json(result),
        Err(error) => error_to_tool_json(error),
    }
}

/// Render a batch in the tool envelope
pub fn batch_to_tool_json(outcome: &Result<BatchResult, ErrorResult>) -> Value {
    match outcome {
        Ok(batch) => success_json(batch),
        Err(error) => error_to_tool_json(error),
    }
}

pub fn error_to_tool_json(error: &ErrorResult) -> Value {
    json!({
        "success": false,
        "error_code": error.code,
        "error_message": error.message,
        "context": error.context,
    })
}

fn success_json<T: serde::Serialize>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.insert("success".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(_) => error_to_tool_json(&ErrorResult::new(
            ErrorCode::UnknownError,
            "Result could not be serialized",
        )),
    }
}
