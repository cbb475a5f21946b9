// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! `VisionService`: the operations exposed to callers
//!
//! Every method returns either its result type or a sanitized `ErrorResult`.

use std::sync::Arc;
use tracing::info;

use super::backend::ModelLoader;
use super::batch::BatchOrchestrator;
use super::device::DeviceAvailability;
use super::dispatcher::CaptionStream;
use super::model_manager::{ModelManager, ModelStatus};
use super::pipeline::AnalysisPipeline;
use super::validation::{validate_caption_length, validate_operation};
use crate::api::errors::{ErrorResult, VisionError};
use crate::api::request::{AnalysisParams, CaptionLength, Operation};
use crate::api::response_formatter::FormatContext;
use crate::api::results::{
    AnalysisResult, BatchResult, CaptionResult, CompositeResult, DetectionResult, PointingResult,
    QueryResult, ResultMetadata,
};
use crate::config::VisionConfig;

/// A caption stream plus what is needed to format its final result
///
/// Fragments read through `next_fragment` are kept, so `finish_stream`
/// always returns the whole caption.
pub struct CaptionStreamSession {
    stream: CaptionStream,
    metadata: ResultMetadata,
    ctx: FormatContext,
    text: String,
    error: Option<VisionError>,
}

impl CaptionStreamSession {
    /// Next fragment, or `None` when the caption is complete or failed
    pub async fn next_fragment(&mut self) -> Option<String> {
        if self.error.is_some() {
            return None;
        }
        match self.stream.next().await? {
            Ok(fragment) => {
                self.text.push_str(&fragment);
                Some(fragment)
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    pub fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Text received so far
    pub fn text(&self) -> &str {
        &self.text
    }
}

pub struct VisionService {
    config: VisionConfig,
    manager: Arc<ModelManager>,
    pipeline: Arc<AnalysisPipeline>,
    batch: BatchOrchestrator,
}

impl VisionService {
    pub fn new(config: VisionConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, VisionError> {
        Self::with_availability(config, loader, DeviceAvailability::detect())
    }

    /// Build a service with a fixed view of available accelerators
    pub fn with_availability(
        config: VisionConfig,
        loader: Arc<dyn ModelLoader>,
        availability: DeviceAvailability,
    ) -> Result<Self, VisionError> {
        config
            .validate()
            .map_err(|e| VisionError::InvalidRequest(format!("invalid configuration: {}", e)))?;

        let manager = Arc::new(ModelManager::with_availability(&config, loader, availability));
        let pipeline = Arc::new(AnalysisPipeline::new(&config, Arc::clone(&manager))?);
        let batch = BatchOrchestrator::new(Arc::clone(&pipeline));

        info!(
            model = %config.model,
            device = %config.device,
            max_concurrent = config.max_concurrent_requests,
            "Vision service configured"
        );

        Ok(Self {
            config,
            manager,
            pipeline,
            batch,
        })
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    /// Free slots on the concurrency gate
    pub fn available_slots(&self) -> usize {
        self.pipeline.gate().available()
    }

    /// Classify an error raised outside the pipeline
    pub fn error_result(
        &self,
        operation: Operation,
        reference: Option<&str>,
        e: VisionError,
    ) -> ErrorResult {
        self.pipeline
            .formatter()
            .format_error(&e, &FormatContext::new(operation, reference))
    }

    fn unexpected(&self, operation: Operation, result: AnalysisResult) -> ErrorResult {
        let e = VisionError::Unknown {
            detail: format!("{} produced a {} result", operation, result.operation()),
        };
        self.error_result(operation, None, e)
    }

    /// Run any per-image operation
    pub async fn run(
        &self,
        image: &str,
        operation: Operation,
        params: &AnalysisParams,
    ) -> Result<AnalysisResult, ErrorResult> {
        self.pipeline.run(image, operation, params).await
    }

    /// Caption an image; with `stream` the text is produced incrementally
    /// and assembled before returning
    pub async fn caption_image(
        &self,
        image: &str,
        length: &str,
        stream: bool,
    ) -> Result<CaptionResult, ErrorResult> {
        let result = if stream {
            let session = self.caption_image_stream(image, length).await?;
            self.finish_stream(session).await?
        } else {
            let params = AnalysisParams {
                length: Some(length.to_string()),
                ..AnalysisParams::default()
            };
            self.pipeline.run(image, Operation::Caption, &params).await?
        };

        match result {
            AnalysisResult::Caption(caption) => Ok(caption),
            other => Err(self.unexpected(Operation::Caption, other)),
        }
    }

    /// Start a streamed caption
    pub async fn caption_image_stream(
        &self,
        image: &str,
        length: &str,
    ) -> Result<CaptionStreamSession, ErrorResult> {
        let length: CaptionLength = validate_caption_length(length)
            .map_err(|e| self.error_result(Operation::Caption, Some(image), e))?;
        let (stream, ctx, metadata) = self.pipeline.caption_stream(image, length).await?;
        Ok(CaptionStreamSession {
            stream,
            metadata,
            ctx,
            text: String::new(),
            error: None,
        })
    }

    /// Drain a stream session into its final result
    pub async fn finish_stream(
        &self,
        mut session: CaptionStreamSession,
    ) -> Result<AnalysisResult, ErrorResult> {
        while session.next_fragment().await.is_some() {}

        let formatter = self.pipeline.formatter();
        match session.error {
            Some(e) => Err(formatter.format_error(&e, &session.ctx)),
            None => Ok(formatter.format_caption(
                session.text,
                session.stream.length(),
                session.metadata,
                &session.ctx,
            )),
        }
    }

    pub async fn query_image(
        &self,
        image: &str,
        question: &str,
    ) -> Result<QueryResult, ErrorResult> {
        let params = AnalysisParams::question(question);
        match self.pipeline.run(image, Operation::Query, &params).await? {
            AnalysisResult::Query(result) => Ok(result),
            other => Err(self.unexpected(Operation::Query, other)),
        }
    }

    pub async fn detect_objects(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<DetectionResult, ErrorResult> {
        let params = AnalysisParams::object(object_name);
        match self.pipeline.run(image, Operation::Detect, &params).await? {
            AnalysisResult::Detection(result) => Ok(result),
            other => Err(self.unexpected(Operation::Detect, other)),
        }
    }

    pub async fn point_objects(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<PointingResult, ErrorResult> {
        let params = AnalysisParams::object(object_name);
        match self.pipeline.run(image, Operation::Point, &params).await? {
            AnalysisResult::Pointing(result) => Ok(result),
            other => Err(self.unexpected(Operation::Point, other)),
        }
    }

    /// Composite analysis; `params.operations` lists the sub-operations in order
    pub async fn analyze_image(
        &self,
        image: &str,
        params: &AnalysisParams,
    ) -> Result<CompositeResult, ErrorResult> {
        match self.pipeline.run(image, Operation::Analyze, params).await? {
            AnalysisResult::Composite(result) => Ok(result),
            other => Err(self.unexpected(Operation::Analyze, other)),
        }
    }

    /// Run one operation against up to `max_batch_size` images
    pub async fn batch_analyze(
        &self,
        images: &[String],
        operation: &str,
        params: &AnalysisParams,
    ) -> Result<BatchResult, ErrorResult> {
        let operation = validate_operation(operation)
            .map_err(|e| self.error_result(Operation::Batch, None, e))?;
        self.batch.run(images, operation, params).await
    }

    pub fn model_status(&self) -> ModelStatus {
        self.manager.status()
    }

    /// Release the model; safe to call repeatedly
    pub async fn cleanup(&self) {
        self.manager.cleanup().await;
    }

    /// Leave FAILED so the next request attempts a fresh load
    pub async fn reset(&self) {
        self.manager.reset().await;
    }
}
