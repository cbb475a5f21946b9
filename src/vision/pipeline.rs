// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Single-request pipeline
//!
//! validate -> acquire -> gate -> dispatch -> release -> format

use std::sync::Arc;
use tracing::{debug, info};

use super::acquire::ImageAcquirer;
use super::dispatcher::{CaptionStream, Dispatcher};
use super::gate::ConcurrencyGate;
use super::model_manager::ModelManager;
use super::validation::{validate_image_reference, validate_task, ValidationLimits};
use crate::api::errors::{ErrorResult, VisionError};
use crate::api::request::{AnalysisParams, AnalysisRequest, AnalysisTask, CaptionLength, Operation};
use crate::api::response_formatter::{FormatContext, ResultFormatter};
use crate::api::results::{AnalysisResult, ResultMetadata};
use crate::config::VisionConfig;

pub struct AnalysisPipeline {
    limits: ValidationLimits,
    acquirer: ImageAcquirer,
    gate: ConcurrencyGate,
    manager: Arc<ModelManager>,
    dispatcher: Dispatcher,
    formatter: ResultFormatter,
}

impl AnalysisPipeline {
    pub fn new(config: &VisionConfig, manager: Arc<ModelManager>) -> Result<Self, VisionError> {
        Ok(Self {
            limits: ValidationLimits::from(config),
            acquirer: ImageAcquirer::new(config)?,
            gate: ConcurrencyGate::new(config.max_concurrent_requests),
            dispatcher: Dispatcher::new(Arc::clone(&manager), config.processing_timeout()),
            manager,
            formatter: ResultFormatter::new(config),
        })
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn formatter(&self) -> &ResultFormatter {
        &self.formatter
    }

    /// Validate a raw request without touching I/O or the model
    pub fn validate(
        &self,
        reference: &str,
        operation: Operation,
        params: &AnalysisParams,
    ) -> Result<AnalysisRequest, VisionError> {
        let image = validate_image_reference(reference)?;
        let task = validate_task(operation, params, &self.limits)?;
        Ok(AnalysisRequest { image, task })
    }

    /// Validate and run one request
    pub async fn run(
        &self,
        reference: &str,
        operation: Operation,
        params: &AnalysisParams,
    ) -> Result<AnalysisResult, ErrorResult> {
        let ctx = FormatContext::new(operation, Some(reference));
        let request = self
            .validate(reference, operation, params)
            .map_err(|e| self.formatter.format_error(&e, &ctx))?;
        self.execute(&request, &ctx).await
    }

    /// Run a request whose task was validated by the caller
    pub async fn run_task(
        &self,
        reference: &str,
        task: &AnalysisTask,
    ) -> Result<AnalysisResult, ErrorResult> {
        let ctx = FormatContext::new(task.operation(), Some(reference));
        let image = validate_image_reference(reference)
            .map_err(|e| self.formatter.format_error(&e, &ctx))?;
        let request = AnalysisRequest {
            image,
            task: task.clone(),
        };
        self.execute(&request, &ctx).await
    }

    async fn execute(
        &self,
        request: &AnalysisRequest,
        ctx: &FormatContext,
    ) -> Result<AnalysisResult, ErrorResult> {
        // A FAILED model short-circuits before any I/O
        self.manager
            .check_not_failed()
            .map_err(|e| self.formatter.format_error(&e, ctx))?;

        let image = self
            .acquirer
            .acquire(&request.image)
            .await
            .map_err(|e| self.formatter.format_error(&e, ctx))?;
        let image = Arc::new(image);

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| self.formatter.format_error(&e, ctx))?;
        debug!(
            operation = %request.operation(),
            in_flight = self.gate.in_flight(),
            "Dispatching"
        );

        let dispatched = self.dispatcher.dispatch(Arc::clone(&image), &request.task).await;
        drop(permit);

        let dispatch = dispatched.map_err(|e| self.formatter.format_error(&e, ctx))?;
        let result = self
            .formatter
            .format_success(&request.task, dispatch, &image, ctx)?;

        info!(
            operation = %request.operation(),
            elapsed_ms = result.processing_time_ms(),
            "Analysis complete"
        );
        Ok(result)
    }

    /// Validate and start a streamed caption
    pub async fn caption_stream(
        &self,
        reference: &str,
        length: CaptionLength,
    ) -> Result<(CaptionStream, FormatContext, ResultMetadata), ErrorResult> {
        let ctx = FormatContext::new(Operation::Caption, Some(reference));
        let fail = |e: VisionError| self.formatter.format_error(&e, &ctx);

        let image = validate_image_reference(reference).map_err(fail)?;
        self.manager.check_not_failed().map_err(fail)?;
        let decoded = Arc::new(self.acquirer.acquire(&image).await.map_err(fail)?);
        let permit = self.gate.acquire().await.map_err(fail)?;

        let stream = self
            .dispatcher
            .caption_stream(Arc::clone(&decoded), length, permit)
            .await
            .map_err(fail)?;

        let mut metadata = self.formatter.metadata(&ctx, &decoded, None);
        metadata.device = Some(stream.device().to_string());
        metadata.model = Some(stream.model().to_string());
        Ok((stream, ctx, metadata))
    }
}
