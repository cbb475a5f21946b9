// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Batch fan-out over the shared pipeline
//!
//! One task per image. Each item goes through the full pipeline, including
//! its own wait on the concurrency gate, and any failure becomes that item's
//! `ErrorResult`. Results come back in submission order regardless of which
//! item finishes first.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::pipeline::AnalysisPipeline;
use super::validation::{sanitize_string, validate_batch_list, validate_task};
use crate::api::errors::{ErrorResult, VisionError};
use crate::api::request::{AnalysisParams, Operation};
use crate::api::response_formatter::FormatContext;
use crate::api::results::{BatchItem, BatchResult, BatchSummary, Outcome};

pub struct BatchOrchestrator {
    pipeline: Arc<AnalysisPipeline>,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<AnalysisPipeline>) -> Self {
        Self { pipeline }
    }

    /// Run `operation` with shared `params` against every reference
    ///
    /// List or parameter problems fail the whole batch; everything after
    /// that is isolated per item.
    pub async fn run(
        &self,
        refs: &[String],
        operation: Operation,
        params: &AnalysisParams,
    ) -> Result<BatchResult, ErrorResult> {
        let started = Instant::now();
        let ctx = FormatContext::new(Operation::Batch, None);
        let formatter = self.pipeline.formatter();
        let limits = self.pipeline.limits();

        if operation == Operation::Batch {
            let error = VisionError::InvalidRequest("batch cannot be nested".to_string());
            return Err(formatter.format_error(&error, &ctx));
        }
        validate_batch_list(refs, limits.max_batch_size)
            .map_err(|e| formatter.format_error(&e, &ctx))?;
        let task = validate_task(operation, params, limits)
            .map_err(|e| formatter.format_error(&e, &ctx))?;

        info!(operation = %operation, items = refs.len(), "Starting batch");

        let handles: Vec<_> = refs
            .iter()
            .map(|reference| {
                let pipeline = Arc::clone(&self.pipeline);
                let reference = reference.clone();
                let task = task.clone();
                tokio::spawn(async move { pipeline.run_task(&reference, &task).await })
            })
            .collect();

        let items: Vec<BatchItem> = join_all(handles)
            .await
            .into_iter()
            .zip(refs)
            .map(|(joined, reference)| {
                let result = joined.unwrap_or_else(|e| {
                    let error = VisionError::Unknown {
                        detail: format!("batch item task failed: {}", e),
                    };
                    Err(formatter.format_error(&error, &ctx.for_operation(operation)))
                });
                BatchItem {
                    image_reference: sanitize_string(reference, 512),
                    outcome: Outcome::from(result),
                }
            })
            .collect();

        let succeeded_count = items.iter().filter(|i| i.outcome.is_success()).count();
        let summary = BatchSummary {
            succeeded_count,
            failed_count: items.len() - succeeded_count,
            total_elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            operation = %operation,
            succeeded = summary.succeeded_count,
            failed = summary.failed_count,
            elapsed_ms = summary.total_elapsed_ms,
            "Batch complete"
        );

        let parameters = echo_params(
            params,
            limits.max_question_length,
            limits.max_object_name_length,
        );
        Ok(BatchResult {
            operation,
            parameters,
            items,
            summary,
        })
    }
}

fn echo_params(params: &AnalysisParams, max_question: usize, max_object: usize) -> AnalysisParams {
    AnalysisParams {
        length: params.length.as_deref().map(|s| sanitize_string(s, 16)),
        stream: params.stream,
        question: params
            .question
            .as_deref()
            .map(|s| sanitize_string(s, max_question)),
        object_name: params
            .object_name
            .as_deref()
            .map(|s| sanitize_string(s, max_object)),
        operations: params
            .operations
            .as_ref()
            .map(|ops| ops.iter().map(|s| sanitize_string(s, 16)).collect()),
    }
}
