// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Inference dispatch
//!
//! Routes a validated task to the matching model capability. Every model call
//! runs on its own task under the per-request deadline; when the deadline
//! passes the caller stops waiting and the task's eventual result is dropped.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::Detection;
use super::device::Device;
use super::gate::GatePermit;
use super::image_utils::DecodedImage;
use super::model_manager::ModelManager;
use crate::api::errors::VisionError;
use crate::api::request::{AnalysisTask, CaptionLength, Operation};
use crate::api::results::Point;
use crate::config::ModelIdentity;

const STREAM_BUFFER: usize = 32;

/// Raw model output, before formatting
#[derive(Debug)]
pub enum DispatchOutput {
    Caption(String),
    Answer(String),
    Detections(Vec<Detection>),
    Points(Vec<Point>),
    /// Sub-operation outputs in requested order
    Composite(Vec<CompositeStep>),
}

/// One sub-operation of a composite dispatch
#[derive(Debug)]
pub struct CompositeStep {
    pub operation: Operation,
    pub elapsed: Duration,
    pub result: Result<DispatchOutput, VisionError>,
}

/// Output plus the handle it ran on
#[derive(Debug)]
pub struct Dispatch {
    pub output: DispatchOutput,
    pub device: Device,
    pub model: ModelIdentity,
}

pub struct Dispatcher {
    manager: Arc<ModelManager>,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(manager: Arc<ModelManager>, deadline: Duration) -> Self {
        Self { manager, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run a task against a decoded image
    ///
    /// Loads the model first if needed. The deadline covers the model call
    /// only; composites give each sub-operation its own deadline and keep
    /// going past a failed one.
    pub async fn dispatch(
        &self,
        image: Arc<DecodedImage>,
        task: &AnalysisTask,
    ) -> Result<Dispatch, VisionError> {
        let handle = self.manager.ensure_ready().await?;

        let output = match task {
            AnalysisTask::Analyze { tasks } => {
                let mut results = Vec::with_capacity(tasks.len());
                for sub in tasks {
                    let start = std::time::Instant::now();
                    let result = self.run_single(Arc::clone(&image), sub).await;
                    if let Err(e) = &result {
                        debug!(operation = %sub.operation(), code = %e.code(), "Composite step failed");
                    }
                    results.push(CompositeStep {
                        operation: sub.operation(),
                        elapsed: start.elapsed(),
                        result,
                    });
                }
                DispatchOutput::Composite(results)
            }
            single => self.run_single(image, single).await?,
        };

        Ok(Dispatch {
            output,
            device: handle.device,
            model: handle.identity.clone(),
        })
    }

    async fn run_single(
        &self,
        image: Arc<DecodedImage>,
        task: &AnalysisTask,
    ) -> Result<DispatchOutput, VisionError> {
        let operation = task.operation();
        let manager = Arc::clone(&self.manager);
        let task = task.clone();
        let start = std::time::Instant::now();

        let worker = tokio::spawn(async move {
            match task {
                AnalysisTask::Caption { length, .. } => manager
                    .generate_caption(&image, length)
                    .await
                    .map(DispatchOutput::Caption),
                AnalysisTask::Query { question } => manager
                    .answer_question(&image, &question)
                    .await
                    .map(DispatchOutput::Answer),
                AnalysisTask::Detect { object_name } => manager
                    .detect(&image, &object_name)
                    .await
                    .map(DispatchOutput::Detections),
                AnalysisTask::Point { object_name } => manager
                    .point(&image, &object_name)
                    .await
                    .map(DispatchOutput::Points),
                AnalysisTask::Analyze { .. } => Err(VisionError::InvalidRequest(
                    "analyze cannot be nested inside a composite".to_string(),
                )),
            }
        });

        let result = self.await_worker(worker).await;
        debug!(
            operation = %operation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Dispatch finished"
        );
        result
    }

    async fn await_worker<T>(
        &self,
        worker: JoinHandle<Result<T, VisionError>>,
    ) -> Result<T, VisionError> {
        match tokio::time::timeout(self.deadline, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(VisionError::Inference {
                detail: format!("inference task failed: {}", e),
            }),
            Err(_) => {
                // Dropping the JoinHandle detaches the task
                warn!(
                    "Inference exceeded {}ms deadline; abandoning call",
                    self.deadline.as_millis()
                );
                Err(VisionError::Timeout(self.deadline))
            }
        }
    }

    /// Start a streamed caption
    ///
    /// The returned stream holds `permit` until it finishes or is dropped.
    pub async fn caption_stream(
        &self,
        image: Arc<DecodedImage>,
        length: CaptionLength,
        permit: GatePermit,
    ) -> Result<CaptionStream, VisionError> {
        let handle = self.manager.ensure_ready().await?;
        let manager = Arc::clone(&self.manager);
        let (sink, receiver) = mpsc::channel(STREAM_BUFFER);

        let worker = tokio::spawn(async move {
            manager.generate_caption_stream(&image, length, sink).await
        });

        Ok(CaptionStream {
            receiver,
            worker,
            deadline: Instant::now() + self.deadline,
            timeout: self.deadline,
            permit: Some(permit),
            finished: false,
            length,
            device: handle.device,
            model: handle.identity.clone(),
        })
    }
}

/// Lazy, finite sequence of caption fragments
///
/// Not restartable. Dropping it closes the channel, which tells the producer
/// to stop, and frees the gate slot.
pub struct CaptionStream {
    receiver: mpsc::Receiver<String>,
    worker: JoinHandle<Result<(), VisionError>>,
    deadline: Instant,
    timeout: Duration,
    permit: Option<GatePermit>,
    finished: bool,
    length: CaptionLength,
    device: Device,
    model: ModelIdentity,
}

impl CaptionStream {
    pub fn length(&self) -> CaptionLength {
        self.length
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn model(&self) -> &ModelIdentity {
        &self.model
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver.close();
        self.permit.take();
    }

    /// Next fragment; `None` once the caption is complete
    ///
    /// A producer failure or the deadline ends the stream with one error.
    pub async fn next(&mut self) -> Option<Result<String, VisionError>> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout_at(self.deadline, self.receiver.recv()).await {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => {
                self.finish();
                match tokio::time::timeout_at(self.deadline, &mut self.worker).await {
                    Ok(Ok(Ok(()))) => None,
                    Ok(Ok(Err(e))) => Some(Err(e)),
                    Ok(Err(e)) => Some(Err(VisionError::Inference {
                        detail: format!("caption task failed: {}", e),
                    })),
                    Err(_) => Some(Err(VisionError::Timeout(self.timeout))),
                }
            }
            Err(_) => {
                warn!(
                    "Caption stream exceeded {}ms deadline",
                    self.timeout.as_millis()
                );
                self.finish();
                Some(Err(VisionError::Timeout(self.timeout)))
            }
        }
    }

    /// Drain the stream into the full caption
    pub async fn collect_text(mut self) -> Result<String, VisionError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<String, VisionError>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}
