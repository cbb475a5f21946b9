// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model lifecycle management
//!
//! One `ModelManager` owns the process-wide model handle and its state
//! machine:
//!
//! ```text
//! UNLOADED --first use--> LOADING --ok--> READY
//!                             \--err--> FAILED
//! READY | FAILED --cleanup/reset--> UNLOADED
//! ```
//!
//! State lives in a `watch` channel. The UNLOADED -> LOADING transition is a
//! single compare-and-set, so exactly one caller starts a load; everyone else
//! waits on the channel until it leaves LOADING. The load itself runs in its
//! own task so a cancelled caller cannot strand the state in LOADING.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::backend::{Detection, ModelLoader, VisionModel};
use super::device::{select_device, Device, DeviceAvailability};
use super::image_utils::DecodedImage;
use crate::api::errors::VisionError;
use crate::api::request::CaptionLength;
use crate::api::results::Point;
use crate::config::{DevicePreference, ModelIdentity, VisionConfig};

/// Public lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "UNLOADED",
            Self::Loading => "LOADING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A loaded model bound to a device
pub struct ModelHandle {
    pub device: Device,
    pub identity: ModelIdentity,
    pub model: Arc<dyn VisionModel>,
    pub load_time: Duration,
    loaded_at: Instant,
}

impl ModelHandle {
    pub fn uptime(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("device", &self.device)
            .field("identity", &self.identity)
            .field("load_time", &self.load_time)
            .finish()
    }
}

#[derive(Clone)]
enum Lifecycle {
    Unloaded,
    Loading,
    Ready(Arc<ModelHandle>),
    /// Backend detail, kept for logs only
    Failed(Arc<str>),
}

impl Lifecycle {
    fn state(&self) -> ModelState {
        match self {
            Self::Unloaded => ModelState::Unloaded,
            Self::Loading => ModelState::Loading,
            Self::Ready(_) => ModelState::Ready,
            Self::Failed(_) => ModelState::Failed,
        }
    }
}

/// Snapshot returned by `ModelManager::status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<u64>,
    /// Time since the model became READY
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    pub load_attempts: usize,
}

/// Owner of the shared model handle
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    identity: ModelIdentity,
    preference: DevicePreference,
    availability: DeviceAvailability,
    state: watch::Sender<Lifecycle>,
    load_attempts: AtomicUsize,
}

impl ModelManager {
    pub fn new(config: &VisionConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_availability(config, loader, DeviceAvailability::detect())
    }

    /// Create a manager with a fixed view of available accelerators
    pub fn with_availability(
        config: &VisionConfig,
        loader: Arc<dyn ModelLoader>,
        availability: DeviceAvailability,
    ) -> Self {
        let (state, _) = watch::channel(Lifecycle::Unloaded);
        Self {
            loader,
            identity: config.model.clone(),
            preference: config.device,
            availability,
            state,
            load_attempts: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().state()
    }

    /// Number of load sequences started since creation
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ModelStatus {
        let lifecycle = (*self.state.borrow()).clone();
        let (device, load_time_ms, uptime_ms) = match &lifecycle {
            Lifecycle::Ready(handle) => (
                Some(handle.device),
                Some(handle.load_time.as_millis() as u64),
                Some(handle.uptime().as_millis() as u64),
            ),
            _ => (None, None, None),
        };
        ModelStatus {
            state: lifecycle.state(),
            model: self.identity.to_string(),
            device,
            load_time_ms,
            uptime_ms,
            load_attempts: self.load_attempts(),
        }
    }

    /// Fail fast if a previous load failed
    pub fn check_not_failed(&self) -> Result<(), VisionError> {
        match &*self.state.borrow() {
            Lifecycle::Failed(detail) => Err(VisionError::ModelLoadFailed {
                detail: detail.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// The handle, only when READY
    pub fn ready_handle(&self) -> Result<Arc<ModelHandle>, VisionError> {
        match &*self.state.borrow() {
            Lifecycle::Ready(handle) => Ok(Arc::clone(handle)),
            _ => Err(VisionError::ModelNotReady),
        }
    }

    /// Return the ready handle, loading the model on first use
    ///
    /// Concurrent callers share one load. A FAILED state is returned as an
    /// error immediately; only `reset` allows another attempt.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<Arc<ModelHandle>, VisionError> {
        let started = self.state.send_if_modified(|lifecycle| {
            if matches!(lifecycle, Lifecycle::Unloaded) {
                *lifecycle = Lifecycle::Loading;
                true
            } else {
                false
            }
        });
        if started {
            self.spawn_load();
        }

        let mut rx = self.state.subscribe();
        let settled = {
            let current = rx
                .wait_for(|lifecycle| !matches!(lifecycle, Lifecycle::Loading))
                .await
                .map_err(|_| VisionError::Unknown {
                    detail: "model state channel closed".to_string(),
                })?;
            (*current).clone()
        };

        match settled {
            Lifecycle::Ready(handle) => Ok(handle),
            Lifecycle::Failed(detail) => Err(VisionError::ModelLoadFailed {
                detail: detail.to_string(),
            }),
            // Torn down while we were waiting
            Lifecycle::Unloaded | Lifecycle::Loading => Err(VisionError::ModelNotReady),
        }
    }

    fn spawn_load(self: &Arc<Self>) {
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let device = select_device(manager.preference, manager.availability);
            info!(
                model = %manager.identity,
                device = %device,
                attempt,
                "Loading vision model"
            );

            let start = Instant::now();
            let loader = Arc::clone(&manager.loader);
            let identity = manager.identity.clone();
            // Inner task turns a loader panic into a FAILED state
            let outcome = tokio::spawn(async move { loader.load(&identity, device).await }).await;

            let next = match outcome {
                Ok(Ok(model)) => {
                    let load_time = start.elapsed();
                    info!(
                        model = %manager.identity,
                        device = %device,
                        elapsed_ms = load_time.as_millis() as u64,
                        "Vision model ready"
                    );
                    Lifecycle::Ready(Arc::new(ModelHandle {
                        device,
                        identity: manager.identity.clone(),
                        model,
                        load_time,
                        loaded_at: Instant::now(),
                    }))
                }
                Ok(Err(e)) => {
                    error!(model = %manager.identity, "Vision model failed to load: {:#}", e);
                    Lifecycle::Failed(Arc::from(format!("{:#}", e)))
                }
                Err(e) => {
                    error!(model = %manager.identity, "Vision model loader panicked: {}", e);
                    Lifecycle::Failed(Arc::from("loader panicked"))
                }
            };

            manager.state.send_replace(next);
        });
    }

    /// Release the model and return to UNLOADED
    ///
    /// Waits for an in-flight load to settle first. Calling this while
    /// already UNLOADED is a no-op.
    pub async fn cleanup(&self) {
        let mut rx = self.state.subscribe();
        let previous = loop {
            let _ = rx
                .wait_for(|lifecycle| !matches!(lifecycle, Lifecycle::Loading))
                .await;

            let mut taken = None;
            let mut loading = false;
            self.state.send_if_modified(|lifecycle| match lifecycle {
                Lifecycle::Unloaded => false,
                Lifecycle::Loading => {
                    loading = true;
                    false
                }
                _ => {
                    taken = Some(std::mem::replace(lifecycle, Lifecycle::Unloaded));
                    true
                }
            });

            if !loading {
                break taken;
            }
        };

        match previous {
            None => {}
            Some(Lifecycle::Ready(handle)) => {
                if let Err(e) = handle.model.release().await {
                    warn!("Model release reported an error: {:#}", e);
                }
                info!(
                    model = %handle.identity,
                    device = %handle.device,
                    "Vision model unloaded"
                );
            }
            Some(_) => info!("Vision model state cleared"),
        }
    }

    /// Explicit teardown, the only way out of FAILED
    pub async fn reset(&self) {
        info!(from = %self.state(), "Resetting vision model");
        self.cleanup().await;
    }

    fn map_inference(e: anyhow::Error) -> VisionError {
        VisionError::Inference {
            detail: format!("{:#}", e),
        }
    }

    pub async fn generate_caption(
        &self,
        image: &DecodedImage,
        length: CaptionLength,
    ) -> Result<String, VisionError> {
        let handle = self.ready_handle()?;
        handle
            .model
            .caption(image, length)
            .await
            .map_err(Self::map_inference)
    }

    pub async fn generate_caption_stream(
        &self,
        image: &DecodedImage,
        length: CaptionLength,
        sink: mpsc::Sender<String>,
    ) -> Result<(), VisionError> {
        let handle = self.ready_handle()?;
        handle
            .model
            .caption_stream(image, length, sink)
            .await
            .map_err(Self::map_inference)
    }

    pub async fn answer_question(
        &self,
        image: &DecodedImage,
        question: &str,
    ) -> Result<String, VisionError> {
        let handle = self.ready_handle()?;
        handle
            .model
            .query(image, question)
            .await
            .map_err(Self::map_inference)
    }

    pub async fn detect(
        &self,
        image: &DecodedImage,
        object_name: &str,
    ) -> Result<Vec<Detection>, VisionError> {
        let handle = self.ready_handle()?;
        handle
            .model
            .detect(image, object_name)
            .await
            .map_err(Self::map_inference)
    }

    pub async fn point(
        &self,
        image: &DecodedImage,
        object_name: &str,
    ) -> Result<Vec<Point>, VisionError> {
        let handle = self.ready_handle()?;
        handle
            .model
            .point(image, object_name)
            .await
            .map_err(Self::map_inference)
    }
}
