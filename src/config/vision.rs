// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Configuration for the vision inference node
//!
//! Every knob the orchestration layer reads lives here: device preference,
//! model identity, image limits, deadlines and concurrency.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::version;

/// Hard ceiling on the number of images in one batch request
pub const MAX_BATCH_SIZE_LIMIT: usize = 10;

/// Requested device for model placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
    Mps,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            other => Err(format!(
                "unknown device '{}', expected one of: auto, cpu, cuda, mps",
                other
            )),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        };
        f.write_str(s)
    }
}

/// Model name plus pinned revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,
    pub revision: String,
}

impl Default for ModelIdentity {
    fn default() -> Self {
        Self {
            name: "vikhyatk/moondream2".to_string(),
            revision: "2025-01-09".to_string(),
        }
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.revision)
    }
}

/// Configuration for the vision inference node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Device preference (default: auto)
    pub device: DevicePreference,
    /// Model name and revision
    pub model: ModelIdentity,
    /// Longest allowed image side after normalization (default: 2048)
    pub max_image_dimension: u32,
    /// Maximum image payload in megabytes (default: 50)
    pub max_file_size_mb: u64,
    /// Per-request inference deadline in seconds (default: 120)
    pub processing_timeout_secs: u64,
    /// Concurrent inference slots (default: 5)
    pub max_concurrent_requests: usize,
    /// Network fetch timeout in seconds (default: 30)
    pub request_timeout_secs: u64,
    /// Redirects followed when fetching a URL (default: 5)
    pub max_redirects: usize,
    /// User-Agent sent with image fetches
    pub user_agent: String,
    /// Maximum images per batch (default: 10, capped at 10)
    pub max_batch_size: usize,
    /// Question length ceiling in characters (default: 1000)
    pub max_question_length: usize,
    /// Object name length ceiling in characters (default: 100)
    pub max_object_name_length: usize,
    /// Endpoint of the VLM sidecar used by the default backend
    pub vlm_endpoint: String,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl VisionConfig {
    /// Load configuration from environment variables
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            device: env_parse("MOONDREAM_DEVICE").unwrap_or(defaults.device),
            model: ModelIdentity {
                name: env::var("MOONDREAM_MODEL_NAME").unwrap_or(defaults.model.name),
                revision: env::var("MOONDREAM_MODEL_REVISION")
                    .unwrap_or(defaults.model.revision),
            },
            max_image_dimension: env_parse("MOONDREAM_MAX_IMAGE_SIZE")
                .unwrap_or(defaults.max_image_dimension),
            max_file_size_mb: env_parse("MOONDREAM_MAX_FILE_SIZE_MB")
                .unwrap_or(defaults.max_file_size_mb),
            processing_timeout_secs: env_parse("MOONDREAM_TIMEOUT_SECONDS")
                .unwrap_or(defaults.processing_timeout_secs),
            max_concurrent_requests: env_parse("MOONDREAM_MAX_CONCURRENT_REQUESTS")
                .unwrap_or(defaults.max_concurrent_requests),
            request_timeout_secs: env_parse("MOONDREAM_REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_secs),
            max_redirects: env_parse("MOONDREAM_MAX_REDIRECTS").unwrap_or(defaults.max_redirects),
            user_agent: env::var("MOONDREAM_USER_AGENT").unwrap_or(defaults.user_agent),
            max_batch_size: env_parse("MOONDREAM_MAX_BATCH_SIZE")
                .unwrap_or(defaults.max_batch_size)
                .min(MAX_BATCH_SIZE_LIMIT), // Cap at 10
            max_question_length: env_parse("MOONDREAM_MAX_QUESTION_LENGTH")
                .unwrap_or(defaults.max_question_length),
            max_object_name_length: env_parse("MOONDREAM_MAX_OBJECT_NAME_LENGTH")
                .unwrap_or(defaults.max_object_name_length),
            vlm_endpoint: env::var("MOONDREAM_VLM_ENDPOINT").unwrap_or(defaults.vlm_endpoint),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_image_dimension == 0 {
            return Err("max_image_dimension must be at least 1".to_string());
        }
        if self.max_file_size_mb == 0 {
            return Err("max_file_size_mb must be at least 1".to_string());
        }
        if self.processing_timeout_secs == 0 {
            return Err("processing_timeout_secs must be at least 1".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be at least 1".to_string());
        }
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be at least 1".to_string());
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(format!(
                "max_batch_size must be between 1 and {}",
                MAX_BATCH_SIZE_LIMIT
            ));
        }
        if self.max_question_length == 0 || self.max_object_name_length == 0 {
            return Err("text length ceilings must be at least 1".to_string());
        }
        if self.model.name.trim().is_empty() {
            return Err("model name cannot be empty".to_string());
        }
        Ok(())
    }

    /// Payload ceiling in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            model: ModelIdentity::default(),
            max_image_dimension: 2048,
            max_file_size_mb: 50,
            processing_timeout_secs: 120,
            max_concurrent_requests: 5,
            request_timeout_secs: 30,
            max_redirects: 5,
            user_agent: format!("fabstir-vision-node/{}", version::VERSION_NUMBER),
            max_batch_size: MAX_BATCH_SIZE_LIMIT,
            max_question_length: 1000,
            max_object_name_length: 100,
            vlm_endpoint: "http://localhost:8081".to_string(),
        }
    }
}
