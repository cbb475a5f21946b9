// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error taxonomy for vision analysis
//!
//! `VisionError` is the internal failure type every layer returns.
//! `VisionError::code()` is the only place a condition is mapped to a public
//! `ErrorCode`; `ErrorResult` is the sanitized value handed to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Sub-reason attached to a validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationKind {
    InvalidReference,
    EmptyInput,
    TooLong,
    InvalidCharacters,
    InvalidEnum,
    TooManyItems,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidReference => "INVALID_REFERENCE",
            Self::EmptyInput => "EMPTY_INPUT",
            Self::TooLong => "TOO_LONG",
            Self::InvalidCharacters => "INVALID_CHARACTERS",
            Self::InvalidEnum => "INVALID_ENUM",
            Self::TooManyItems => "TOO_MANY_ITEMS",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InvalidRequest,
    FileNotFound,
    NetworkError,
    FileTooLarge,
    UnsupportedFormat,
    ModelError,
    ProcessingTimeout,
    ResourceError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::NetworkError => "NETWORK_ERROR",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::ModelError => "MODEL_ERROR",
            Self::ProcessingTimeout => "PROCESSING_TIMEOUT",
            Self::ResourceError => "RESOURCE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal failure conditions
///
/// Display strings are safe to show callers: they only ever contain values
/// the caller supplied (references, field names) and fixed text. Backend
/// detail is kept in the `detail` fields and only reaches the logs.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("{message}")]
    Validation {
        kind: ValidationKind,
        field: &'static str,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Image file not found: {0}")]
    FileNotFound(String),

    #[error("Image exceeds maximum size of {limit_bytes} bytes")]
    FileTooLarge { size: Option<u64>, limit_bytes: u64 },

    #[error("Failed to fetch image from {reference}: {reason}")]
    Network { reference: String, reason: String },

    #[error("Operation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Unsupported or corrupt image format")]
    UnsupportedFormat,

    #[error("Model is not ready")]
    ModelNotReady,

    #[error("Model failed to load")]
    ModelLoadFailed { detail: String },

    #[error("Inference failed")]
    Inference { detail: String },

    #[error("Resource unavailable: {0}")]
    Resource(String),

    #[error("Unexpected internal error")]
    Unknown { detail: String },
}

impl VisionError {
    /// Build a validation failure
    pub fn validation(kind: ValidationKind, field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            kind,
            field,
            message: message.into(),
        }
    }

    /// Map the internal condition to its public code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            Self::Network { .. } => ErrorCode::NetworkError,
            Self::Timeout(_) => ErrorCode::ProcessingTimeout,
            Self::UnsupportedFormat => ErrorCode::UnsupportedFormat,
            Self::ModelNotReady | Self::ModelLoadFailed { .. } | Self::Inference { .. } => {
                ErrorCode::ModelError
            }
            Self::Resource(_) => ErrorCode::ResourceError,
            Self::Unknown { .. } => ErrorCode::UnknownError,
        }
    }

    /// Validation sub-reason, if this is a validation failure
    pub fn validation_kind(&self) -> Option<ValidationKind> {
        match self {
            Self::Validation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Internal detail for logging; never part of a caller-facing message
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::ModelLoadFailed { detail }
            | Self::Inference { detail }
            | Self::Unknown { detail } => Some(detail),
            _ => None,
        }
    }
}

/// Sanitized error handed back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub code: ErrorCode,
    pub message: String,
    /// Redacted diagnostic fields (operation, elapsed_ms, reason, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ErrorResult {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a diagnostic field
    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Validation sub-reason, if present
    pub fn reason(&self) -> Option<&str> {
        self.context.get("reason").and_then(|v| v.as_str())
    }
}

impl fmt::Display for ErrorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResult {}
