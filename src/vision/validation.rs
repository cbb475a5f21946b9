// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Input validation for analysis requests
//!
//! Pure, synchronous checks that run before any file, network or model work.

use std::path::{Component, Path};
use url::Url;

use crate::api::errors::{ValidationKind, VisionError};
use crate::api::request::{AnalysisParams, AnalysisTask, CaptionLength, ImageRef, Operation, RefKind};
use crate::config::VisionConfig;

/// Longest accepted local path, in characters
const MAX_PATH_LENGTH: usize = 4096;

/// Punctuation allowed in object names besides letters, digits and spaces
const OBJECT_NAME_PUNCTUATION: &[char] = &[
    '-', '_', '.', ',', '\'', '"', '(', ')', '&', '/', ':', ';', '!', '?', '#', '+',
];

/// Ceilings the validators enforce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_question_length: usize,
    pub max_object_name_length: usize,
    pub max_batch_size: usize,
}

impl From<&VisionConfig> for ValidationLimits {
    fn from(config: &VisionConfig) -> Self {
        Self {
            max_question_length: config.max_question_length,
            max_object_name_length: config.max_object_name_length,
            max_batch_size: config.max_batch_size,
        }
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        (&VisionConfig::default()).into()
    }
}

/// Check that a reference is a safe local path or an http(s) URL
pub fn validate_image_reference(raw: &str) -> Result<ImageRef, VisionError> {
    if raw.trim().is_empty() {
        return Err(VisionError::validation(
            ValidationKind::InvalidReference,
            "image_path",
            "image_path cannot be empty",
        ));
    }

    let image = ImageRef::resolve(raw);
    match image.kind {
        RefKind::Url => {
            let parsed = Url::parse(&image.raw).map_err(|_| {
                VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    "image URL is not valid",
                )
            })?;
            if !["http", "https"].contains(&parsed.scheme()) {
                return Err(VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    "image URL must use http or https",
                ));
            }
            if parsed.host_str().map(str::is_empty).unwrap_or(true) {
                return Err(VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    "image URL must include a host",
                ));
            }
        }
        RefKind::Local => {
            if image.raw.chars().count() > MAX_PATH_LENGTH {
                return Err(VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    format!("image_path exceeds {} characters", MAX_PATH_LENGTH),
                ));
            }
            if image.raw.chars().any(char::is_control) {
                return Err(VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    "image_path contains control characters",
                ));
            }
            if Path::new(&image.raw)
                .components()
                .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(VisionError::validation(
                    ValidationKind::InvalidReference,
                    "image_path",
                    "image_path must not contain '..' segments",
                ));
            }
        }
    }

    Ok(image)
}

fn validate_text(
    text: &str,
    field: &'static str,
    max_len: usize,
) -> Result<String, VisionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(VisionError::validation(
            ValidationKind::EmptyInput,
            field,
            format!("{} cannot be empty", field),
        ));
    }
    if trimmed.chars().count() > max_len {
        return Err(VisionError::validation(
            ValidationKind::TooLong,
            field,
            format!("{} exceeds maximum length of {} characters", field, max_len),
        ));
    }
    Ok(trimmed.to_string())
}

/// Check a question for emptiness and length; returns the trimmed question
pub fn validate_question(text: &str, max_len: usize) -> Result<String, VisionError> {
    validate_text(text, "question", max_len)
}

/// Check an object name; returns the trimmed name
pub fn validate_object_name(text: &str, max_len: usize) -> Result<String, VisionError> {
    let name = validate_text(text, "object_name", max_len)?;

    if name.chars().any(char::is_control) {
        return Err(VisionError::validation(
            ValidationKind::InvalidCharacters,
            "object_name",
            "object_name contains control characters",
        ));
    }
    let permitted = |c: char| {
        c.is_alphanumeric() || c == ' ' || OBJECT_NAME_PUNCTUATION.contains(&c)
    };
    if !name.chars().all(permitted) {
        return Err(VisionError::validation(
            ValidationKind::InvalidCharacters,
            "object_name",
            "object_name may only contain letters, digits, spaces and common punctuation",
        ));
    }

    Ok(name)
}

/// Parse a caption length tier, case-insensitively
pub fn validate_caption_length(value: &str) -> Result<CaptionLength, VisionError> {
    match value.trim().to_lowercase().as_str() {
        "short" => Ok(CaptionLength::Short),
        "normal" => Ok(CaptionLength::Normal),
        "detailed" => Ok(CaptionLength::Detailed),
        _ => Err(VisionError::validation(
            ValidationKind::InvalidEnum,
            "length",
            "length must be 'short', 'normal', or 'detailed'",
        )),
    }
}

/// Parse an operation name, case-insensitively
pub fn validate_operation(value: &str) -> Result<Operation, VisionError> {
    let normalized = value.trim().to_lowercase();
    Operation::ALL
        .iter()
        .copied()
        .find(|op| op.as_str() == normalized)
        .ok_or_else(|| {
            VisionError::validation(
                ValidationKind::InvalidEnum,
                "operation",
                "operation must be one of 'caption', 'query', 'detect', 'point', 'analyze', 'batch'",
            )
        })
}

/// Check a batch reference list for size
pub fn validate_batch_list(refs: &[String], max_items: usize) -> Result<(), VisionError> {
    if refs.is_empty() {
        return Err(VisionError::validation(
            ValidationKind::EmptyInput,
            "image_paths",
            "image_paths cannot be empty",
        ));
    }
    if refs.len() > max_items {
        return Err(VisionError::validation(
            ValidationKind::TooManyItems,
            "image_paths",
            format!("Cannot process more than {} images at once", max_items),
        ));
    }
    Ok(())
}

/// Strip control characters and truncate to `max_len` characters
///
/// Used for all caller text echoed back in results or error messages.
pub fn sanitize_string(text: &str, max_len: usize) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .take(max_len)
        .collect()
}

fn required<'a>(
    value: Option<&'a String>,
    name: &str,
    operation: Operation,
) -> Result<&'a str, VisionError> {
    value.map(String::as_str).ok_or_else(|| {
        VisionError::InvalidRequest(format!(
            "{} parameter is required for {} operation",
            name, operation
        ))
    })
}

/// Build a validated task for a single-capability operation
fn validate_single(
    operation: Operation,
    params: &AnalysisParams,
    limits: &ValidationLimits,
) -> Result<AnalysisTask, VisionError> {
    match operation {
        Operation::Caption => Ok(AnalysisTask::Caption {
            length: match params.length.as_deref() {
                Some(value) => validate_caption_length(value)?,
                None => CaptionLength::default(),
            },
            stream: params.stream,
        }),
        Operation::Query => {
            let question = required(params.question.as_ref(), "question", operation)?;
            Ok(AnalysisTask::Query {
                question: validate_question(question, limits.max_question_length)?,
            })
        }
        Operation::Detect => {
            let name = required(params.object_name.as_ref(), "object_name", operation)?;
            Ok(AnalysisTask::Detect {
                object_name: validate_object_name(name, limits.max_object_name_length)?,
            })
        }
        Operation::Point => {
            let name = required(params.object_name.as_ref(), "object_name", operation)?;
            Ok(AnalysisTask::Point {
                object_name: validate_object_name(name, limits.max_object_name_length)?,
            })
        }
        Operation::Analyze | Operation::Batch => Err(VisionError::InvalidRequest(format!(
            "{} cannot be nested inside a composite analysis",
            operation
        ))),
    }
}

/// Run every validator applicable to `operation` and build the typed task
///
/// `batch` is not a per-image task and is rejected here; batch lists are
/// checked with `validate_batch_list`.
pub fn validate_task(
    operation: Operation,
    params: &AnalysisParams,
    limits: &ValidationLimits,
) -> Result<AnalysisTask, VisionError> {
    match operation {
        Operation::Analyze => {
            let names = params.operations.as_ref().ok_or_else(|| {
                VisionError::InvalidRequest(
                    "operations parameter is required for analyze operation".to_string(),
                )
            })?;
            if names.is_empty() {
                return Err(VisionError::validation(
                    ValidationKind::EmptyInput,
                    "operations",
                    "operations cannot be empty",
                ));
            }
            let tasks = names
                .iter()
                .map(|name| {
                    let sub = validate_operation(name)?;
                    validate_single(sub, params, limits)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AnalysisTask::Analyze { tasks })
        }
        Operation::Batch => Err(VisionError::InvalidRequest(
            "batch must be submitted through batch_analyze".to_string(),
        )),
        single => validate_single(single, params, limits),
    }
}
