// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Analysis request types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::errors::VisionError;

/// The fixed set of analysis operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Caption,
    Query,
    Detect,
    Point,
    Analyze,
    Batch,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Caption,
        Operation::Query,
        Operation::Detect,
        Operation::Point,
        Operation::Analyze,
        Operation::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caption => "caption",
            Self::Query => "query",
            Self::Detect => "detect",
            Self::Point => "point",
            Self::Analyze => "analyze",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caption length tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionLength {
    Short,
    #[default]
    Normal,
    Detailed,
}

impl CaptionLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Normal => "normal",
            Self::Detailed => "detailed",
        }
    }
}

impl fmt::Display for CaptionLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an image reference points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Local,
    Url,
}

/// Raw image reference plus its resolved kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub raw: String,
    pub kind: RefKind,
}

impl ImageRef {
    /// Resolve the kind by inspecting the string; performs no I/O
    pub fn resolve(raw: &str) -> Self {
        let trimmed = raw.trim();
        let kind = if trimmed.contains("://") {
            RefKind::Url
        } else {
            RefKind::Local
        };
        Self {
            raw: trimmed.to_string(),
            kind,
        }
    }

    pub fn is_url(&self) -> bool {
        self.kind == RefKind::Url
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Loosely-typed operation parameters as supplied by the caller
///
/// Everything is optional here; `validation::validate_task` turns this into
/// a typed `AnalysisTask` for a given operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<String>>,
}

impl AnalysisParams {
    /// Parse parameters from a JSON object string; blank input means `{}`
    pub fn from_json(json: &str) -> Result<Self, VisionError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json)
            .map_err(|_| VisionError::InvalidRequest("parameters must be valid JSON".to_string()))
    }

    pub fn caption(length: CaptionLength) -> Self {
        Self {
            length: Some(length.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn question(question: impl Into<String>) -> Self {
        Self {
            question: Some(question.into()),
            ..Self::default()
        }
    }

    pub fn object(object_name: impl Into<String>) -> Self {
        Self {
            object_name: Some(object_name.into()),
            ..Self::default()
        }
    }
}

/// A validated unit of work against one decoded image
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisTask {
    Caption { length: CaptionLength, stream: bool },
    Query { question: String },
    Detect { object_name: String },
    Point { object_name: String },
    /// Composite: single-capability tasks run in order against one image
    Analyze { tasks: Vec<AnalysisTask> },
}

impl AnalysisTask {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Caption { .. } => Operation::Caption,
            Self::Query { .. } => Operation::Query,
            Self::Detect { .. } => Operation::Detect,
            Self::Point { .. } => Operation::Point,
            Self::Analyze { .. } => Operation::Analyze,
        }
    }
}

/// A fully validated request for one image
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub image: ImageRef,
    pub task: AnalysisTask,
}

impl AnalysisRequest {
    pub fn operation(&self) -> Operation {
        self.task.operation()
    }
}
