// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the Fabstir Vision Node

/// Full version string with feature description
pub const VERSION: &str = "v0.1.0-vision-analysis-2026-10-19";

/// Semantic version number
pub const VERSION_NUMBER: &str = "0.1.0";

/// Major version number
pub const VERSION_MAJOR: u32 = 0;

/// Minor version number
pub const VERSION_MINOR: u32 = 1;

/// Patch version number
pub const VERSION_PATCH: u32 = 0;

/// Build date
pub const BUILD_DATE: &str = "2026-10-19";

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "caption",
    "caption-streaming",
    "visual-question-answering",
    "object-detection",
    "visual-pointing",
    "composite-analysis",
    "batch-analysis",
    "lazy-model-loading",
    "url-image-fetch",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Fabstir Vision Node {} ({})", VERSION_NUMBER, BUILD_DATE)
}

/// Get full version info for status output
pub fn get_version_info() -> serde_json::Value {
    serde_json::json!({
        "version": VERSION_NUMBER,
        "build": VERSION,
        "date": BUILD_DATE,
        "features": FEATURES,
    })
}
