// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image acquisition from local paths and http(s) URLs
//!
//! Every call re-reads its source; nothing is cached between requests.

use reqwest::Client;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::image_utils::{decode_and_normalize, format_to_extension, DecodedImage};
use crate::api::errors::VisionError;
use crate::api::request::{ImageRef, RefKind};
use crate::config::VisionConfig;

/// Fetches and decodes images for the pipeline
#[derive(Debug, Clone)]
pub struct ImageAcquirer {
    client: Client,
    max_bytes: u64,
    max_dimension: u32,
    request_timeout: Duration,
}

impl ImageAcquirer {
    /// Create an acquirer from the vision configuration
    pub fn new(config: &VisionConfig) -> Result<Self, VisionError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| VisionError::Resource(format!("HTTP client unavailable: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_file_size_bytes(),
            max_dimension: config.max_image_dimension,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Read the raw bytes behind a reference
    pub async fn read_bytes(&self, image: &ImageRef) -> Result<Vec<u8>, VisionError> {
        match image.kind {
            RefKind::Local => self.read_local(&image.raw).await,
            RefKind::Url => self.fetch_url(&image.raw).await,
        }
    }

    /// Read, decode and normalize an image
    pub async fn acquire(&self, image: &ImageRef) -> Result<DecodedImage, VisionError> {
        let bytes = self.read_bytes(image).await?;
        let max_dimension = self.max_dimension;

        // Decode and resize are CPU bound; keep them off the async workers
        let decoded =
            tokio::task::spawn_blocking(move || decode_and_normalize(&bytes, max_dimension))
                .await
                .map_err(|e| VisionError::Unknown {
                    detail: format!("decode task failed: {}", e),
                })??;

        debug!(
            reference = %image.raw,
            format = format_to_extension(decoded.source_format),
            width = decoded.width,
            height = decoded.height,
            resized = decoded.was_resized(),
            "Image acquired"
        );
        Ok(decoded)
    }

    async fn read_local(&self, path: &str) -> Result<Vec<u8>, VisionError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => VisionError::FileNotFound(path.to_string()),
            ErrorKind::PermissionDenied => {
                VisionError::Resource(format!("Permission denied reading {}", path))
            }
            _ => VisionError::FileNotFound(path.to_string()),
        })?;

        if !metadata.is_file() {
            return Err(VisionError::FileNotFound(path.to_string()));
        }

        if metadata.len() > self.max_bytes {
            return Err(VisionError::FileTooLarge {
                size: Some(metadata.len()),
                limit_bytes: self.max_bytes,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => VisionError::FileNotFound(path.to_string()),
            _ => VisionError::Resource(format!("Failed to read {}", path)),
        })?;

        // The file may have grown between stat and read
        if bytes.len() as u64 > self.max_bytes {
            return Err(VisionError::FileTooLarge {
                size: Some(bytes.len() as u64),
                limit_bytes: self.max_bytes,
            });
        }

        Ok(bytes)
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, VisionError> {
        debug!("Fetching image from: {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Image fetch returned HTTP {} for {}", status.as_u16(), url);
            return Err(VisionError::Network {
                reference: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                return Err(VisionError::FileTooLarge {
                    size: Some(declared),
                    limit_bytes: self.max_bytes,
                });
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.classify_reqwest(url, &e))?
        {
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(VisionError::FileTooLarge {
                    size: None,
                    limit_bytes: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        info!("Fetched {} bytes from: {}", bytes.len(), url);
        Ok(bytes)
    }

    fn classify_reqwest(&self, url: &str, e: &reqwest::Error) -> VisionError {
        if e.is_timeout() {
            return VisionError::Timeout(self.request_timeout);
        }

        debug!("Image fetch error for {}: {}", url, e);
        let reason = if e.is_redirect() {
            "too many redirects"
        } else if e.is_connect() {
            "connection failed"
        } else if e.is_body() || e.is_decode() {
            "response body could not be read"
        } else {
            "request failed"
        };

        VisionError::Network {
            reference: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
