// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! VLM sidecar backend via OpenAI-compatible API
//!
//! The sidecar hosts the model weights; this process only sends images and
//! instructions. Detection and pointing ask the model for JSON arrays of
//! normalized coordinates and parse them leniently.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::backend::{Detection, ModelLoader, VisionModel};
use super::device::Device;
use super::image_utils::DecodedImage;
use crate::api::request::CaptionLength;
use crate::api::results::{BoundingBox, Point};
use crate::config::ModelIdentity;

// --- OpenAI-compatible serde structs ---

#[derive(serde::Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(serde::Serialize)]
struct ChatMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(serde::Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(serde::Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(serde::Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

const CAPTION_SHORT: &str = "Describe this image in one short sentence.";
const CAPTION_NORMAL: &str = "Describe this image.";
const CAPTION_DETAILED: &str =
    "Describe this image in detail, including objects, scene, colors, and any text visible.";

const DETECT_PROMPT: &str = "Find every instance of \"{object}\" in this image. Respond with only a JSON array of bounding boxes, each {\"x_min\":..,\"y_min\":..,\"x_max\":..,\"y_max\":..} with coordinates normalized to 0-1. Respond with [] if there are none.";
const POINT_PROMPT: &str = "Point at every instance of \"{object}\" in this image. Respond with only a JSON array of points, each {\"x\":..,\"y\":..} with coordinates normalized to 0-1. Respond with [] if there are none.";

fn caption_prompt(length: CaptionLength) -> (&'static str, u32) {
    match length {
        CaptionLength::Short => (CAPTION_SHORT, 60),
        CaptionLength::Normal => (CAPTION_NORMAL, 300),
        CaptionLength::Detailed => (CAPTION_DETAILED, 1024),
    }
}

/// Encode the normalized image as a JPEG data URL
fn image_data_url(image: &DecodedImage) -> Result<String> {
    let rgb = image
        .to_rgb_image()
        .ok_or_else(|| anyhow!("pixel buffer does not match dimensions"))?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("failed to encode image")?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:image/jpeg;base64,{}", encoded))
}

/// Byte offset of the `]` closing the array opened at `start`
fn array_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull the first JSON array with usable items out of model output
///
/// Text without any `[` is the model saying it found nothing. Brackets
/// that never yield an empty array or at least one usable item mean the
/// reply was truncated or malformed.
fn parse_items<T>(
    text: &str,
    item: impl Fn(&serde_json::Value) -> Option<T>,
) -> Result<Vec<T>> {
    let mut candidates = text.match_indices('[').map(|(start, _)| start).peekable();
    if candidates.peek().is_none() {
        return Ok(Vec::new());
    }

    for start in candidates {
        let Some(end) = array_end(text, start) else {
            continue;
        };
        let parsed = serde_json::from_str::<serde_json::Value>(&text[start..=end]);
        let Ok(serde_json::Value::Array(values)) = parsed else {
            continue;
        };
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Vec<T> = values.iter().filter_map(&item).collect();
        if !parsed.is_empty() {
            return Ok(parsed);
        }
    }

    Err(anyhow!(
        "no usable JSON array in model output ({} chars)",
        text.len()
    ))
}

fn unit(value: &serde_json::Value) -> Option<f32> {
    value.as_f64().map(|v| v.clamp(0.0, 1.0) as f32)
}

fn detection(item: &serde_json::Value) -> Option<Detection> {
    let coords = match item {
        serde_json::Value::Array(values) if values.len() == 4 => [
            unit(&values[0])?,
            unit(&values[1])?,
            unit(&values[2])?,
            unit(&values[3])?,
        ],
        serde_json::Value::Object(_) => [
            unit(&item["x_min"])?,
            unit(&item["y_min"])?,
            unit(&item["x_max"])?,
            unit(&item["y_max"])?,
        ],
        _ => return None,
    };
    Some(Detection {
        bounding_box: BoundingBox {
            x_min: coords[0].min(coords[2]),
            y_min: coords[1].min(coords[3]),
            x_max: coords[0].max(coords[2]),
            y_max: coords[1].max(coords[3]),
        },
        confidence: item.get("confidence").and_then(unit),
    })
}

fn point(item: &serde_json::Value) -> Option<Point> {
    match item {
        serde_json::Value::Array(values) if values.len() == 2 => Some(Point {
            x: unit(&values[0])?,
            y: unit(&values[1])?,
        }),
        serde_json::Value::Object(_) => Some(Point {
            x: unit(&item["x"])?,
            y: unit(&item["y"])?,
        }),
        _ => None,
    }
}

/// Parse `[{"x_min","y_min","x_max","y_max"}]` or `[[x0,y0,x1,y1]]`
pub(crate) fn parse_detections(text: &str) -> Result<Vec<Detection>> {
    parse_items(text, detection)
}

/// Parse `[{"x","y"}]` or `[[x,y]]`
pub(crate) fn parse_points(text: &str) -> Result<Vec<Point>> {
    parse_items(text, point)
}

/// Pull the text delta out of one SSE line; `None` for non-data lines
fn sse_fragment(line: &str) -> Option<Result<String, ()>> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(Err(()));
    }
    let chunk: ChatChunk = serde_json::from_str(payload).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
        .map(Ok)
}

/// Send one SSE line's fragment; `false` once the stream should stop
async fn forward_line(line: &[u8], sink: &mpsc::Sender<String>) -> bool {
    match sse_fragment(&String::from_utf8_lossy(line)) {
        Some(Ok(fragment)) => {
            if sink.send(fragment).await.is_err() {
                debug!("Caption consumer went away; stopping stream");
                return false;
            }
            true
        }
        Some(Err(())) => false,
        None => true,
    }
}

/// Client for calling a VLM sidecar service via OpenAI-compatible API
#[derive(Clone)]
pub struct VlmClient {
    client: Client,
    endpoint: String,
    model_name: String,
}

impl VlmClient {
    /// Create a new VLM client
    pub fn new(endpoint: &str, model_name: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        info!(
            "VLM client configured: endpoint={}, model={}",
            endpoint, model_name
        );

        Ok(Self {
            client,
            endpoint,
            model_name: model_name.to_string(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check if the VLM sidecar is healthy
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("VLM health check failed: {}", e);
                false
            }
        }
    }

    fn request(
        &self,
        image: &DecodedImage,
        prompt: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Result<ChatRequest> {
        Ok(ChatRequest {
            model: self.model_name.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: serde_json::json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image_data_url(image)?}}
                ]),
            }],
            max_tokens,
            temperature: 0.1,
            stream,
        })
    }

    /// Run one chat completion and return the text content
    pub async fn complete(
        &self,
        image: &DecodedImage,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let start = std::time::Instant::now();
        let request = self.request(image, prompt, max_tokens, false)?;

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let chat_response: ChatResponse = response.json().await?;
        let text = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        debug!(
            "VLM completion: {} chars in {}ms",
            text.len(),
            start.elapsed().as_millis()
        );
        Ok(text)
    }

    /// Stream a chat completion over SSE into `sink`
    pub async fn complete_stream(
        &self,
        image: &DecodedImage,
        prompt: &str,
        max_tokens: u32,
        sink: mpsc::Sender<String>,
    ) -> Result<()> {
        let request = self.request(image, prompt, max_tokens, true)?;

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        // Raw bytes until a full line arrives; a chunk may end mid-character
        let mut body = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            pending.extend_from_slice(&chunk?);

            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                if !forward_line(&line, &sink).await {
                    return Ok(());
                }
            }
        }
        if !pending.is_empty() {
            forward_line(&pending, &sink).await;
        }
        Ok(())
    }
}

/// `VisionModel` backed by the sidecar
pub struct VlmSidecarModel {
    client: VlmClient,
}

impl VlmSidecarModel {
    pub fn new(client: VlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VisionModel for VlmSidecarModel {
    async fn caption(&self, image: &DecodedImage, length: CaptionLength) -> Result<String> {
        let (prompt, max_tokens) = caption_prompt(length);
        let text = self.client.complete(image, prompt, max_tokens).await?;
        Ok(text.trim().to_string())
    }

    async fn caption_stream(
        &self,
        image: &DecodedImage,
        length: CaptionLength,
        sink: mpsc::Sender<String>,
    ) -> Result<()> {
        let (prompt, max_tokens) = caption_prompt(length);
        self.client
            .complete_stream(image, prompt, max_tokens, sink)
            .await
    }

    async fn query(&self, image: &DecodedImage, question: &str) -> Result<String> {
        let text = self.client.complete(image, question, 512).await?;
        Ok(text.trim().to_string())
    }

    async fn detect(&self, image: &DecodedImage, object_name: &str) -> Result<Vec<Detection>> {
        let prompt = DETECT_PROMPT.replace("{object}", object_name);
        let text = self.client.complete(image, &prompt, 1024).await?;
        parse_detections(&text)
    }

    async fn point(&self, image: &DecodedImage, object_name: &str) -> Result<Vec<Point>> {
        let prompt = POINT_PROMPT.replace("{object}", object_name);
        let text = self.client.complete(image, &prompt, 512).await?;
        parse_points(&text)
    }
}

/// Connects to the sidecar and verifies it is serving
pub struct VlmSidecarLoader {
    endpoint: String,
    timeout: Duration,
}

impl VlmSidecarLoader {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ModelLoader for VlmSidecarLoader {
    async fn load(&self, identity: &ModelIdentity, device: Device) -> Result<Arc<dyn VisionModel>> {
        let client = VlmClient::new(&self.endpoint, &identity.to_string(), self.timeout)?;
        if !client.health_check().await {
            return Err(anyhow!("VLM sidecar at {} is not healthy", client.endpoint()));
        }
        info!(device = %device, model = %identity, "VLM sidecar ready");
        Ok(Arc::new(VlmSidecarModel::new(client)))
    }
}
