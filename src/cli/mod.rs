// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Command-line front end for the vision service

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

use crate::api::errors::VisionError;
use crate::api::request::{AnalysisParams, Operation};
use crate::api::response_formatter::{batch_to_tool_json, error_to_tool_json, to_tool_json};
use crate::api::results::AnalysisResult;
use crate::config::{DevicePreference, VisionConfig};
use crate::version;
use crate::vision::{VisionService, VlmSidecarLoader};

/// Fabstir vision analysis CLI
#[derive(Parser, Debug)]
#[command(name = "fabstir-vision")]
#[command(version = version::VERSION_NUMBER)]
#[command(about = "Caption, query, detect and point at objects in images", long_about = None)]
pub struct Cli {
    /// Device to load the model on (auto, cpu, cuda, mps)
    #[arg(long, global = true)]
    pub device: Option<DevicePreference>,

    /// VLM sidecar endpoint
    #[arg(long, global = true)]
    pub vlm_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a caption for an image
    Caption(CaptionArgs),

    /// Ask a question about an image
    Query {
        /// Local path or http(s) URL
        image: String,
        question: String,
    },

    /// Find bounding boxes for an object
    Detect {
        image: String,
        object_name: String,
    },

    /// Find center points for an object
    Point {
        image: String,
        object_name: String,
    },

    /// Run several operations against one image
    Analyze(AnalyzeArgs),

    /// Run one operation against several images
    Batch(BatchArgs),

    /// Show model lifecycle state
    Status,
}

#[derive(Args, Debug)]
pub struct CaptionArgs {
    pub image: String,

    /// short, normal or detailed
    #[arg(long, default_value = "normal")]
    pub length: String,

    /// Print fragments as they are generated
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    pub image: String,

    /// Comma-separated operations, e.g. caption,detect
    #[arg(long, value_delimiter = ',', required = true)]
    pub operations: Vec<String>,

    /// Shared parameters as JSON, e.g. '{"object_name": "dog"}'
    #[arg(long, default_value = "")]
    pub params: String,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// caption, query, detect, point or analyze
    pub operation: String,

    /// Up to 10 local paths or URLs
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Shared parameters as JSON
    #[arg(long, default_value = "")]
    pub params: String,
}

/// Build the configuration from the environment plus CLI overrides
pub fn load_config(cli: &Cli) -> VisionConfig {
    let mut config = VisionConfig::from_env();
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(endpoint) = &cli.vlm_endpoint {
        config.vlm_endpoint = endpoint.clone();
    }
    config
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli);
    let loader = Arc::new(VlmSidecarLoader::new(
        config.vlm_endpoint.clone(),
        config.processing_timeout(),
    ));
    let service = VisionService::new(config, loader)?;

    let output = run_command(&service, cli.command).await;
    service.cleanup().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_command(service: &VisionService, command: Commands) -> Value {
    match command {
        Commands::Caption(args) if args.stream => stream_caption(service, &args).await,
        Commands::Caption(args) => {
            let outcome = service
                .caption_image(&args.image, &args.length, false)
                .await
                .map(AnalysisResult::Caption);
            to_tool_json(&outcome)
        }
        Commands::Query { image, question } => {
            let outcome = service
                .query_image(&image, &question)
                .await
                .map(AnalysisResult::Query);
            to_tool_json(&outcome)
        }
        Commands::Detect { image, object_name } => {
            let outcome = service
                .detect_objects(&image, &object_name)
                .await
                .map(AnalysisResult::Detection);
            to_tool_json(&outcome)
        }
        Commands::Point { image, object_name } => {
            let outcome = service
                .point_objects(&image, &object_name)
                .await
                .map(AnalysisResult::Pointing);
            to_tool_json(&outcome)
        }
        Commands::Analyze(args) => {
            let mut params = match AnalysisParams::from_json(&args.params) {
                Ok(params) => params,
                Err(e) => return reject(service, Operation::Analyze, e),
            };
            params.operations = Some(args.operations);
            let outcome = service
                .analyze_image(&args.image, &params)
                .await
                .map(AnalysisResult::Composite);
            to_tool_json(&outcome)
        }
        Commands::Batch(args) => {
            let params = match AnalysisParams::from_json(&args.params) {
                Ok(params) => params,
                Err(e) => return reject(service, Operation::Batch, e),
            };
            let outcome = service
                .batch_analyze(&args.images, &args.operation, &params)
                .await;
            batch_to_tool_json(&outcome)
        }
        Commands::Status => serde_json::json!({
            "model": serde_json::to_value(service.model_status()).unwrap_or(Value::Null),
            "version": version::get_version_info(),
        }),
    }
}

async fn stream_caption(service: &VisionService, args: &CaptionArgs) -> Value {
    let mut session = match service.caption_image_stream(&args.image, &args.length).await {
        Ok(session) => session,
        Err(error) => return error_to_tool_json(&error),
    };

    let mut stderr = std::io::stderr();
    while let Some(fragment) = session.next_fragment().await {
        let _ = write!(stderr, "{}", fragment);
        let _ = stderr.flush();
    }
    let _ = writeln!(stderr);

    to_tool_json(&service.finish_stream(session).await)
}

fn reject(service: &VisionService, operation: Operation, error: VisionError) -> Value {
    error_to_tool_json(&service.error_result(operation, None, error))
}
