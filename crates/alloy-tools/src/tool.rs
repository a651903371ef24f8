// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use alloy_model::JsonMap;

/// Non-fatal tool failure. The executor wraps this into an error tool_result;
/// the turn loop continues.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Execution context handed to every tool call: the agent's context map plus
/// its working directory.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub context: JsonMap,
    pub working_dir: Option<PathBuf>,
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a result exceeds the configured token cap, the executor picks the
/// extraction strategy from this category; tools declare their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep head and tail so both the preamble
    /// and the final result stay visible.
    HeadTail,
    /// Generic text: hard-truncate at the nearest line boundary.
    #[default]
    Generic,
}

/// Trait every tool must implement.
///
/// Outputs are always strings; structured data must be pre-serialized to
/// JSON. Tool call ids are owned by the executor, not the tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name the model calls it by.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    async fn execute(&self, input: &JsonMap, ctx: &ToolContext) -> Result<String, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
