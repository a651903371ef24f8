// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
pub mod scripted;
pub mod sse;
mod anthropic;
mod error;
mod google;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::{is_retryable, ProviderError};
pub use google::GoogleProvider;
pub use openai::{AuthStyle, OpenAiCompatProvider};
pub use provider::{ChunkFn, EventFn, EventStream, Provider, ProviderEvent};
pub use registry::{get_driver, known_driver_ids, DriverMeta};
pub use scripted::{error, text_response, thinking_response, tool_use, ScriptStep, ScriptedProvider};
pub use types::*;

use std::sync::Arc;

use anyhow::bail;

use alloy_config::ProviderConfig;

/// Construct a shared [`Provider`] from configuration.
///
/// The driver is selected by `cfg.provider`; providers can also be registered
/// at runtime by handing any `Arc<dyn Provider>` to the agent directly — this
/// constructor only covers the built-in drivers.
pub fn from_config(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new())),
        "openai" => Ok(Arc::new(OpenAiCompatProvider::openai())),
        "google" => Ok(Arc::new(GoogleProvider::new())),
        "openrouter" => Ok(Arc::new(OpenAiCompatProvider::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            Some("OPENROUTER_API_KEY"),
            AuthStyle::Bearer,
        ))),
        "ollama" => Ok(Arc::new(OpenAiCompatProvider::new(
            "ollama",
            "http://localhost:11434/v1",
            None,
            AuthStyle::None,
        ))),
        "scripted" => Ok(Arc::new(ScriptedProvider::new(vec![]))),
        other => {
            let known: Vec<&str> = known_driver_ids().collect();
            bail!(
                "unknown model provider: {other:?}\n\
                 Known providers: {known}",
                known = known.join(", ")
            )
        }
    }
}
