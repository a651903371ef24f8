// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for every supported model provider.
//!
//! Single source of truth for which provider ids exist and what their
//! defaults are. Construction logic lives in [`crate::from_config`].

use alloy_config::ProviderConfig;

/// Metadata describing a registered model driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique provider id used in the `provider` config field.
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// Default environment variable that holds the API key.
    /// `None` for providers that require no key (local servers, mocks).
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when the config does not set one.
    pub default_base_url: Option<&'static str>,
}

pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        name: "Anthropic",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
    },
    DriverMeta {
        id: "openai",
        name: "OpenAI",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
    },
    DriverMeta {
        id: "google",
        name: "Google Gemini",
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
    },
    DriverMeta {
        id: "openrouter",
        name: "OpenRouter",
        default_api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
    },
    DriverMeta {
        id: "ollama",
        name: "Ollama",
        default_api_key_env: None,
        default_base_url: Some("http://localhost:11434/v1"),
    },
    DriverMeta {
        id: "scripted",
        name: "Scripted mock",
        default_api_key_env: None,
        default_base_url: None,
    },
];

/// Look up a driver by id.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// All registered driver ids.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

/// Resolve the API key for a config: explicit key, then the configured env
/// var, then the driver's registry default env var.
pub(crate) fn resolve_api_key(cfg: &ProviderConfig, default_env: Option<&str>) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(env) = default_env.or_else(|| get_driver(&cfg.provider)?.default_api_key_env) {
        return std::env::var(env).ok();
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
