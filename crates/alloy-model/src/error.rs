// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider error type and the transient/permanent classifier.
//!
//! Errors travel as kind-prefixed strings (`HTTP 429: …`,
//! `transport failure: :timeout …`) so the turn loop can classify them by
//! substring match. The typed wrapper carries the string as its display form.

use thiserror::Error;

/// An error returned by a model provider.
///
/// Providers never retry internally; the turn loop is the sole retry
/// authority and uses [`ProviderError::is_retryable`] to decide.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// HTTP status error in the canonical `HTTP <code>: <body>` form.
    pub fn http(status: u16, body: &str) -> Self {
        Self::new(format!("HTTP {status}: {body}"))
    }

    /// Transport-level failure. The reason token (`:timeout`, `:econnrefused`,
    /// `:closed`) is embedded verbatim so the classifier can match it.
    pub fn transport(reason: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(format!("transport failure: {reason} ({detail})"))
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable(&self.message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::transport(":timeout", &e)
        } else if e.is_connect() {
            ProviderError::transport(":econnrefused", &e)
        } else {
            ProviderError::transport(":closed", &e)
        }
    }
}

/// Substrings that mark an error as transient.
///
/// HTTP statuses 429/500/502/503/504, the rate-limit and overload markers of
/// the Anthropic/OpenAI/Google error vocabularies, and transport failures.
/// Everything else — including 4xx auth and invalid-argument errors — is
/// permanent.
const RETRYABLE_MARKERS: &[&str] = &[
    "HTTP 429",
    "HTTP 500",
    "HTTP 502",
    "HTTP 503",
    "HTTP 504",
    "rate_limit_error",
    "rate_limit_exceeded",
    "overloaded_error",
    "server_error",
    "RESOURCE_EXHAUSTED",
    "INTERNAL",
    "UNAVAILABLE",
    ":econnrefused",
    ":closed",
    ":timeout",
];

/// Pure classifier over a provider error string.
pub fn is_retryable(message: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|m| message.contains(m))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
