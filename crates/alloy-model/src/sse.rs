// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Server-sent-event framing.
//!
//! Pure transport utility: byte chunks arrive in arbitrary splits, complete
//! events come out, the trailing partial event stays in the caller's buffer
//! for the next chunk. No JSON parsing happens here — drivers decode the
//! `data` payloads themselves.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenation of all `data:` lines, joined with LF.
    pub data: String,
}

/// Append `chunk` to `buffer` and drain every complete event.
///
/// Framing rules:
/// - CRLF is normalized to LF before scanning.
/// - Events are separated by a blank line (two consecutive LF).
/// - `event:` sets the event type; one optional space after the colon is
///   stripped.
/// - Multiple `data:` lines concatenate with LF between them.
/// - Lines starting with `:` are keepalive comments and are ignored.
/// - Events without any `data:` line are skipped.
/// - The `[DONE]` sentinel is a valid payload and is surfaced, not filtered.
/// - The trailing (possibly partial) event remains in `buffer`.
pub fn feed(buffer: &mut String, chunk: &str) -> Vec<SseEvent> {
    buffer.push_str(chunk);
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let raw: String = buffer[..pos].to_string();
        buffer.drain(..pos + 2);
        if let Some(ev) = parse_event(&raw) {
            events.push(ev);
        }
    }
    events
}

/// Parse one complete event body (the text between blank-line separators).
fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.split('\n') {
        if line.starts_with(':') {
            continue; // keepalive comment
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Unknown fields (id:, retry:, …) are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent { event, data: data_lines.join("\n") })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
