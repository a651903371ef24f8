// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic, content-aware tool-result truncation.
//!
//! Oversized tool results would crowd everything else out of the context
//! window; the executor caps them before they enter the conversation. Every
//! truncated result ends with an explicit notice so the model knows more
//! content exists.

use crate::tool::OutputCategory;

/// Return `content` unchanged when it fits within `cap_tokens` (4 chars per
/// token), otherwise apply the category's extraction strategy.
///
/// A cap of 0 disables truncation.
pub fn truncate_output(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len() - cap_chars;
    match category {
        OutputCategory::HeadTail => head_tail(content, cap_chars, omitted_bytes),
        OutputCategory::Generic => {
            let cut = content[..cap_chars].rfind('\n').unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Keep leading and trailing lines within half the budget each, with an
/// omission notice between them.
fn head_tail(content: &str, cap_chars: usize, omitted_bytes: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half = cap_chars / 2;

    let mut head = String::with_capacity(half);
    let mut head_count = 0usize;
    for line in &lines {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev() {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    format!(
        "{head}\n[... {omitted} lines / {omitted_bytes} bytes omitted ...]\n{tail}",
        tail = tail_lines.join("\n")
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_passes_through() {
        let s = "short output";
        assert_eq!(truncate_output(s, OutputCategory::Generic, 100), s);
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let s = "x".repeat(10_000);
        assert_eq!(truncate_output(&s, OutputCategory::Generic, 0), s);
    }

    #[test]
    fn generic_truncation_appends_notice() {
        let s = (0..100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = truncate_output(&s, OutputCategory::Generic, 20);
        assert!(out.len() < s.len());
        assert!(out.contains("bytes omitted"));
    }

    #[test]
    fn generic_truncation_cuts_at_line_boundary() {
        let s = (0..100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = truncate_output(&s, OutputCategory::Generic, 20);
        let kept = out.split("\n[...").next().unwrap();
        assert!(kept.ends_with(|c: char| c.is_ascii_digit()), "cut mid-line: {kept:?}");
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let s = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = truncate_output(&s, OutputCategory::HeadTail, 40);
        assert!(out.contains("line 0"), "head missing");
        assert!(out.contains("line 199"), "tail missing");
        assert!(out.contains("lines /"), "notice missing");
    }

    #[test]
    fn head_tail_omits_middle() {
        let s = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = truncate_output(&s, OutputCategory::HeadTail, 40);
        assert!(!out.contains("line 100"), "middle should be omitted");
    }
}
