// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Configurable delimiter markers for the template tokenizer.
//!
//! The default grammar:
//!
//! | Marker | Meaning |
//! |---|---|
//! | `{{ expr }}` | expression, encoding per default policy |
//! | `{{: expr }}` | expression, force HTML-encoded |
//! | `{{! expr }}` | expression, force raw |
//! | `{{% code %}}` | verbatim Lua statements |
//! | `{{@ text @}}` | comment, discarded |
//!
//! Markers are plain strings and can be replaced wholesale (e.g. an
//! ASP-style `<% %>` set). The set is immutable once the engine has parsed
//! its first template.

use crate::error::{HandluaError, Result};

/// What a matched start marker introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `{{ expr }}` — expression with default encoding policy.
    Expression,
    /// `{{: expr }}` — expression, force HTML-encoded.
    EncodedExpression,
    /// `{{! expr }}` — expression, force raw.
    RawExpression,
    /// `{{% code %}}` — verbatim code statements.
    Code,
    /// `{{@ text @}}` — comment, discarded by the tokenizer.
    Comment,
}

/// A start/end marker pair the tokenizer scans for.
#[derive(Debug, Clone)]
pub struct Marker {
    /// What this marker introduces.
    pub kind: MarkerKind,
    /// The opening token.
    pub open: String,
    /// The closing token.
    pub close: String,
}

/// The configurable delimiter table.
///
/// Construct via [`DelimiterSet::default`] and override fields before the
/// first parse. [`DelimiterSet::markers`] produces the scan table ordered
/// so that markers sharing a prefix are tried longest first.
#[derive(Debug, Clone)]
pub struct DelimiterSet {
    /// Start of a default-policy expression.
    pub expression_start: String,
    /// End of any expression marker.
    pub expression_end: String,
    /// Start of a verbatim code block.
    pub code_start: String,
    /// End of a verbatim code block.
    pub code_end: String,
    /// Start of a force-encoded expression (closed by `expression_end`).
    pub encoded_expression_start: String,
    /// Start of a force-raw expression (closed by `expression_end`).
    pub raw_expression_start: String,
    /// Start of a comment.
    pub comment_start: String,
    /// End of a comment.
    pub comment_end: String,
    /// Whether `{{ expr }}` HTML-encodes by default.
    pub html_encode_expressions_by_default: bool,
}

impl Default for DelimiterSet {
    fn default() -> Self {
        Self {
            expression_start: "{{".into(),
            expression_end: "}}".into(),
            code_start: "{{%".into(),
            code_end: "%}}".into(),
            encoded_expression_start: "{{:".into(),
            raw_expression_start: "{{!".into(),
            comment_start: "{{@".into(),
            comment_end: "@}}".into(),
            html_encode_expressions_by_default: false,
        }
    }
}

impl DelimiterSet {
    /// Builds the tokenizer scan table.
    ///
    /// Ordered by descending open-marker length so that `{{%`, `{{:`, `{{!`
    /// and `{{@` are matched before the generic `{{` they share a prefix
    /// with (longest-prefix rule).
    pub fn markers(&self) -> Vec<Marker> {
        let mut markers = vec![
            Marker {
                kind: MarkerKind::Code,
                open: self.code_start.clone(),
                close: self.code_end.clone(),
            },
            Marker {
                kind: MarkerKind::Comment,
                open: self.comment_start.clone(),
                close: self.comment_end.clone(),
            },
            Marker {
                kind: MarkerKind::EncodedExpression,
                open: self.encoded_expression_start.clone(),
                close: self.expression_end.clone(),
            },
            Marker {
                kind: MarkerKind::RawExpression,
                open: self.raw_expression_start.clone(),
                close: self.expression_end.clone(),
            },
            Marker {
                kind: MarkerKind::Expression,
                open: self.expression_start.clone(),
                close: self.expression_end.clone(),
            },
        ];
        markers.sort_by_key(|m| std::cmp::Reverse(m.open.len()));
        markers
    }

    /// Checks that every marker is non-empty and start markers are distinct.
    pub fn validate(&self) -> Result<()> {
        let opens = [
            &self.expression_start,
            &self.code_start,
            &self.encoded_expression_start,
            &self.raw_expression_start,
            &self.comment_start,
        ];
        let closes = [&self.expression_end, &self.code_end, &self.comment_end];
        for marker in opens.iter().chain(closes.iter()) {
            if marker.is_empty() {
                return Err(HandluaError::Template(
                    "delimiter markers must be non-empty".into(),
                ));
            }
        }
        for (i, a) in opens.iter().enumerate() {
            for b in opens.iter().skip(i + 1) {
                if a == b {
                    return Err(HandluaError::Template(format!(
                        "duplicate start marker {:?}",
                        a
                    )));
                }
            }
        }
        Ok(())
    }
}
