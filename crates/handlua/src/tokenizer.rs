// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Delimiter tokenizer.
//!
//! Splits raw template text into an ordered sequence of [`Segment`]s using
//! the configured [`DelimiterSet`]. The scanner walks left to right;
//! everything outside a marker accumulates into a literal segment, flushed
//! whenever a marker begins. Markers sharing a prefix are resolved by the
//! longest-prefix rule (`{{%` beats `{{`). Comments are consumed here and
//! never reach the transpiler.
//!
//! Code blocks may span multiple lines, and a Lua block opened in one code
//! block (`for ... do`) can legally be closed by a later one (`end`): all
//! code-block text is emitted into the same generated function body, in
//! document order.

use nom::bytes::complete::{tag, take_until};
use nom::{IResult, Input, Parser};
use nom_locate::LocatedSpan;

use crate::delimiters::{DelimiterSet, Marker, MarkerKind};
use crate::error::{HandluaError, Result};

type Span<'a> = LocatedSpan<&'a str>;

/// How an expression segment's result is written to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// Follow the delimiter set's default policy.
    Default,
    /// Always HTML-encode.
    ForceEncoded,
    /// Never encode.
    ForceRaw,
}

/// One classified chunk of a tokenized template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Verbatim text, written to the output unmodified.
    Literal(String),
    /// An expression to evaluate and write.
    Expression {
        /// The expression source, trimmed.
        code: String,
        /// Encoding applied to the result.
        encoding: EncodingMode,
    },
    /// Verbatim code statements.
    CodeBlock(String),
}

/// The body between an open and close marker.
fn marker_body<'a>(input: Span<'a>, open: &str, close: &str) -> IResult<Span<'a>, Span<'a>> {
    let (rest, _) = tag(open).parse(input)?;
    let (rest, body) = take_until(close).parse(rest)?;
    let (rest, _) = tag(close).parse(rest)?;
    Ok((rest, body))
}

/// Finds the earliest marker occurrence in `fragment`.
///
/// `markers` is ordered longest-open-first, so when several markers start at
/// the same offset the longest one wins.
fn next_marker<'m>(fragment: &str, markers: &'m [Marker]) -> Option<(usize, &'m Marker)> {
    let mut found: Option<(usize, &Marker)> = None;
    for marker in markers {
        if let Some(idx) = fragment.find(marker.open.as_str()) {
            match found {
                Some((best, _)) if idx >= best => {}
                _ => found = Some((idx, marker)),
            }
        }
    }
    found
}

/// Tokenizes template text into an ordered segment sequence.
///
/// # Errors
///
/// Returns [`HandluaError::Parse`] naming the marker and its byte offset
/// when a start marker has no matching end before end of input.
pub fn tokenize(text: &str, delimiters: &DelimiterSet) -> Result<Vec<Segment>> {
    delimiters.validate()?;
    let markers = delimiters.markers();

    let mut segments = Vec::new();
    let mut input = Span::new(text);

    loop {
        let fragment: &str = input.fragment();
        let Some((idx, marker)) = next_marker(fragment, &markers) else {
            if !fragment.is_empty() {
                segments.push(Segment::Literal(fragment.to_string()));
            }
            break;
        };

        if idx > 0 {
            segments.push(Segment::Literal(fragment[..idx].to_string()));
        }
        let (at_marker, _literal) = input.take_split(idx);
        let offset = at_marker.location_offset();

        let (rest, body) =
            marker_body(at_marker, &marker.open, &marker.close).map_err(|_| {
                HandluaError::Parse {
                    marker: marker.open.clone(),
                    offset,
                }
            })?;

        match marker.kind {
            MarkerKind::Expression => segments.push(Segment::Expression {
                code: body.fragment().trim().to_string(),
                encoding: EncodingMode::Default,
            }),
            MarkerKind::EncodedExpression => segments.push(Segment::Expression {
                code: body.fragment().trim().to_string(),
                encoding: EncodingMode::ForceEncoded,
            }),
            MarkerKind::RawExpression => segments.push(Segment::Expression {
                code: body.fragment().trim().to_string(),
                encoding: EncodingMode::ForceRaw,
            }),
            MarkerKind::Code => {
                segments.push(Segment::CodeBlock(body.fragment().to_string()));
            }
            MarkerKind::Comment => {}
        }

        input = rest;
    }

    Ok(segments)
}
