// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Layout/section composition by textual splice.
//!
//! A content page's generated body and captured sections are spliced into
//! the placeholder lines of its layout's generated source before the merged
//! page is compiled as one unit. This is deliberately not a set of nested
//! runtime calls: ambient values written by early-spliced section code (a
//! title, say) are visible to later layout output because the splice puts
//! that code textually first. Partials, by contrast, compile and execute
//! independently; the asymmetry is intentional.
//!
//! Splice policy:
//!
//! - a section the layout references but the content never declared splices
//!   to empty text, without error
//! - a section the content declared but no layout ever places is dropped
//!   silently
//! - layouts may themselves declare a layout; composition recurses until a
//!   unit without a layout reference remains

use std::collections::HashSet;

use crate::transpiler::{section_marker, ParsedUnit, CONTENT_MARKER};

/// Extracts the section name from a splice placeholder line, if it is one.
fn parse_section_marker(line: &str) -> Option<&str> {
    line.strip_prefix("--[[__HANDLUA_SECTION(")?
        .strip_suffix(")__]]")
}

/// Splices a content unit into its layout unit, producing the merged unit.
///
/// The merged unit takes the layout's own layout reference (chained layouts
/// recurse from there). Content sections the layout did not place are
/// carried upward so an outer layout may still place them.
pub fn compose(content: ParsedUnit, layout: ParsedUnit) -> ParsedUnit {
    let mut consumed: HashSet<String> = HashSet::new();
    let mut body = String::new();

    for line in layout.body.lines() {
        if line == CONTENT_MARKER {
            body.push_str(&content.body);
        } else if let Some(name) = parse_section_marker(line) {
            if let Some((_, source)) = content.sections.iter().find(|(n, _)| n == name) {
                body.push_str(source);
                consumed.insert(name.to_string());
            }
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    let mut sections: Vec<(String, String)> = content
        .sections
        .into_iter()
        .filter(|(name, _)| !consumed.contains(name))
        .collect();
    sections.extend(layout.sections);

    let mut partials = content.partials;
    partials.extend(layout.partials);

    ParsedUnit {
        body,
        sections,
        layout: layout.layout,
        partials,
    }
}

/// Removes any splice placeholder still present after composition.
///
/// A standalone page calling `script.render_section` renders empty at that
/// location; leftover markers are comments to Lua either way, this keeps
/// the generated source clean for inspection and cache keying.
pub fn strip_markers(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        if line == CONTENT_MARKER || parse_section_marker(line).is_some() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
