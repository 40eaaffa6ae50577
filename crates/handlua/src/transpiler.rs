// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template transpiler: ordered segments to a generated Lua function body.
//!
//! Literal segments become buffered writes, expression segments become
//! evaluate-and-write statements with the resolved encoding policy, and code
//! blocks are emitted verbatim. A handful of context directives are
//! recognized when a code block consists of exactly one of them:
//!
//! - `script.layout = "path"` — records the unit's layout reference
//! - `script.section("name")` / `script.endsection()` — captures the
//!   generated source in between under the section name
//! - `script.content()` / `script.render_section("name")` — splice
//!   placeholders for layout pages
//! - `script.partial("path" [, model])` — runtime partial render appended
//!   to the output buffer
//!
//! Anything else inside a code block is ordinary Lua and passes through
//! untouched, including `script.title` reads and writes.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{HandluaError, Result};
use crate::tokenizer::{EncodingMode, Segment};

/// Splice placeholder for a content page's default body.
pub const CONTENT_MARKER: &str = "--[[__HANDLUA_CONTENT__]]";

/// Splice placeholder line for a named section.
pub fn section_marker(name: &str) -> String {
    format!("--[[__HANDLUA_SECTION({})__]]", name)
}

lazy_static! {
    static ref LAYOUT_RE: Regex =
        Regex::new(r#"^\s*script\.layout\s*=\s*["']([^"']*)["']\s*$"#).unwrap();
    static ref SECTION_OPEN_RE: Regex =
        Regex::new(r#"^\s*script\.section\s*\(\s*["']([^"']+)["']\s*\)\s*$"#).unwrap();
    static ref SECTION_CLOSE_RE: Regex =
        Regex::new(r"^\s*script\.endsection\s*\(\s*\)\s*$").unwrap();
    static ref CONTENT_RE: Regex = Regex::new(r"^\s*script\.content\s*\(\s*\)\s*$").unwrap();
    static ref RENDER_SECTION_RE: Regex =
        Regex::new(r#"^\s*script\.render_section\s*\(\s*["']([^"']+)["']\s*\)\s*$"#).unwrap();
    static ref PARTIAL_RE: Regex =
        Regex::new(r#"(?s)^\s*script\.partial\s*\(\s*["']([^"']+)["']\s*(?:,(.*))?\)\s*$"#)
            .unwrap();
    static ref ARG_RE: Regex = Regex::new(r"@(\d+)").unwrap();
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// A partial reference encountered while transpiling, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRef {
    /// The raw path expression as written in the template.
    pub path: String,
    /// The model expression passed to the partial, if any.
    pub model: Option<String>,
}

/// The product of transpiling one template.
#[derive(Debug, Clone, Default)]
pub struct ParsedUnit {
    /// Generated Lua source for the default body.
    pub body: String,
    /// Captured named sections, in declaration order.
    pub sections: Vec<(String, String)>,
    /// Layout reference, if the template set one.
    pub layout: Option<String>,
    /// Partial references, in document order.
    pub partials: Vec<PartialRef>,
}

/// Transpile-time options.
#[derive(Debug, Clone, Copy)]
pub struct TranspileOptions {
    /// Whether default-policy expressions HTML-encode.
    pub html_encode_by_default: bool,
}

/// Renders text as a Lua string literal.
pub fn lua_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push('\\');
                out.push_str(&(c as u32).to_string());
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn target<'a>(
    body: &'a mut String,
    section: &'a mut Option<(String, String)>,
) -> &'a mut String {
    match section {
        Some((_, buf)) => buf,
        None => body,
    }
}

fn emit(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
}

/// Walks segments and produces a [`ParsedUnit`].
///
/// # Errors
///
/// Returns [`HandluaError::Template`] for structural violations: nested or
/// unclosed sections, duplicate section names, `endsection` without a
/// matching open.
pub fn transpile(segments: &[Segment], options: &TranspileOptions) -> Result<ParsedUnit> {
    let mut unit = ParsedUnit::default();
    let mut section: Option<(String, String)> = None;

    for segment in segments {
        match segment {
            Segment::Literal(text) => {
                let line = format!("__out[#__out + 1] = {}", lua_string_literal(text));
                emit(target(&mut unit.body, &mut section), &line);
            }
            Segment::Expression { code, encoding } => {
                if code.is_empty() {
                    continue;
                }
                let encode = match encoding {
                    EncodingMode::ForceEncoded => true,
                    EncodingMode::ForceRaw => false,
                    EncodingMode::Default => options.html_encode_by_default,
                };
                let writer = if encode { "__html" } else { "__text" };
                let line = format!("__out[#__out + 1] = {}({})", writer, code);
                emit(target(&mut unit.body, &mut section), &line);
            }
            Segment::CodeBlock(code) => {
                transpile_code_block(code, &mut unit, &mut section)?;
            }
        }
    }

    if let Some((name, _)) = section {
        return Err(HandluaError::Template(format!(
            "section {:?} is never closed",
            name
        )));
    }

    Ok(unit)
}

fn transpile_code_block(
    code: &str,
    unit: &mut ParsedUnit,
    section: &mut Option<(String, String)>,
) -> Result<()> {
    if let Some(caps) = LAYOUT_RE.captures(code) {
        unit.layout = Some(caps[1].to_string());
        return Ok(());
    }
    if let Some(caps) = SECTION_OPEN_RE.captures(code) {
        let name = caps[1].to_string();
        if section.is_some() {
            return Err(HandluaError::Template(format!(
                "section {:?} opened inside another section",
                name
            )));
        }
        if unit.sections.iter().any(|(n, _)| n == &name) {
            return Err(HandluaError::Template(format!(
                "section {:?} is declared twice",
                name
            )));
        }
        *section = Some((name, String::new()));
        return Ok(());
    }
    if SECTION_CLOSE_RE.is_match(code) {
        let Some((name, captured)) = section.take() else {
            return Err(HandluaError::Template(
                "endsection without an open section".into(),
            ));
        };
        unit.sections.push((name, captured));
        return Ok(());
    }
    if CONTENT_RE.is_match(code) {
        emit(target(&mut unit.body, section), CONTENT_MARKER);
        return Ok(());
    }
    if let Some(caps) = RENDER_SECTION_RE.captures(code) {
        emit(target(&mut unit.body, section), &section_marker(&caps[1]));
        return Ok(());
    }
    if let Some(caps) = PARTIAL_RE.captures(code) {
        let path = caps[1].to_string();
        let model = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .filter(|m| !m.is_empty());
        let line = format!(
            "__out[#__out + 1] = script.partial({}, {})",
            lua_string_literal(&path),
            model.as_deref().unwrap_or("nil")
        );
        emit(target(&mut unit.body, section), &line);
        unit.partials.push(PartialRef { path, model });
        return Ok(());
    }

    emit(target(&mut unit.body, section), code);
    Ok(())
}

const PRELUDE: &str = r#"local function __is_raw(value)
  return type(value) == "table" and value.__handlua_raw == true
end

local function __text(value)
  if value == nil then return "" end
  if __is_raw(value) then return tostring(value.value) end
  return tostring(value)
end

local function __escape(value)
  local s = __text(value)
  s = string.gsub(s, "&", "&amp;")
  s = string.gsub(s, "<", "&lt;")
  s = string.gsub(s, ">", "&gt;")
  s = string.gsub(s, "\"", "&quot;")
  s = string.gsub(s, "'", "&#39;")
  return s
end

local function __html(value)
  if __is_raw(value) then return tostring(value.value) end
  return __escape(value)
end
"#;

fn module_imports(modules: &[String]) -> Result<String> {
    let mut out = String::new();
    for module in modules {
        if !IDENT_RE.is_match(module) {
            return Err(HandluaError::Template(format!(
                "module import {:?} is not a valid Lua identifier",
                module
            )));
        }
        out.push_str(&format!("local {m} = require(\"{m}\")\n", m = module));
    }
    Ok(out)
}

/// Wraps a composed template body into a complete compilable chunk.
///
/// The chunk evaluates to an exports table with a `render` function taking
/// the per-render `script` context as its sole parameter.
pub fn assemble_template(body: &str, modules: &[String]) -> Result<String> {
    let mut source = String::from("-- generated by handlua\n");
    source.push_str(PRELUDE);
    source.push_str(&module_imports(modules)?);
    source.push_str("\nlocal function render(script)\n");
    source.push_str("local Model = script.Model\n");
    source.push_str("local __out = script.out\n");
    source.push_str(body);
    source.push_str("return table.concat(__out)\nend\n\nreturn { render = render }\n");
    Ok(source)
}

/// Wraps a code snippet into a compilable chunk exporting a `run` function.
///
/// Positional `@N` placeholders must already be substituted; the wrapper
/// binds the invocation's arguments to `__args`.
pub fn assemble_snippet(code: &str, modules: &[String]) -> Result<String> {
    let mut source = String::from("-- generated by handlua\n");
    source.push_str(PRELUDE);
    source.push_str(&module_imports(modules)?);
    source.push_str("\nlocal function run(...)\n");
    source.push_str("local __args = table.pack(...)\n");
    source.push_str(code);
    source.push_str("\nend\n\nreturn { run = run }\n");
    Ok(source)
}

/// Wraps a source unit declaring `local function`s into a compilable chunk
/// exporting the named method.
pub fn assemble_method(source_body: &str, method: &str, modules: &[String]) -> Result<String> {
    if !IDENT_RE.is_match(method) {
        return Err(HandluaError::Template(format!(
            "method name {:?} is not a valid Lua identifier",
            method
        )));
    }
    let mut source = String::from("-- generated by handlua\n");
    source.push_str(PRELUDE);
    source.push_str(&module_imports(modules)?);
    source.push('\n');
    source.push_str(source_body);
    source.push_str(&format!("\nreturn {{ [\"{m}\"] = {m} }}\n", m = method));
    Ok(source)
}

/// Rewrites `@0`, `@1`, … placeholders to `__args[1]`, `__args[2]`, …
///
/// A single greedy-digit pass, so `@10` can never be corrupted into
/// `__args[1]0`. Literal `@digit` text inside the snippet is rewritten too;
/// known limitation of the scheme.
pub fn substitute_parameters(code: &str) -> String {
    ARG_RE
        .replace_all(code, |caps: &regex::Captures| {
            let index: usize = caps[1].parse().unwrap_or(0);
            format!("__args[{}]", index + 1)
        })
        .into_owned()
}
