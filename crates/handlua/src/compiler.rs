// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Compilation against the Lua toolchain, guarded by the cache.
//!
//! The Lua compiler is consumed as an opaque service: generated source in,
//! either an [`Artifact`] (source plus precompiled chunk dump) or
//! aggregated diagnostics out. [`get_or_compile`] is the cache-guarded
//! entry: a hit never touches the compiler; a miss compiles, stores and
//! returns. Failures are reported with the line numbers the toolchain
//! produced and are never cached — an identical retry recompiles, which is
//! the accepted cost for sources expected to be corrected before retry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use mlua::Lua;
use regex::Regex;

use crate::cache::{cache_key, chunk_name_for, Artifact, CompileCache, CompileMode};
use crate::error::{HandluaError, Result};

lazy_static! {
    static ref LINE_RE: Regex = Regex::new(r":(\d+):\s*(.*)$").unwrap();
}

/// Reformats a toolchain error into the aggregated diagnostic message.
///
/// Each line carrying a `:<line>:` location is rewritten as
/// `[line N] message`; the chunk-name noise is dropped.
fn format_diagnostics(err: &mlua::Error) -> String {
    let text = err.to_string();
    let mut lines = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = LINE_RE.captures(line) {
            lines.push(format!("  [line {}] {}", &caps[1], &caps[2]));
        } else {
            lines.push(format!("  {}", line));
        }
    }
    lines.join("\n")
}

/// Compiles generated source into an [`Artifact`].
///
/// # Errors
///
/// Returns [`HandluaError::Compile`] with the aggregated diagnostics when
/// the toolchain rejects the source.
pub fn compile_source(
    lua: &Lua,
    source: &str,
    mode: CompileMode,
    chunk_name: &str,
) -> Result<Artifact> {
    let func = lua
        .load(source)
        .set_name(chunk_name)
        .into_function()
        .map_err(|e| HandluaError::Compile(format_diagnostics(&e)))?;

    let strip = matches!(mode, CompileMode::Release);
    Ok(Artifact {
        source: source.to_string(),
        chunk_name: chunk_name.to_string(),
        bytecode: func.dump(strip),
        mode,
    })
}

/// Cache-guarded compilation.
///
/// Under a race, two callers missing on the same key may both compile;
/// the last insert wins and the artifacts are identical.
pub fn get_or_compile(
    lua: &Lua,
    cache: &dyn CompileCache,
    source: &str,
    mode: CompileMode,
    compile_count: &AtomicUsize,
) -> Result<Arc<Artifact>> {
    let key = cache_key(source, mode);
    if let Some(artifact) = cache.get(&key)? {
        tracing::debug!(key = %&key[..12], "compile cache hit");
        return Ok(artifact);
    }

    tracing::debug!(key = %&key[..12], "compile cache miss");
    compile_count.fetch_add(1, Ordering::Relaxed);
    let artifact = Arc::new(compile_source(lua, source, mode, &chunk_name_for(&key))?);
    cache.set(&key, artifact.clone())?;
    Ok(artifact)
}

/// Loads an artifact's chunk, ready to instantiate.
///
/// The returned function is the unevaluated chunk: calling it runs the
/// chunk top level and yields a fresh exports table, so every execution
/// call gets its own instance.
pub fn load_chunk(lua: &Lua, artifact: &Artifact) -> Result<mlua::Function> {
    lua.load(artifact.source.as_str())
        .set_name(artifact.chunk_name.clone())
        .into_function()
        .map_err(HandluaError::Lua)
}
