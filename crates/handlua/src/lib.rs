// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

// Warn on missing documentation for public items
#![warn(missing_docs)]
// Allow large error types - HandluaError carries formatted diagnostics.
#![allow(clippy::result_large_err)]

//! # handlua
//!
//! Handlebars-delimited Lua script templates for Rust.
//!
//! handlua embeds Lua logic inside text documents using a Handlebars-like
//! delimiter syntax and turns those documents into compiled, cached,
//! repeatedly-invokable units. It also compiles and runs standalone Lua
//! snippets and methods on demand, with the same content-addressed cache so
//! identical source never recompiles.
//!
//! ## Features
//!
//! - `{{ expr }}`, `{{: encoded }}`, `{{! raw }}`, `{{% code %}}` and
//!   `{{@ comment @}}` markers, all configurable
//! - Layout/section composition by textual splice, partials as independent
//!   renders
//! - Content-addressed compile cache (memory, LRU or filesystem)
//! - Snippet/method execution with `@0`, `@1`, … positional arguments
//! - Error capture with post-mortem access to the generated source
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use handlua::{Engine, MemoryResolver};
//!
//! let engine = Engine::with_memory_cache(MemoryResolver::new())?;
//! let html = engine.execute_script(
//!     "Hello {{ Model.name }}!",
//!     &serde_json::json!({ "name": "World" }),
//! )?;
//! assert_eq!(html, "Hello World!");
//! ```

/// Configurable delimiter markers.
pub mod delimiters;
/// Delimiter tokenizer.
pub mod tokenizer;
/// Segments to generated Lua source.
pub mod transpiler;
/// Layout/section composition by textual splice.
pub mod composer;
/// Template resource resolution (filesystem, memory).
pub mod resolver;
/// Compiled artifact caching.
pub mod cache;
/// Compilation against the Lua toolchain.
pub mod compiler;
/// The per-render execution context.
pub mod context;
/// The script engine.
pub mod engine;
/// Error types and reporting.
pub mod error;
/// Lua runtime extensions.
pub mod extensions;

pub use cache::{cache_key, Artifact, BoundedCache, CompileCache, CompileMode, MemoryCache};
#[cfg(feature = "filesystem")]
pub use cache::FileSystemCache;
pub use delimiters::DelimiterSet;
pub use engine::{Engine, EngineConfig, ErrorState};
pub use error::{ErrorKind, HandluaError, Result};
pub use resolver::{resolve_path, MemoryResolver, TemplateResolver};
#[cfg(feature = "filesystem")]
pub use resolver::FileSystemResolver;
pub use tokenizer::{EncodingMode, Segment};
pub use transpiler::{ParsedUnit, PartialRef};

// Re-export the Lua value type callers see from execute_code/execute_method.
pub use mlua::Value;

#[cfg(test)]
mod tests;
