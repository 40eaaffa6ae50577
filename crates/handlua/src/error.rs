// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Error types for the handlua scripting engine.
//!
//! This module defines [`HandluaError`], the main error enum, the
//! [`ErrorKind`] taxonomy used by the engine's post-mortem error state,
//! and [`NestedFailure`], the carrier used to propagate a failure out of a
//! nested render (layout or partial) through the Lua call stack without
//! losing its kind.
//!
//! # Error Categories
//!
//! - **Parse errors**: unterminated or mismatched delimiter markers
//! - **Template errors**: structurally invalid templates (unclosed section,
//!   bad method name)
//! - **Resolution errors**: layout/partial path not found
//! - **Compile errors**: diagnostics from the Lua compiler, aggregated
//! - **Runtime errors**: failures raised while compiled code executes

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The main error type for handlua operations.
///
/// All fallible handlua functions return `Result<T, HandluaError>`.
#[derive(Error, Debug)]
pub enum HandluaError {
    /// A delimiter marker was opened but never terminated.
    #[error("parse error: unterminated {marker:?} marker at offset {offset}")]
    Parse {
        /// The offending start marker.
        marker: String,
        /// Byte offset of the marker in the template source.
        offset: usize,
    },

    /// The template structure is invalid.
    #[error("invalid template: {0}")]
    Template(String),

    /// A referenced layout or partial could not be found or read.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The Lua compiler rejected the generated source.
    ///
    /// The message aggregates every diagnostic with its line number in the
    /// generated source. Compile failures are never cached.
    #[error("compile error:\n{0}")]
    Compile(String),

    /// Lua runtime execution error.
    #[error("runtime error: {0}")]
    Lua(#[from] mlua::Error),

    /// File I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache operation failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// A failure that crossed the Lua boundary from a nested render.
    ///
    /// Carries the original kind so a failing partial deep inside a page
    /// still reports as, say, a resolution error at the top level.
    #[error("{message}")]
    Nested {
        /// Kind of the original failure.
        kind: ErrorKind,
        /// The original failure, rendered.
        message: String,
    },
}

/// Coarse error taxonomy, exposed through the engine's error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Delimiter-level parse failure.
    Parse,
    /// Structurally invalid template.
    Template,
    /// Layout/partial path not found.
    Resolution,
    /// Compiler diagnostics for the generated source.
    Compile,
    /// Failure while the compiled code executed.
    Runtime,
    /// File I/O failure.
    Io,
    /// Cache failure.
    Cache,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Template => "template",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Compile => "compile",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Io => "io",
            ErrorKind::Cache => "cache",
        };
        write!(f, "{}", name)
    }
}

impl HandluaError {
    /// Returns the kind bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandluaError::Parse { .. } => ErrorKind::Parse,
            HandluaError::Template(_) => ErrorKind::Template,
            HandluaError::Resolution(_) => ErrorKind::Resolution,
            HandluaError::Compile(_) => ErrorKind::Compile,
            HandluaError::Lua(_) => ErrorKind::Runtime,
            HandluaError::Io(_) => ErrorKind::Io,
            HandluaError::Cache(_) => ErrorKind::Cache,
            HandluaError::Nested { kind, .. } => *kind,
        }
    }

    /// Rebuilds an error from a kind and a pre-formatted message.
    ///
    /// Used when a failure crossed the Lua boundary as a [`NestedFailure`]
    /// and only its kind and rendered message survive.
    pub fn from_parts(kind: ErrorKind, message: String) -> Self {
        HandluaError::Nested { kind, message }
    }
}

/// A failure propagating out of a nested render through the Lua stack.
///
/// Layout and partial renders run inside Lua callbacks, where only
/// `mlua::Error` can travel. The nested error is flattened into this
/// cloneable carrier, attached via [`mlua::Error::external`], and recovered
/// by [`unwrap_lua_error`] on the way out.
#[derive(Debug, Clone)]
pub struct NestedFailure {
    /// The kind of the original failure.
    pub kind: ErrorKind,
    /// The original failure, rendered.
    pub message: String,
}

impl fmt::Display for NestedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NestedFailure {}

impl NestedFailure {
    /// Flattens a [`HandluaError`] into a carrier suitable for crossing the
    /// Lua boundary.
    pub fn from_error(err: &HandluaError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Wraps a [`HandluaError`] into an `mlua::Error` for raising inside a
    /// Lua callback.
    pub fn raise(err: HandluaError) -> mlua::Error {
        mlua::Error::external(Self::from_error(&err))
    }
}

/// Unwraps an invocation failure back into a [`HandluaError`].
///
/// Walks mlua's callback/context wrappers down to the original cause. A
/// [`NestedFailure`] planted by a nested render is restored with its kind;
/// anything else surfaces as a runtime error.
pub fn unwrap_lua_error(err: mlua::Error) -> HandluaError {
    match err {
        mlua::Error::CallbackError { cause, .. } => unwrap_lua_error(cause_owned(&cause)),
        mlua::Error::WithContext { cause, .. } => unwrap_lua_error(cause_owned(&cause)),
        mlua::Error::ExternalError(inner) => {
            if let Some(nested) = inner.downcast_ref::<NestedFailure>() {
                HandluaError::from_parts(nested.kind, nested.message.clone())
            } else {
                HandluaError::Lua(mlua::Error::ExternalError(inner))
            }
        }
        other => HandluaError::Lua(other),
    }
}

fn cause_owned(cause: &Arc<mlua::Error>) -> mlua::Error {
    (**cause).clone()
}

/// Convenience type alias for Results with [`HandluaError`].
pub type Result<T> = std::result::Result<T, HandluaError>;
