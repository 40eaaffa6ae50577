// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The handlua script engine.
//!
//! [`Engine`] coordinates the full lifecycle: tokenize, transpile, compose
//! layouts and sections, compile through the cache, instantiate and invoke.
//! It is generic over the [`TemplateResolver`] used to load layout and
//! partial sources.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use handlua::{Engine, MemoryResolver};
//!
//! let engine = Engine::with_memory_cache(MemoryResolver::new())?;
//! let html = engine.execute_script(
//!     "Hello {{ Model.name }}!",
//!     &serde_json::json!({ "name": "World" }),
//! )?;
//! ```
//!
//! # Error capture
//!
//! Every entry point clears the engine's error state on entry. On failure
//! the state records the error kind and message for post-mortem
//! inspection, and the call returns an empty result; with
//! [`Engine::set_throw_on_error`] enabled the captured cause is returned
//! as `Err` instead. The most recent top-level generated source is always
//! available through [`Engine::generated_code`].
//!
//! # Concurrency
//!
//! The engine spawns no threads and owns a single Lua state; callers
//! wanting parallel renders create one engine per thread. The compile
//! cache is the only shared resource and is safe to share across engines.
//!
//! Synchronous entry points never drive asynchronous Lua computations: a
//! method that suspends is the caller's to resume. The `*_async` variants
//! (feature `async-lua`) await and unwrap the result.
//!
//! # No sandbox
//!
//! Executed code has the full ambient capability of the embedded Lua
//! runtime. This engine is not an isolation boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value};
use serde::Serialize;

use crate::cache::{cache_key, Artifact, CompileCache, CompileMode, MemoryCache};
use crate::compiler::{get_or_compile, load_chunk};
use crate::composer::{compose, strip_markers};
use crate::context::new_script_context;
use crate::delimiters::DelimiterSet;
use crate::error::{unwrap_lua_error, ErrorKind, HandluaError, NestedFailure, Result};
use crate::resolver::{resolve_path, TemplateResolver};
use crate::tokenizer::tokenize;
use crate::transpiler::{
    assemble_method, assemble_snippet, assemble_template, substitute_parameters, transpile,
    TranspileOptions,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delimiter markers and the default encoding policy.
    pub delimiters: DelimiterSet,
    /// Base path substituted for rooted (`~`, `/`, `\`) template paths.
    pub base_path: PathBuf,
    /// Module names emitted as `require` imports in every generated prelude.
    pub modules: Vec<String>,
    /// Compilation mode, part of every cache key.
    pub compile_mode: CompileMode,
    /// Whether captured failures are also returned as `Err`.
    pub throw_on_error: bool,
    /// Ceiling for nested layout/partial renders.
    pub max_include_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delimiters: DelimiterSet::default(),
            base_path: PathBuf::from("."),
            modules: Vec::new(),
            compile_mode: CompileMode::Debug,
            throw_on_error: false,
            max_include_depth: 16,
        }
    }
}

/// Post-mortem error state recorded by a failing call.
#[derive(Debug, Clone)]
pub struct ErrorState {
    /// Which stage failed.
    pub kind: ErrorKind,
    /// The rendered failure message.
    pub message: String,
}

/// State shared with the Lua callbacks that drive nested renders.
pub(crate) struct EngineShared {
    resolver: Box<dyn TemplateResolver>,
    cache: Box<dyn CompileCache>,
    config: RwLock<EngineConfig>,
    chunks: Mutex<HashMap<String, Function>>,
    compile_count: AtomicUsize,
    parse_started: AtomicBool,
    last_generated: Mutex<Option<String>>,
}

/// Generates the complete compilable source for a template: tokenize,
/// transpile, resolve and splice the layout chain, assemble.
fn generate_source(shared: &EngineShared, text: &str, doc_dir: &Path) -> Result<String> {
    let cfg = shared.config.read().unwrap().clone();
    shared.parse_started.store(true, Ordering::Relaxed);

    let opts = TranspileOptions {
        html_encode_by_default: cfg.delimiters.html_encode_expressions_by_default,
    };
    let segments = tokenize(text, &cfg.delimiters)?;
    let mut unit = transpile(&segments, &opts)?;

    let mut current_dir = doc_dir.to_path_buf();
    let mut hops = 0usize;
    while let Some(layout_raw) = unit.layout.take() {
        hops += 1;
        if hops > cfg.max_include_depth {
            return Err(HandluaError::Template(format!(
                "layout chain exceeds {} levels",
                cfg.max_include_depth
            )));
        }
        let resolved = resolve_path(&layout_raw, &cfg.base_path, &current_dir);
        let layout_text = shared.resolver.read(&resolved)?;
        let layout_segments = tokenize(&layout_text, &cfg.delimiters)?;
        let layout_unit = transpile(&layout_segments, &opts)?;
        current_dir = resolved
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cfg.base_path.clone());
        unit = compose(unit, layout_unit);
    }

    let body = strip_markers(&unit.body);
    assemble_template(&body, &cfg.modules)
}

/// Evaluates an artifact's chunk into a fresh exports table.
///
/// The loaded chunk function is kept per engine so the Lua parser runs
/// once per artifact; evaluating it per call keeps instances unshared.
fn instantiate(lua: &Lua, shared: &EngineShared, artifact: &Artifact) -> Result<Table> {
    let key = cache_key(&artifact.source, artifact.mode);
    let chunk = {
        let mut chunks = shared.chunks.lock().unwrap();
        match chunks.get(&key) {
            Some(f) => f.clone(),
            None => {
                let f = load_chunk(lua, artifact)?;
                chunks.insert(key, f.clone());
                f
            }
        }
    };
    chunk.call::<Table>(()).map_err(unwrap_lua_error)
}

/// Builds everything needed to run one template render: the compiled
/// `render` function and its per-render `script` context.
fn prepare_render(
    lua: &Lua,
    shared: &Arc<EngineShared>,
    text: &str,
    doc_dir: &Path,
    model: Value,
    depth: usize,
) -> Result<(Function, Table)> {
    let cfg = shared.config.read().unwrap().clone();
    if depth >= cfg.max_include_depth {
        return Err(HandluaError::Template(format!(
            "maximum include depth {} exceeded",
            cfg.max_include_depth
        )));
    }

    let source = generate_source(shared, text, doc_dir)?;
    if depth == 0 {
        *shared.last_generated.lock().unwrap() = Some(source.clone());
    }

    let artifact = get_or_compile(
        lua,
        &*shared.cache,
        &source,
        cfg.compile_mode,
        &shared.compile_count,
    )?;
    let exports = instantiate(lua, shared, &artifact)?;
    let render: Function = exports.get("render").map_err(|_| {
        HandluaError::Template("generated chunk has no render function".into())
    })?;

    let shared_cb = Arc::clone(shared);
    let cb_dir = doc_dir.to_path_buf();
    let partial_fn = lua.create_function(
        move |lua, (path, model_value): (String, Value)| {
            let base = shared_cb.config.read().unwrap().base_path.clone();
            let resolved = resolve_path(&path, &base, &cb_dir);
            let text = shared_cb
                .resolver
                .read(&resolved)
                .map_err(NestedFailure::raise)?;
            let parent = resolved
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(base);
            render_text(lua, &shared_cb, &text, &parent, model_value, depth + 1)
                .map_err(NestedFailure::raise)
        },
    )?;

    let script = new_script_context(lua, model, Some(partial_fn))?;
    Ok((render, script))
}

/// Runs one template render to a string. Re-entered by the partial
/// callback for nested renders.
pub(crate) fn render_text(
    lua: &Lua,
    shared: &Arc<EngineShared>,
    text: &str,
    doc_dir: &Path,
    model: Value,
    depth: usize,
) -> Result<String> {
    let (render, script) = prepare_render(lua, shared, text, doc_dir, model, depth)?;
    render.call::<String>(script).map_err(unwrap_lua_error)
}

#[cfg(feature = "async-lua")]
pub(crate) async fn render_text_async(
    lua: &Lua,
    shared: &Arc<EngineShared>,
    text: &str,
    doc_dir: &Path,
    model: Value,
    depth: usize,
) -> Result<String> {
    let (render, script) = prepare_render(lua, shared, text, doc_dir, model, depth)?;
    render
        .call_async::<String>(script)
        .await
        .map_err(unwrap_lua_error)
}

/// The handlua script engine.
///
/// Generic over the resolver type `R` used to load template files for
/// layouts, partials and [`Engine::execute_script_file`].
pub struct Engine<R: TemplateResolver> {
    resolver: R,
    shared: Arc<EngineShared>,
    lua: Lua,
    error_state: Mutex<Option<ErrorState>>,
}

impl<R: TemplateResolver> Engine<R> {
    /// Creates a new engine with the given resolver and cache.
    ///
    /// Prefer [`with_memory_cache`](Self::with_memory_cache) unless a
    /// custom or shared cache is needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the Lua runtime fails to initialize.
    pub fn new(resolver: R, cache: Box<dyn CompileCache>) -> Result<Self> {
        let lua = Lua::new();
        crate::extensions::register_json_module(&lua)?;

        let shared = Arc::new(EngineShared {
            resolver: resolver.clone_box(),
            cache,
            config: RwLock::new(EngineConfig::default()),
            chunks: Mutex::new(HashMap::new()),
            compile_count: AtomicUsize::new(0),
            parse_started: AtomicBool::new(false),
            last_generated: Mutex::new(None),
        });

        Ok(Self {
            resolver,
            shared,
            lua,
            error_state: Mutex::new(None),
        })
    }

    /// Creates a new engine with the default in-memory append-only cache.
    pub fn with_memory_cache(resolver: R) -> Result<Self> {
        Self::new(resolver, Box::new(MemoryCache::new()))
    }

    /// Creates a new engine with a filesystem-backed artifact cache.
    ///
    /// The only configuration under which this crate writes files.
    #[cfg(feature = "filesystem")]
    pub fn with_filesystem_cache<P: AsRef<Path>>(resolver: R, cache_dir: P) -> Result<Self> {
        let cache = Box::new(crate::cache::FileSystemCache::new(cache_dir)?);
        Self::new(resolver, cache)
    }

    /// Returns a reference to the resolver used by this engine.
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    // --- configuration -----------------------------------------------------

    /// Replaces the delimiter set.
    ///
    /// # Errors
    ///
    /// Fails once any template has been parsed; the delimiter table is
    /// immutable from the first parse on.
    pub fn set_delimiters(&mut self, delimiters: DelimiterSet) -> Result<()> {
        delimiters.validate()?;
        self.ensure_not_parsing()?;
        self.shared.config.write().unwrap().delimiters = delimiters;
        Ok(())
    }

    /// Sets whether default-policy `{{ }}` expressions HTML-encode.
    pub fn set_default_html_encoding(&mut self, encode: bool) -> Result<()> {
        self.ensure_not_parsing()?;
        self.shared
            .config
            .write()
            .unwrap()
            .delimiters
            .html_encode_expressions_by_default = encode;
        Ok(())
    }

    fn ensure_not_parsing(&self) -> Result<()> {
        if self.shared.parse_started.load(Ordering::Relaxed) {
            return Err(HandluaError::Template(
                "delimiters cannot change after parsing has begun".into(),
            ));
        }
        Ok(())
    }

    /// Sets the base path substituted for rooted template paths.
    pub fn set_base_path<P: AsRef<Path>>(&mut self, base: P) {
        self.shared.config.write().unwrap().base_path = base.as_ref().to_path_buf();
    }

    /// Adds a module emitted as a `require` import in every generated
    /// prelude. Part of the generated source, hence of the cache key.
    pub fn add_module(&mut self, name: &str) {
        let mut config = self.shared.config.write().unwrap();
        if !config.modules.iter().any(|m| m == name) {
            config.modules.push(name.to_string());
        }
    }

    /// Sets the compilation mode.
    pub fn set_compile_mode(&mut self, mode: CompileMode) {
        self.shared.config.write().unwrap().compile_mode = mode;
    }

    /// When enabled, captured failures are also returned as `Err`.
    pub fn set_throw_on_error(&mut self, throw: bool) {
        self.shared.config.write().unwrap().throw_on_error = throw;
    }

    /// Sets the ceiling for nested layout/partial renders.
    pub fn set_max_include_depth(&mut self, depth: usize) {
        self.shared.config.write().unwrap().max_include_depth = depth;
    }

    // --- diagnostics -------------------------------------------------------

    /// Number of times the Lua compiler was actually invoked.
    pub fn compile_count(&self) -> usize {
        self.shared.compile_count.load(Ordering::Relaxed)
    }

    /// The error state recorded by the most recent failing call, if any.
    pub fn last_error(&self) -> Option<ErrorState> {
        self.error_state.lock().unwrap().clone()
    }

    /// Whether the most recent call failed.
    pub fn has_error(&self) -> bool {
        self.error_state.lock().unwrap().is_some()
    }

    /// The most recent top-level generated source.
    pub fn generated_code(&self) -> Option<String> {
        self.shared.last_generated.lock().unwrap().clone()
    }

    /// The most recent top-level generated source, with line numbers.
    pub fn generated_code_with_line_numbers(&self) -> Option<String> {
        self.generated_code().map(|source| {
            source
                .lines()
                .enumerate()
                .map(|(i, line)| format!("{:4} | {}\n", i + 1, line))
                .collect()
        })
    }

    /// Number of artifacts in the compile cache.
    pub fn cache_len(&self) -> usize {
        self.shared.cache.len()
    }

    // --- entry points ------------------------------------------------------

    /// Renders a template string against a model.
    ///
    /// The model is any serializable value; templates reach it as `Model`.
    pub fn execute_script<T: Serialize + ?Sized>(
        &self,
        template: &str,
        model: &T,
    ) -> Result<String> {
        self.clear_error();
        let result = self
            .lua
            .to_value(model)
            .map_err(HandluaError::Lua)
            .and_then(|model_value| {
                let base = self.shared.config.read().unwrap().base_path.clone();
                render_text(&self.lua, &self.shared, template, &base, model_value, 0)
            });
        self.finish(result)
    }

    /// Renders a template file against a model.
    ///
    /// The path may use the rooted markers recognized by templates.
    pub fn execute_script_file<T: Serialize + ?Sized>(
        &self,
        path: &str,
        model: &T,
    ) -> Result<String> {
        self.clear_error();
        let result = (|| -> Result<String> {
            let base = self.shared.config.read().unwrap().base_path.clone();
            let resolved = resolve_path(path, &base, &base);
            let text = self.shared.resolver.read(&resolved)?;
            let doc_dir = resolved
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(base);
            let model_value = self.lua.to_value(model)?;
            render_text(&self.lua, &self.shared, &text, &doc_dir, model_value, 0)
        })();
        self.finish(result)
    }

    /// Transpiles a template to its generated source without compiling or
    /// executing it. Layout composition is applied when the template
    /// declares a layout.
    pub fn parse_script_to_code(&self, template: &str) -> Result<String> {
        self.clear_error();
        let result = (|| -> Result<String> {
            let base = self.shared.config.read().unwrap().base_path.clone();
            let source = generate_source(&self.shared, template, &base)?;
            *self.shared.last_generated.lock().unwrap() = Some(source.clone());
            Ok(source)
        })();
        self.finish(result)
    }

    /// Compiles and runs a Lua snippet with positional arguments.
    ///
    /// `@0`, `@1`, … placeholders resolve to the corresponding argument.
    /// The snippet's return value is converted back through serde.
    pub fn execute_code(
        &self,
        code: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        self.clear_error();
        let result = (|| -> Result<serde_json::Value> {
            let (func, call_args) = self.prepare_snippet(code, args)?;
            let value = func
                .call::<Value>(MultiValue::from_vec(call_args))
                .map_err(unwrap_lua_error)?;
            self.lua.from_value(value).map_err(HandluaError::Lua)
        })();
        self.finish(result)
    }

    /// Compiles a source unit of `local function` declarations and invokes
    /// one by name with positional arguments.
    pub fn execute_method(
        &self,
        source: &str,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        self.clear_error();
        let result = (|| -> Result<serde_json::Value> {
            let (func, call_args) = self.prepare_method(source, method, args)?;
            let value = func
                .call::<Value>(MultiValue::from_vec(call_args))
                .map_err(unwrap_lua_error)?;
            self.lua.from_value(value).map_err(HandluaError::Lua)
        })();
        self.finish(result)
    }

    // --- async entry points ------------------------------------------------

    /// Async variant of [`execute_script`](Self::execute_script); awaits
    /// and unwraps an asynchronous render.
    #[cfg(feature = "async-lua")]
    pub async fn execute_script_async<T: Serialize + ?Sized>(
        &self,
        template: &str,
        model: &T,
    ) -> Result<String> {
        self.clear_error();
        let result = match self.lua.to_value(model) {
            Ok(model_value) => {
                let base = self.shared.config.read().unwrap().base_path.clone();
                render_text_async(&self.lua, &self.shared, template, &base, model_value, 0)
                    .await
            }
            Err(e) => Err(HandluaError::Lua(e)),
        };
        self.finish(result)
    }

    /// Async variant of [`execute_script_file`](Self::execute_script_file).
    #[cfg(feature = "async-lua")]
    pub async fn execute_script_file_async<T: Serialize + ?Sized>(
        &self,
        path: &str,
        model: &T,
    ) -> Result<String> {
        self.clear_error();
        let prepared = (|| -> Result<(String, PathBuf, Value)> {
            let base = self.shared.config.read().unwrap().base_path.clone();
            let resolved = resolve_path(path, &base, &base);
            let text = self.shared.resolver.read(&resolved)?;
            let doc_dir = resolved
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(base);
            let model_value = self.lua.to_value(model)?;
            Ok((text, doc_dir, model_value))
        })();
        let result = match prepared {
            Ok((text, doc_dir, model_value)) => {
                render_text_async(&self.lua, &self.shared, &text, &doc_dir, model_value, 0)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Async variant of [`execute_code`](Self::execute_code).
    #[cfg(feature = "async-lua")]
    pub async fn execute_code_async(
        &self,
        code: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        self.clear_error();
        let result = match self.prepare_snippet(code, args) {
            Ok((func, call_args)) => func
                .call_async::<Value>(MultiValue::from_vec(call_args))
                .await
                .map_err(unwrap_lua_error)
                .and_then(|value| self.lua.from_value(value).map_err(HandluaError::Lua)),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Async variant of [`execute_method`](Self::execute_method).
    #[cfg(feature = "async-lua")]
    pub async fn execute_method_async(
        &self,
        source: &str,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        self.clear_error();
        let result = match self.prepare_method(source, method, args) {
            Ok((func, call_args)) => func
                .call_async::<Value>(MultiValue::from_vec(call_args))
                .await
                .map_err(unwrap_lua_error)
                .and_then(|value| self.lua.from_value(value).map_err(HandluaError::Lua)),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    // --- internals ---------------------------------------------------------

    fn prepare_snippet(
        &self,
        code: &str,
        args: &[serde_json::Value],
    ) -> Result<(Function, Vec<Value>)> {
        let cfg = self.shared.config.read().unwrap().clone();
        let substituted = substitute_parameters(code);
        let source = assemble_snippet(&substituted, &cfg.modules)?;
        self.invokable(source, "run", cfg.compile_mode, args)
    }

    fn prepare_method(
        &self,
        source: &str,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<(Function, Vec<Value>)> {
        let cfg = self.shared.config.read().unwrap().clone();
        let assembled = assemble_method(source, method, &cfg.modules)?;
        self.invokable(assembled, method, cfg.compile_mode, args)
    }

    /// Compiles a generated unit, instantiates it, and looks the target
    /// method up by name. Arguments are passed exactly positionally.
    fn invokable(
        &self,
        source: String,
        method: &str,
        mode: CompileMode,
        args: &[serde_json::Value],
    ) -> Result<(Function, Vec<Value>)> {
        *self.shared.last_generated.lock().unwrap() = Some(source.clone());

        let artifact = get_or_compile(
            &self.lua,
            &*self.shared.cache,
            &source,
            mode,
            &self.shared.compile_count,
        )?;
        let exports = instantiate(&self.lua, &self.shared, &artifact)?;
        let func: Function = exports.get(method).map_err(|_| {
            HandluaError::Template(format!("method {:?} not found in compiled unit", method))
        })?;

        let mut call_args: Vec<Value> = Vec::with_capacity(args.len());
        for arg in args {
            call_args.push(self.lua.to_value(arg)?);
        }
        Ok((func, call_args))
    }

    fn clear_error(&self) {
        *self.error_state.lock().unwrap() = None;
    }

    /// Applies the capture-or-throw policy to a finished call.
    fn finish<T: Default>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::error!(kind = %err.kind(), error = %err, "script call failed");
                *self.error_state.lock().unwrap() = Some(ErrorState {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                if self.shared.config.read().unwrap().throw_on_error {
                    Err(err)
                } else {
                    Ok(T::default())
                }
            }
        }
    }
}
