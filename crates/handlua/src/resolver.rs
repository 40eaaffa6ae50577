// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template resource resolution.
//!
//! [`resolve_path`] maps the path written in a template onto a concrete
//! location: a leading `~`, `/` or `\` roots the path at the engine's
//! configured base path, anything else is relative to the directory of the
//! including document. [`TemplateResolver`] abstracts the actual read so
//! templates can come from the filesystem, memory, or anywhere else.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{HandluaError, Result};

/// Converts a path to a normalized string with forward slashes.
pub fn path_to_string<P: AsRef<Path>>(path: P) -> String {
    let mut result = String::new();
    for (i, component) in path.as_ref().components().enumerate() {
        match component {
            Component::RootDir => result.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                if i > 0 && !result.is_empty() && !result.ends_with('/') {
                    result.push('/');
                }
                result.push_str("..");
            }
            Component::Prefix(p) => result.push_str(&p.as_os_str().to_string_lossy()),
            Component::Normal(s) => {
                if !result.is_empty() && !result.ends_with('/') {
                    result.push('/');
                }
                result.push_str(&s.to_string_lossy());
            }
        }
    }
    result
}

/// Lexically normalizes a path, collapsing `.` and `..` components.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Resolves a template-written path against the base path and the including
/// document's directory.
///
/// Root markers `~`, `/` and `\` at the start of `raw` are replaced by
/// `base`; any other path is relative to `doc_dir`.
pub fn resolve_path(raw: &str, base: &Path, doc_dir: &Path) -> PathBuf {
    let trimmed = raw.trim().replace('\\', "/");
    let resolved = if let Some(rest) = trimmed.strip_prefix('~') {
        base.join(rest.trim_start_matches('/'))
    } else if let Some(rest) = trimmed.strip_prefix('/') {
        base.join(rest)
    } else {
        doc_dir.join(&trimmed)
    };
    normalize_path(&resolved)
}

/// Trait for loading template sources by resolved path.
///
/// Implementations must be thread-safe; the engine clones them into Lua
/// callbacks for nested partial renders.
pub trait TemplateResolver: Send + Sync + 'static {
    /// Reads the template at `path`.
    ///
    /// Returns [`HandluaError::Resolution`] naming the path when it does
    /// not exist.
    fn read(&self, path: &Path) -> Result<String>;

    /// Checks whether `path` resolves without reading it.
    fn exists(&self, path: &Path) -> bool;

    /// Creates a boxed clone (for use in closures).
    fn clone_box(&self) -> Box<dyn TemplateResolver>;
}

impl Clone for Box<dyn TemplateResolver> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Filesystem-based template resolver.
///
/// Relative paths are read under the root directory; absolute paths are
/// read as-is.
#[cfg(feature = "filesystem")]
#[derive(Debug, Clone)]
pub struct FileSystemResolver {
    /// The root directory for relative reads.
    pub root_dir: PathBuf,
}

#[cfg(feature = "filesystem")]
impl FileSystemResolver {
    /// Creates a new filesystem resolver with the given root directory.
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }
}

#[cfg(feature = "filesystem")]
impl TemplateResolver for FileSystemResolver {
    fn read(&self, path: &Path) -> Result<String> {
        let full = self.full_path(path);
        if !full.is_file() {
            return Err(HandluaError::Resolution(format!(
                "template not found: {}",
                path_to_string(path)
            )));
        }
        std::fs::read_to_string(&full).map_err(|e| {
            HandluaError::Resolution(format!("cannot read {}: {}", path_to_string(&full), e))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.full_path(path).is_file()
    }

    fn clone_box(&self) -> Box<dyn TemplateResolver> {
        Box::new(self.clone())
    }
}

/// Memory-based template resolver for tests and embedded templates.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    templates: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryResolver {
    /// Creates an empty memory resolver.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> String {
        path_to_string(normalize_path(path))
    }

    /// Adds a template under the given path.
    pub fn add_template(&self, path: &str, content: &str) {
        let mut templates = self.templates.lock().unwrap();
        templates.insert(Self::key(Path::new(path)), content.to_string());
    }

    /// Removes a template.
    pub fn remove_template(&self, path: &str) {
        let mut templates = self.templates.lock().unwrap();
        templates.remove(&Self::key(Path::new(path)));
    }

    /// Clears all templates.
    pub fn clear(&self) {
        self.templates.lock().unwrap().clear();
    }
}

impl TemplateResolver for MemoryResolver {
    fn read(&self, path: &Path) -> Result<String> {
        let templates = self.templates.lock().unwrap();
        templates.get(&Self::key(path)).cloned().ok_or_else(|| {
            HandluaError::Resolution(format!("template not found: {}", path_to_string(path)))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.templates.lock().unwrap().contains_key(&Self::key(path))
    }

    fn clone_box(&self) -> Box<dyn TemplateResolver> {
        Box::new(self.clone())
    }
}
