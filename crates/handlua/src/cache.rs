// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Compiled artifact caching.
//!
//! The cache maps a fingerprint of the generated source (plus compile mode)
//! to the compiled [`Artifact`]. Two templates whose transpiled output is
//! byte-identical share one entry even if their original delimiter text
//! differed; there is no name or namespace dimension in the key.
//!
//! # Cache Implementations
//!
//! - [`MemoryCache`]: in-memory, append-only, process lifetime (default)
//! - [`BoundedCache`]: in-memory LRU for hosts that prefer a ceiling
//! - [`FileSystemCache`]: persists artifacts to disk (opt-in; the only way
//!   this crate ever writes a file)
//!
//! All implementations support concurrent get-or-insert from multiple
//! callers. Two racing misses on one key may both compile; the last writer
//! wins and the artifacts are identical, so this is wasted work, not a
//! correctness problem. Compile failures are never inserted.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::error::{HandluaError, Result};

/// Compilation mode, part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompileMode {
    /// Keep debug information in dumped chunks.
    #[default]
    Debug,
    /// Strip debug information from dumped chunks.
    Release,
}

impl CompileMode {
    /// Stable tag mixed into the cache key.
    pub fn as_tag(&self) -> &'static str {
        match self {
            CompileMode::Debug => "debug",
            CompileMode::Release => "release",
        }
    }
}

/// A compiled unit: the generated source and its precompiled chunk.
///
/// Owned by its cache entry for the process lifetime. Execution never
/// shares instances: each call re-evaluates the chunk to get fresh
/// exports.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The exact generated source the chunk was compiled from.
    pub source: String,
    /// Chunk name used in Lua error messages, derived from the key.
    pub chunk_name: String,
    /// Precompiled chunk dump (stripped under [`CompileMode::Release`]).
    pub bytecode: Vec<u8>,
    /// The mode this artifact was compiled under.
    pub mode: CompileMode,
}

/// Fingerprints generated source plus mode into a cache key.
///
/// SHA-256 over the exact source bytes; byte-identical generated code
/// collides by design.
pub fn cache_key(source: &str, mode: CompileMode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\0");
    hasher.update(mode.as_tag().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derives the chunk name recorded in an artifact from its cache key.
pub fn chunk_name_for(key: &str) -> String {
    format!("@handlua/{}", &key[..key.len().min(12)])
}

/// Trait for compiled artifact caches.
///
/// Implementations must be thread-safe and provide get-or-insert safety
/// under concurrency. `clear` exists for test isolation; the engine itself
/// never evicts.
pub trait CompileCache: Send + Sync + fmt::Debug {
    /// Retrieves an artifact.
    fn get(&self, key: &str) -> Result<Option<Arc<Artifact>>>;
    /// Stores an artifact.
    fn set(&self, key: &str, artifact: Arc<Artifact>) -> Result<()>;
    /// Checks if a key is present.
    fn contains_key(&self, key: &str) -> bool;
    /// Number of cached artifacts.
    fn len(&self) -> usize;
    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Removes all entries.
    fn clear(&self) -> Result<()>;
    /// Creates a boxed clone (for use in closures).
    fn clone_box(&self) -> Box<dyn CompileCache>;
}

impl Clone for Box<dyn CompileCache> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// In-memory append-only cache; the default.
///
/// Entries live for the process lifetime. Unbounded growth is the
/// documented trade-off for never recompiling identical generated code.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Arc<Artifact>>>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Artifact>>>> {
        self.entries
            .lock()
            .map_err(|_| HandluaError::Cache("failed to acquire cache lock".into()))
    }
}

impl CompileCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Artifact>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> Result<()> {
        self.lock()?.insert(key.to_string(), artifact);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.lock().map(|m| m.contains_key(key)).unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn CompileCache> {
        Box::new(self.clone())
    }
}

/// In-memory LRU cache for hosts that want a size ceiling.
///
/// Trades the never-recompile guarantee for bounded memory: evicted
/// artifacts recompile on next use.
#[derive(Debug, Clone)]
pub struct BoundedCache {
    entries: Arc<Mutex<LruCache<String, Arc<Artifact>>>>,
}

impl BoundedCache {
    /// Creates a cache holding at most `capacity` artifacts.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Arc<Artifact>>>> {
        self.entries
            .lock()
            .map_err(|_| HandluaError::Cache("failed to acquire cache lock".into()))
    }
}

impl CompileCache for BoundedCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Artifact>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> Result<()> {
        self.lock()?.put(key.to_string(), artifact);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.lock().map(|m| m.contains(key)).unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn CompileCache> {
        Box::new(self.clone())
    }
}

/// Persistent filesystem-backed cache with a memory layer.
///
/// Stores each artifact as `<key>.lua` (generated source), `<key>.luac`
/// (precompiled chunk) and `<key>.meta.json` (chunk name, mode). This is
/// the on-disk artifact option: nothing else in the crate writes files.
#[cfg(feature = "filesystem")]
#[derive(Debug)]
pub struct FileSystemCache {
    cache_dir: std::path::PathBuf,
    memory: MemoryCache,
}

#[cfg(feature = "filesystem")]
impl FileSystemCache {
    /// Creates a filesystem cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new<P: AsRef<std::path::Path>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            HandluaError::Cache(format!("failed to create cache directory: {}", e))
        })?;
        Ok(Self {
            cache_dir,
            memory: MemoryCache::new(),
        })
    }

    fn source_path(&self, key: &str) -> std::path::PathBuf {
        self.cache_dir.join(format!("{}.lua", key))
    }

    fn bytecode_path(&self, key: &str) -> std::path::PathBuf {
        self.cache_dir.join(format!("{}.luac", key))
    }

    fn metadata_path(&self, key: &str) -> std::path::PathBuf {
        self.cache_dir.join(format!("{}.meta.json", key))
    }
}

#[cfg(feature = "filesystem")]
impl CompileCache for FileSystemCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Artifact>>> {
        if let Some(artifact) = self.memory.get(key)? {
            return Ok(Some(artifact));
        }

        let source_path = self.source_path(key);
        let metadata_path = self.metadata_path(key);
        if !source_path.exists() || !metadata_path.exists() {
            return Ok(None);
        }

        let source = std::fs::read_to_string(&source_path)
            .map_err(|e| HandluaError::Cache(format!("failed to read cached source: {}", e)))?;
        let bytecode = std::fs::read(self.bytecode_path(key)).unwrap_or_default();
        let metadata_text = std::fs::read_to_string(&metadata_path)
            .map_err(|e| HandluaError::Cache(format!("failed to read cache metadata: {}", e)))?;
        let metadata: serde_json::Value = serde_json::from_str(&metadata_text)
            .map_err(|e| HandluaError::Cache(format!("failed to parse cache metadata: {}", e)))?;

        let chunk_name = metadata["chunk_name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| chunk_name_for(key));
        let mode = match metadata["mode"].as_str() {
            Some("release") => CompileMode::Release,
            _ => CompileMode::Debug,
        };

        let artifact = Arc::new(Artifact {
            source,
            chunk_name,
            bytecode,
            mode,
        });
        self.memory.set(key, artifact.clone())?;
        Ok(Some(artifact))
    }

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> Result<()> {
        self.memory.set(key, artifact.clone())?;

        std::fs::write(self.source_path(key), &artifact.source)
            .map_err(|e| HandluaError::Cache(format!("failed to write cached source: {}", e)))?;
        std::fs::write(self.bytecode_path(key), &artifact.bytecode)
            .map_err(|e| HandluaError::Cache(format!("failed to write cached chunk: {}", e)))?;

        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let metadata = serde_json::json!({
            "chunk_name": artifact.chunk_name,
            "mode": artifact.mode.as_tag(),
            "created_at": created_at,
        });
        std::fs::write(self.metadata_path(key), metadata.to_string())
            .map_err(|e| HandluaError::Cache(format!("failed to write cache metadata: {}", e)))?;
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.memory.contains_key(key)
            || (self.source_path(key).exists() && self.metadata_path(key).exists())
    }

    fn len(&self) -> usize {
        std::fs::read_dir(&self.cache_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path().extension().map(|ext| ext == "lua").unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn clear(&self) -> Result<()> {
        self.memory.clear()?;
        let entries = std::fs::read_dir(&self.cache_dir)
            .map_err(|e| HandluaError::Cache(format!("failed to read cache directory: {}", e)))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_cache_file = path
                .extension()
                .map(|ext| ext == "lua" || ext == "luac" || ext == "json")
                .unwrap_or(false);
            if path.is_file() && is_cache_file {
                std::fs::remove_file(&path).map_err(|e| {
                    HandluaError::Cache(format!("failed to remove cache file: {}", e))
                })?;
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn CompileCache> {
        Box::new(Self {
            cache_dir: self.cache_dir.clone(),
            memory: self.memory.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(source: &str) -> Arc<Artifact> {
        let key = cache_key(source, CompileMode::Debug);
        Arc::new(Artifact {
            source: source.to_string(),
            chunk_name: chunk_name_for(&key),
            bytecode: vec![1, 2, 3],
            mode: CompileMode::Debug,
        })
    }

    #[test]
    fn key_depends_on_source_and_mode() {
        let a = cache_key("return 1", CompileMode::Debug);
        let b = cache_key("return 1", CompileMode::Debug);
        let c = cache_key("return 2", CompileMode::Debug);
        let d = cache_key("return 1", CompileMode::Release);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        let art = artifact("return 1");
        cache.set("k", art.clone()).unwrap();
        assert!(cache.contains_key("k"));
        assert_eq!(cache.len(), 1);
        let got = cache.get("k").unwrap().unwrap();
        assert_eq!(got.source, "return 1");
        assert!(cache.get("missing").unwrap().is_none());
    }

    #[test]
    fn memory_cache_last_writer_wins() {
        let cache = MemoryCache::new();
        cache.set("k", artifact("return 1")).unwrap();
        cache.set("k", artifact("return 2")).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").unwrap().unwrap().source, "return 2");
    }

    #[test]
    fn bounded_cache_evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.set("a", artifact("1")).unwrap();
        cache.set("b", artifact("2")).unwrap();
        cache.get("a").unwrap();
        cache.set("c", artifact("3")).unwrap();
        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("c"));
    }

    #[cfg(feature = "filesystem")]
    #[test]
    fn filesystem_cache_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::new(dir.path()).unwrap();
        let art = artifact("return 42");
        cache.set("k", art).unwrap();

        let cache2 = FileSystemCache::new(dir.path()).unwrap();
        let got = cache2.get("k").unwrap().unwrap();
        assert_eq!(got.source, "return 42");
        assert_eq!(got.bytecode, vec![1, 2, 3]);
        assert_eq!(got.mode, CompileMode::Debug);
    }
}
