//! Bridge configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SsrError;
use crate::module::{ModuleKind, ModuleRef};

/// Configuration for the SSR runtime and bridge.
///
/// Only `module_path` is required; JSON keys are camelCase.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SsrConfig {
    /// The render module to load.
    pub module_path: PathBuf,
    /// Force a module convention instead of detecting it.
    #[serde(default)]
    pub module_kind: Option<ModuleKind>,
    /// Sandbox root; defaults to the module's directory.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    /// Maximum time for a single render in milliseconds (None = unlimited)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Maximum heap size in bytes (None = unlimited)
    #[serde(default = "default_max_heap_size")]
    pub max_heap_size: Option<usize>,
    /// Allowed origins for fetch() (empty = fetch disabled)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Pending render requests the bridge buffers before callers wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_max_heap_size() -> Option<usize> {
    Some(64 * 1024 * 1024)
}

fn default_queue_capacity() -> usize {
    64
}

impl SsrConfig {
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            module_kind: None,
            root_dir: None,
            timeout_ms: default_timeout_ms(),
            max_heap_size: default_max_heap_size(),
            allowed_origins: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SsrError> {
        let config: Self = serde_json::from_str(json).map_err(|e| SsrError::Config(e.to_string()))?;
        if config.queue_capacity == 0 {
            return Err(SsrError::Config("queueCapacity must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn with_module_kind(mut self, kind: ModuleKind) -> Self {
        self.module_kind = Some(kind);
        self
    }

    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_heap_size(mut self, bytes: Option<usize>) -> Self {
        self.max_heap_size = bytes;
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// The configured render module as a reference.
    pub fn module(&self) -> ModuleRef {
        let reference = ModuleRef::from_path(&self.module_path);
        match self.module_kind {
            Some(kind) => reference.with_kind(kind),
            None => reference,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Canonical sandbox root.
    ///
    /// Without an explicit `root_dir` this is the module's directory; if that
    /// directory does not exist the module cannot be resolved either.
    pub(crate) fn sandbox_root(&self) -> Result<PathBuf, SsrError> {
        let (root, explicit) = match &self.root_dir {
            Some(root) => (root.clone(), true),
            None => (module_dir(&self.module_path), false),
        };

        let canonical = root.canonicalize().map_err(|e| {
            if explicit {
                SsrError::Config(format!("rootDir '{}': {}", root.display(), e))
            } else {
                SsrError::ModuleNotFound {
                    reference: self.module_path.display().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !canonical.is_dir() {
            return Err(SsrError::Config(format!(
                "sandbox root '{}' is not a directory",
                canonical.display()
            )));
        }
        Ok(canonical)
    }
}

fn module_dir(module_path: &Path) -> PathBuf {
    match module_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
