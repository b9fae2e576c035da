//! Error taxonomy for module loading and rendering.
//!
//! Loader failures name the module reference; render failures carry the
//! page's component and url so the host can correlate them with a request.

use std::fmt;

use thiserror::Error;

/// Result type for bridge operations.
pub type SsrResult<T> = Result<T, SsrError>;

/// Identifies the page a render failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub component: String,
    pub url: String,
}

impl fmt::Display for PageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component `{}` at {}", self.component, self.url)
    }
}

/// Ways a render function's return value can fail normalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputViolation {
    #[error("render returned {found}, expected an object with `head` and `body`")]
    NotAnObject { found: &'static str },

    #[error("`head` is missing from the render result")]
    MissingHead,

    #[error("`head` must be an array of strings, got {found}")]
    HeadNotArray { found: &'static str },

    #[error("`head[{index}]` must be a string, got {found}")]
    HeadEntryNotString { index: usize, found: &'static str },

    #[error("`body` is missing from the render result")]
    MissingBody,

    #[error("`body` must be a string, got {found}")]
    BodyNotString { found: &'static str },

    #[error("render result could not be serialized: {reason}")]
    Unserializable { reason: String },

    #[error("render promise never settled")]
    NeverSettled,
}

/// Bridge errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SsrError {
    /// The module reference does not resolve to a loadable file.
    #[error("render module not found: {reference} ({reason})")]
    ModuleNotFound { reference: String, reason: String },

    /// The module loaded but exposes no callable `render`.
    #[error("render module {reference} has an invalid shape: {reason}")]
    InvalidModuleShape { reference: String, reason: String },

    /// Module evaluation threw, hung, or its package manifest is unreadable.
    #[error("render module {reference} failed to load: {message}")]
    ModuleLoadFailed { reference: String, message: String },

    /// The render entry point threw or rejected.
    #[error("render threw for {page}: {message}")]
    RenderThrew {
        page: PageContext,
        message: String,
        stack: Option<String>,
    },

    /// The render entry point returned something other than `{head, body}`.
    #[error("invalid render output for {page}: {violation}")]
    InvalidRenderOutput {
        page: PageContext,
        #[source]
        violation: OutputViolation,
    },

    #[error("render timed out after {timeout_ms}ms for {page}")]
    RenderTimedOut { page: PageContext, timeout_ms: u64 },

    #[error("render cancelled for {page}")]
    RenderCancelled { page: PageContext },

    /// The isolate reached its heap limit and was terminated.
    #[error("render exceeded the {limit_bytes} byte heap limit for {page}")]
    RenderOutOfMemory { page: PageContext, limit_bytes: usize },

    #[error("invalid page payload: {0}")]
    InvalidPayload(String),

    /// The handle was produced by a runtime that has since been replaced.
    #[error("render module handle belongs to a discarded runtime")]
    StaleHandle,

    /// A previous render was interrupted; the isolate can no longer be trusted.
    #[error("runtime was interrupted and must be rebuilt")]
    RuntimePoisoned,

    #[error("render worker is not running")]
    WorkerUnavailable,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl SsrError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SsrError::ModuleNotFound { .. } => "module_not_found",
            SsrError::InvalidModuleShape { .. } => "invalid_module_shape",
            SsrError::ModuleLoadFailed { .. } => "module_load_failed",
            SsrError::RenderThrew { .. } => "render_threw",
            SsrError::InvalidRenderOutput { .. } => "invalid_render_output",
            SsrError::RenderTimedOut { .. } => "render_timed_out",
            SsrError::RenderCancelled { .. } => "render_cancelled",
            SsrError::RenderOutOfMemory { .. } => "render_out_of_memory",
            SsrError::InvalidPayload(_) => "invalid_payload",
            SsrError::StaleHandle => "stale_handle",
            SsrError::RuntimePoisoned => "runtime_poisoned",
            SsrError::WorkerUnavailable => "worker_unavailable",
            SsrError::Config(_) => "config",
            SsrError::Runtime(_) => "runtime",
        }
    }

    /// The page a render failure is attributed to, if any.
    pub fn page(&self) -> Option<&PageContext> {
        match self {
            SsrError::RenderThrew { page, .. }
            | SsrError::InvalidRenderOutput { page, .. }
            | SsrError::RenderTimedOut { page, .. }
            | SsrError::RenderCancelled { page }
            | SsrError::RenderOutOfMemory { page, .. } => Some(page),
            _ => None,
        }
    }
}
