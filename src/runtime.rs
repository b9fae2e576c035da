//! SSR runtime - loads render modules into a sandboxed V8 isolate and
//! invokes them.
//!
//! `SsrRuntime` is single-threaded (`JsRuntime` is `!Send`). Every call goes
//! through an `async` trampoline in `bootstrap.js`, so synchronous and
//! promise-returning render functions look the same from here: run the event
//! loop, then read the settled promise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use deno_core::{v8, JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::SsrConfig;
use crate::error::{OutputViolation, SsrError};
use crate::fetch::FetchPolicy;
use crate::loader::{KindOverrides, RenderModuleLoader};
use crate::module::{ModuleKind, ModuleRef};
use crate::ops::ssr_bridge;
use crate::page::PagePayload;
use crate::render::{normalize, RawViolation, RenderResult};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// How often the watchdog checks its deadline and cancellation token.
const WATCHDOG_POLL: Duration = Duration::from_millis(5);

/// A loaded render entry point.
///
/// Cheap to clone; only valid on the runtime that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderModuleHandle {
    path: PathBuf,
    kind: ModuleKind,
    slot: u32,
    generation: u64,
}

impl RenderModuleHandle {
    /// Canonical path of the module file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convention the module was loaded with.
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    TimedOut,
    Cancelled,
    HeapLimit,
}

enum Settled {
    Fulfilled(String),
    Rejected(String),
    Pending,
    Interrupted(Interrupt),
}

#[derive(Debug, Deserialize)]
struct JsFailure {
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum LoadEnvelope {
    Loaded { slot: u32 },
    Invalid { reason: String },
    Failed { error: JsFailure },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum InvokeEnvelope {
    Returned {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        extra: Vec<String>,
    },
    Malformed {
        violation: RawViolation,
    },
    Threw {
        error: JsFailure,
    },
    Unserializable {
        reason: String,
    },
}

/// Terminates the isolate from another thread when a render overruns its
/// deadline or its cancellation token fires while JS is running.
struct Watchdog {
    disarm: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicU8>,
}

const NOT_FIRED: u8 = 0;
const FIRED_TIMEOUT: u8 = 1;
const FIRED_CANCEL: u8 = 2;

impl Watchdog {
    fn arm(
        isolate: v8::IsolateHandle,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        let fired = Arc::new(AtomicU8::new(NOT_FIRED));
        if timeout.is_none() && cancel.is_none() {
            return Self {
                disarm: None,
                thread: None,
                fired,
            };
        }

        let (disarm, disarmed) = mpsc::channel::<()>();
        let flag = Arc::clone(&fired);
        let started = Instant::now();
        let thread = std::thread::spawn(move || loop {
            if !matches!(
                disarmed.recv_timeout(WATCHDOG_POLL),
                Err(mpsc::RecvTimeoutError::Timeout)
            ) {
                return;
            }

            let reason = if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                FIRED_CANCEL
            } else if timeout.is_some_and(|t| started.elapsed() >= t) {
                FIRED_TIMEOUT
            } else {
                continue;
            };

            flag.store(reason, Ordering::SeqCst);
            isolate.terminate_execution();
            return;
        });

        Self {
            disarm: Some(disarm),
            thread: Some(thread),
            fired,
        }
    }

    /// Stop the watchdog and report whether it terminated the isolate.
    fn disarm(mut self) -> Option<Interrupt> {
        drop(self.disarm.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        match self.fired.load(Ordering::SeqCst) {
            FIRED_TIMEOUT => Some(Interrupt::TimedOut),
            FIRED_CANCEL => Some(Interrupt::Cancelled),
            _ => None,
        }
    }
}

/// A sandboxed isolate plus its cache of loaded render modules.
pub struct SsrRuntime {
    js: JsRuntime,
    root: PathBuf,
    overrides: KindOverrides,
    handles: HashMap<PathBuf, RenderModuleHandle>,
    timeout: Option<Duration>,
    max_heap_size: Option<usize>,
    heap_exhausted: Arc<AtomicBool>,
    generation: u64,
    poisoned: bool,
}

impl SsrRuntime {
    /// Create an isolate sandboxed to the configured root.
    pub fn new(config: &SsrConfig) -> Result<Self, SsrError> {
        let root = config.sandbox_root()?;
        let overrides = KindOverrides::default();
        let loader = RenderModuleLoader::new(root.clone(), Rc::clone(&overrides));

        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut js = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(loader)),
            extensions: vec![ssr_bridge::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if config.max_heap_size.is_some() {
            let isolate = js.v8_isolate().thread_safe_handle();
            let exhausted = Arc::clone(&heap_exhausted);
            js.add_near_heap_limit_callback(move |current, initial| {
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "render isolate hit its heap limit, terminating"
                );
                exhausted.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
                // V8 aborts the process unless the terminated script gets room to unwind.
                current * 2
            });
        }

        js.op_state()
            .borrow_mut()
            .put(FetchPolicy::new(config.allowed_origins.clone())?);

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(root = %root.display(), generation, "render runtime created");

        Ok(Self {
            js,
            root,
            overrides,
            handles: HashMap::new(),
            timeout: config.timeout(),
            max_heap_size: config.max_heap_size,
            heap_exhausted,
            generation,
            poisoned: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of render modules cached in this runtime.
    pub fn loaded_modules(&self) -> usize {
        self.handles.len()
    }

    /// True once a render has been interrupted; the runtime then refuses work.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Resolve and load a render module.
    ///
    /// Loads are cached by canonical path, so a module's top-level code runs
    /// at most once per runtime no matter how often it is requested.
    pub async fn load(&mut self, reference: &ModuleRef) -> Result<RenderModuleHandle, SsrError> {
        self.load_inner(reference, None).await
    }

    /// Load on behalf of a render: `cancel` also interrupts module evaluation.
    async fn load_inner(
        &mut self,
        reference: &ModuleRef,
        cancel: Option<(&CancellationToken, &PagePayload)>,
    ) -> Result<RenderModuleHandle, SsrError> {
        self.ensure_usable()?;
        let path = reference.canonical_path()?;

        if let Some(handle) = self.handles.get(&path) {
            if reference.kind().is_some_and(|kind| kind != handle.kind) {
                tracing::warn!(
                    module = %path.display(),
                    loaded_as = %handle.kind,
                    "module already loaded with a different convention; keeping the first"
                );
            }
            return Ok(handle.clone());
        }

        if !path.starts_with(&self.root) {
            return Err(SsrError::ModuleNotFound {
                reference: reference.to_string(),
                reason: format!("outside the sandbox root {}", self.root.display()),
            });
        }

        let kind = match reference.kind() {
            Some(kind) => kind,
            None => ModuleKind::detect(&path)?,
        };
        self.overrides.borrow_mut().insert(path.clone(), kind);

        let specifier = ModuleSpecifier::from_file_path(&path)
            .map_err(|_| anyhow!("Failed to create module specifier for {}", path.display()))?;
        let code = format!(
            "globalThis.__ssr_bridge__.load({}, {})",
            js_string(specifier.as_str()),
            js_string(kind.as_str())
        );

        let failed = |message: String| SsrError::ModuleLoadFailed {
            reference: reference.to_string(),
            message,
        };

        let envelope = match self.settle(code, cancel.map(|(token, _)| token)).await {
            Ok(Settled::Fulfilled(json)) => serde_json::from_str::<LoadEnvelope>(&json)
                .map_err(|e| anyhow!("Malformed load response: {}", e))?,
            Ok(Settled::Rejected(message)) => return Err(failed(message)),
            Ok(Settled::Pending) => {
                return Err(failed("module evaluation never settled".to_string()))
            }
            Ok(Settled::Interrupted(Interrupt::TimedOut)) => {
                return Err(failed(format!(
                    "module evaluation timed out after {}ms",
                    self.timeout_ms()
                )))
            }
            Ok(Settled::Interrupted(Interrupt::HeapLimit)) => {
                return Err(failed(format!(
                    "module evaluation exceeded the heap limit of {} bytes",
                    self.max_heap_size.unwrap_or_default()
                )))
            }
            Ok(Settled::Interrupted(Interrupt::Cancelled)) => {
                return Err(match cancel {
                    Some((_, page)) => SsrError::RenderCancelled {
                        page: page.context(),
                    },
                    None => failed("module evaluation was cancelled".to_string()),
                })
            }
            Err(e) => return Err(failed(e.to_string())),
        };

        let slot = match envelope {
            LoadEnvelope::Loaded { slot } => slot,
            LoadEnvelope::Invalid { reason } => {
                return Err(SsrError::InvalidModuleShape {
                    reference: reference.to_string(),
                    reason,
                })
            }
            LoadEnvelope::Failed { error } => return Err(failed(error.message)),
        };

        let handle = RenderModuleHandle {
            path: path.clone(),
            kind,
            slot,
            generation: self.generation,
        };
        tracing::debug!(module = %path.display(), kind = %kind, "render module loaded");
        self.handles.insert(path, handle.clone());
        Ok(handle)
    }

    /// Invoke a loaded module once and normalize its result.
    pub async fn render(
        &mut self,
        handle: &RenderModuleHandle,
        page: &PagePayload,
    ) -> Result<RenderResult, SsrError> {
        self.invoke(handle, page, None).await
    }

    /// Like [`render`](Self::render), aborting when `cancel` fires.
    pub async fn render_with_cancel(
        &mut self,
        handle: &RenderModuleHandle,
        page: &PagePayload,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, SsrError> {
        self.invoke(handle, page, Some(cancel)).await
    }

    async fn invoke(
        &mut self,
        handle: &RenderModuleHandle,
        page: &PagePayload,
        cancel: Option<&CancellationToken>,
    ) -> Result<RenderResult, SsrError> {
        self.ensure_usable()?;
        if handle.generation != self.generation {
            return Err(SsrError::StaleHandle);
        }

        let context = page.context();
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(SsrError::RenderCancelled { page: context });
        }

        // The payload is re-parsed per call, so each render gets its own copy.
        let code = format!(
            "globalThis.__ssr_bridge__.invoke({}, {})",
            handle.slot,
            js_string(&page.to_json()?)
        );
        let started = Instant::now();

        let envelope = match self.settle(code, cancel).await {
            Ok(Settled::Fulfilled(json)) => serde_json::from_str::<InvokeEnvelope>(&json)
                .map_err(|e| anyhow!("Malformed render response: {}", e))?,
            Ok(Settled::Rejected(message)) => {
                return Err(SsrError::RenderThrew {
                    page: context,
                    message,
                    stack: None,
                })
            }
            Ok(Settled::Pending) => {
                return Err(SsrError::InvalidRenderOutput {
                    page: context,
                    violation: OutputViolation::NeverSettled,
                })
            }
            Ok(Settled::Interrupted(Interrupt::TimedOut)) => {
                return Err(SsrError::RenderTimedOut {
                    page: context,
                    timeout_ms: self.timeout_ms(),
                })
            }
            Ok(Settled::Interrupted(Interrupt::Cancelled)) => {
                return Err(SsrError::RenderCancelled { page: context })
            }
            Ok(Settled::Interrupted(Interrupt::HeapLimit)) => {
                return Err(SsrError::RenderOutOfMemory {
                    page: context,
                    limit_bytes: self.max_heap_size.unwrap_or_default(),
                })
            }
            // Unhandled rejections escaping the render surface here.
            Err(e) => {
                return Err(SsrError::RenderThrew {
                    page: context,
                    message: e.to_string(),
                    stack: None,
                })
            }
        };

        let result = match envelope {
            InvokeEnvelope::Returned { value, extra } => {
                if !extra.is_empty() {
                    tracing::trace!(?extra, "ignoring extra render result keys");
                }
                normalize(value).map_err(|violation| SsrError::InvalidRenderOutput {
                    page: context.clone(),
                    violation,
                })?
            }
            InvokeEnvelope::Malformed { violation } => {
                return Err(SsrError::InvalidRenderOutput {
                    page: context,
                    violation: violation.into(),
                })
            }
            InvokeEnvelope::Threw { error } => {
                return Err(SsrError::RenderThrew {
                    page: context,
                    message: error.message,
                    stack: error.stack,
                })
            }
            InvokeEnvelope::Unserializable { reason } => {
                return Err(SsrError::InvalidRenderOutput {
                    page: context,
                    violation: OutputViolation::Unserializable { reason },
                })
            }
        };

        tracing::debug!(
            component = %context.component,
            url = %context.url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "page rendered"
        );
        Ok(result)
    }

    /// Load (or reuse) `reference` and render `page` with it.
    pub async fn render_module(
        &mut self,
        reference: &ModuleRef,
        page: &PagePayload,
        cancel: Option<&CancellationToken>,
    ) -> Result<RenderResult, SsrError> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(SsrError::RenderCancelled {
                page: page.context(),
            });
        }
        let handle = self.load_inner(reference, cancel.map(|token| (token, page))).await?;
        self.invoke(&handle, page, cancel).await
    }

    fn ensure_usable(&self) -> Result<(), SsrError> {
        if self.poisoned {
            return Err(SsrError::RuntimePoisoned);
        }
        Ok(())
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.map_or(0, |t| t.as_millis() as u64)
    }

    /// Run `code`, drive the event loop, and read back the settled value.
    ///
    /// Synchronous overruns are stopped by the watchdog thread; stuck async
    /// work is abandoned by racing the event loop against the deadline. Either
    /// way the isolate is poisoned afterwards.
    async fn settle(
        &mut self,
        code: String,
        cancel: Option<&CancellationToken>,
    ) -> Result<Settled, anyhow::Error> {
        let timeout = self.timeout;
        let watchdog = Watchdog::arm(
            self.js.v8_isolate().thread_safe_handle(),
            timeout,
            cancel.cloned(),
        );

        let expired = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            result = self.evaluate(code) => result,
            () = expired => Ok(Settled::Interrupted(Interrupt::TimedOut)),
            () = cancelled => Ok(Settled::Interrupted(Interrupt::Cancelled)),
        };

        let fired = watchdog.disarm();
        let interrupt = if self.heap_exhausted.load(Ordering::SeqCst) {
            Some(Interrupt::HeapLimit)
        } else {
            fired
        };
        let outcome = match interrupt {
            Some(interrupt) => Ok(Settled::Interrupted(interrupt)),
            None => outcome,
        };

        if let Ok(Settled::Interrupted(interrupt)) = &outcome {
            tracing::warn!(?interrupt, generation = self.generation, "render interrupted, runtime poisoned");
            self.poisoned = true;
        }
        outcome
    }

    async fn evaluate(&mut self, code: String) -> Result<Settled, anyhow::Error> {
        let value = self.js.execute_script("<ssr-bridge>", code)?;

        // Run event loop to handle any promises/dynamic imports
        self.js
            .run_event_loop(PollEventLoopOptions::default())
            .await?;

        let scope = &mut self.js.handle_scope();
        let local = v8::Local::new(scope, &value);

        let settled = match v8::Local::<v8::Promise>::try_from(local) {
            Ok(promise) => match promise.state() {
                v8::PromiseState::Fulfilled => {
                    Settled::Fulfilled(promise.result(scope).to_rust_string_lossy(scope))
                }
                v8::PromiseState::Rejected => {
                    Settled::Rejected(promise.result(scope).to_rust_string_lossy(scope))
                }
                v8::PromiseState::Pending => Settled::Pending,
            },
            Err(_) => Settled::Fulfilled(local.to_rust_string_lossy(scope)),
        };

        Ok(settled)
    }
}

fn js_string(value: &str) -> String {
    Value::from(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("file:///a \"b\".js"), r#""file:///a \"b\".js""#);
    }

    #[test]
    fn test_invoke_envelope_variants() {
        let returned: InvokeEnvelope =
            serde_json::from_str(r#"{"status":"returned","value":{"head":[],"body":""}}"#).unwrap();
        assert!(matches!(returned, InvokeEnvelope::Returned { value, .. } if value == json!({"head": [], "body": ""})));

        let missing: InvokeEnvelope = serde_json::from_str(r#"{"status":"returned"}"#).unwrap();
        assert!(matches!(missing, InvokeEnvelope::Returned { value, extra } if value.is_null() && extra.is_empty()));

        let malformed: InvokeEnvelope = serde_json::from_str(
            r#"{"status":"malformed","violation":{"kind":"bodyNotString","found":"object"}}"#,
        )
        .unwrap();
        assert!(matches!(malformed, InvokeEnvelope::Malformed { .. }));

        let threw: InvokeEnvelope = serde_json::from_str(
            r#"{"status":"threw","error":{"message":"Error: boom","stack":null}}"#,
        )
        .unwrap();
        assert!(matches!(threw, InvokeEnvelope::Threw { error } if error.message == "Error: boom"));
    }

    #[test]
    fn test_load_envelope_variants() {
        let loaded: LoadEnvelope = serde_json::from_str(r#"{"status":"loaded","slot":3}"#).unwrap();
        assert!(matches!(loaded, LoadEnvelope::Loaded { slot: 3 }));

        let invalid: LoadEnvelope =
            serde_json::from_str(r#"{"status":"invalid","reason":"no render"}"#).unwrap();
        assert!(matches!(invalid, LoadEnvelope::Invalid { .. }));
    }

    #[test]
    fn test_inert_watchdog_never_fires() {
        // No deadline and no token: nothing is spawned, so no isolate is needed.
        let fired = Arc::new(AtomicU8::new(NOT_FIRED));
        let watchdog = Watchdog {
            disarm: None,
            thread: None,
            fired,
        };
        assert_eq!(watchdog.disarm(), None);
    }
}
