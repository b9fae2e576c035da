//! Thread-safe front door for rendering.
//!
//! `JsRuntime` is `!Send`, so `SsrBridge` keeps the runtime on a dedicated
//! thread with its own current-thread Tokio runtime and talks to it over a
//! bounded queue. The bridge itself is `Send + Sync + Clone`; requests from
//! any number of tasks are rendered one at a time, in arrival order.

use std::sync::mpsc as std_mpsc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::SsrConfig;
use crate::error::SsrError;
use crate::module::ModuleRef;
use crate::page::PagePayload;
use crate::render::RenderResult;
use crate::runtime::SsrRuntime;

/// Work sent to the runtime thread. Each job carries its reply channel.
enum Job {
    Render {
        page: PagePayload,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<RenderResult, SsrError>>,
    },
    Preload {
        reply: oneshot::Sender<Result<(), SsrError>>,
    },
}

/// Renders pages with the configured render module.
#[derive(Clone)]
pub struct SsrBridge {
    jobs: mpsc::Sender<Job>,
    module: ModuleRef,
}

impl SsrBridge {
    /// Spawn the runtime thread and wait until its isolate is ready.
    ///
    /// The module itself is loaded lazily on the first render (or by
    /// [`preload`](Self::preload)), so a missing module file surfaces as
    /// `ModuleNotFound` from `render`. A missing sandbox directory fails here.
    pub fn start(config: SsrConfig) -> Result<Self, SsrError> {
        let (jobs, queue) = mpsc::channel(config.queue_capacity.max(1));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let module = config.module();

        thread::Builder::new()
            .name("ssr-bridge".to_string())
            .spawn(move || worker_main(config, queue, ready_tx))
            .map_err(|e| SsrError::Runtime(e.into()))?;

        ready_rx.recv().map_err(|_| SsrError::WorkerUnavailable)??;

        Ok(Self { jobs, module })
    }

    /// The module this bridge renders with.
    pub fn module(&self) -> &ModuleRef {
        &self.module
    }

    /// Render a page. Dropping the returned future cancels the render.
    pub async fn render(&self, page: PagePayload) -> Result<RenderResult, SsrError> {
        self.render_with_cancel(page, CancellationToken::new()).await
    }

    /// Render a page, aborting when `cancel` fires.
    ///
    /// `cancel` itself is never cancelled by the bridge.
    pub async fn render_with_cancel(
        &self,
        page: PagePayload,
        cancel: CancellationToken,
    ) -> Result<RenderResult, SsrError> {
        let job_cancel = cancel.child_token();
        let guard = job_cancel.clone().drop_guard();
        let (reply, response) = oneshot::channel();

        self.jobs
            .send(Job::Render {
                page,
                cancel: job_cancel,
                reply,
            })
            .await
            .map_err(|_| SsrError::WorkerUnavailable)?;

        let result = response.await.map_err(|_| SsrError::WorkerUnavailable)?;
        let _ = guard.disarm();
        result
    }

    /// Load the configured module ahead of the first request.
    pub async fn preload(&self) -> Result<(), SsrError> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job::Preload { reply })
            .await
            .map_err(|_| SsrError::WorkerUnavailable)?;
        response.await.map_err(|_| SsrError::WorkerUnavailable)?
    }
}

fn worker_main(
    config: SsrConfig,
    mut queue: mpsc::Receiver<Job>,
    ready: std_mpsc::Sender<Result<(), SsrError>>,
) {
    let tokio_runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(SsrError::Runtime(e.into())));
            return;
        }
    };

    tokio_runtime.block_on(async move {
        let mut worker = match Worker::new(config) {
            Ok(worker) => {
                let _ = ready.send(Ok(()));
                worker
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        while let Some(job) = queue.recv().await {
            worker.handle(job).await;
        }
        tracing::debug!("render queue closed, worker exiting");
    });
}

struct Worker {
    config: SsrConfig,
    module: ModuleRef,
    runtime: SsrRuntime,
}

impl Worker {
    fn new(config: SsrConfig) -> Result<Self, SsrError> {
        let runtime = SsrRuntime::new(&config)?;
        Ok(Self {
            module: config.module(),
            config,
            runtime,
        })
    }

    async fn handle(&mut self, job: Job) {
        if self.runtime.is_poisoned() {
            self.rebuild();
        }

        match job {
            Job::Render {
                page,
                cancel,
                reply,
            } => {
                let result = if cancel.is_cancelled() {
                    Err(SsrError::RenderCancelled {
                        page: page.context(),
                    })
                } else {
                    self.runtime
                        .render_module(&self.module, &page, Some(&cancel))
                        .await
                };
                let _ = reply.send(result);
            }
            Job::Preload { reply } => {
                let result = self.runtime.load(&self.module).await.map(|_| ());
                let _ = reply.send(result);
            }
        }

        // Rebuild eagerly so the next request does not pay for it.
        if self.runtime.is_poisoned() {
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        match SsrRuntime::new(&self.config) {
            Ok(runtime) => {
                tracing::warn!("render runtime rebuilt after interrupt; module cache cleared");
                self.runtime = runtime;
            }
            Err(e) => tracing::error!(error = %e, "failed to rebuild render runtime"),
        }
    }
}
