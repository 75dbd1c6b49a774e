//! In-process job dispatcher.
//!
//! Each registered job kind gets one unbounded queue and one worker task.
//! Jobs of one kind run strictly one at a time, in submission order; jobs of
//! different kinds run concurrently. A failing or panicking job is logged and
//! dropped, and the worker moves on. There are no retries: a job is retried
//! only when a caller submits it again after the staleness window allows.
//!
//! Queues are unbounded, so a producer that outpaces a worker grows memory
//! without limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Work performed for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Queue name, e.g. `"scan-project"`.
    fn kind(&self) -> &str;

    async fn handle(&self, payload: Value) -> Result<()>;
}

struct Inner {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs queued or in flight, across all kinds.
    outstanding: Arc<watch::Sender<usize>>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to the dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                outstanding: Arc::new(outstanding),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start a worker for `handler.kind()`. Each kind may be registered once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            bail!("dispatcher is shut down");
        }
        let kind = handler.kind().to_string();
        let mut queues = self.inner.queues.lock().expect("queue lock poisoned");
        if queues.contains_key(&kind) {
            bail!("job kind '{}' is already registered", kind);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(kind.clone(), tx);

        let span = tracing::info_span!("worker", kind = %kind);
        let worker = tokio::spawn(
            run_worker(handler, rx, self.inner.outstanding.clone()).instrument(span),
        );
        self.inner
            .workers
            .lock()
            .expect("worker lock poisoned")
            .push(worker);
        info!(kind = %kind, "Registered job queue");
        Ok(())
    }

    /// Enqueue a job. Never blocks.
    ///
    /// Fails only if `kind` was never registered or the dispatcher is shut
    /// down.
    pub fn put(&self, kind: &str, payload: Value) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            bail!("dispatcher is shut down");
        }
        let queues = self.inner.queues.lock().expect("queue lock poisoned");
        let Some(tx) = queues.get(kind) else {
            bail!("no queue registered for job kind '{}'", kind);
        };

        self.inner.outstanding.send_modify(|n| *n += 1);
        if tx.send(payload).is_err() {
            self.inner.outstanding.send_modify(|n| *n -= 1);
            bail!("queue for job kind '{}' is closed", kind);
        }
        debug!(kind, "Queued job");
        Ok(())
    }

    /// Number of jobs queued or running.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Wait until every queued and in-flight job has finished.
    pub async fn drain(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives in `self.inner`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting jobs, let workers finish what is queued, and join them.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends each worker's loop once its queue is empty.
        self.inner.queues.lock().expect("queue lock poisoned").clear();
        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .expect("worker lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
    }
}

async fn run_worker(
    handler: Arc<dyn JobHandler>,
    mut rx: mpsc::UnboundedReceiver<Value>,
    outstanding: Arc<watch::Sender<usize>>,
) {
    while let Some(payload) = rx.recv().await {
        let job = handler.clone();
        // A separate task so a panicking handler cannot take the worker down.
        let result =
            tokio::spawn(async move { job.handle(payload).await }.in_current_span()).await;
        match result {
            Ok(Ok(())) => debug!("Job finished"),
            Ok(Err(e)) => error!("Job failed, dropping it: {:#}", e),
            Err(e) if e.is_panic() => error!("Job panicked, dropping it"),
            Err(e) => error!(error = %e, "Job was cancelled"),
        }
        outstanding.send_modify(|n| *n -= 1);
    }
    debug!("Queue closed, worker exiting");
}
