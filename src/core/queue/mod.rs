//! At-least-once job queue.
//!
//! `LocalQueue` is the in-process implementation the daemon runs with. Queue
//! handles are constructed once and passed to whoever enqueues or consumes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::{CoreError, CoreResult};

pub const RUNS_QUEUE: &str = "agent-runs";
pub const DELIVERY_QUEUE: &str = "delivery";
pub const MEMORY_QUEUE: &str = "memory-writes";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Enqueues with an id that is already pending or active are dropped.
    pub job_id: Option<String>,
    pub delay_ms: Option<u64>,
}

impl EnqueueOptions {
    pub fn id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            delay_ms: None,
        }
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    /// 1 on first delivery.
    pub attempt: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns false when the job was deduplicated by id.
    async fn enqueue(&self, queue: &str, payload: Value, opts: EnqueueOptions) -> CoreResult<bool>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> CoreResult<()>;

    /// Called once when a job fails for good.
    async fn on_exhausted(&self, _job: &Job, _error: &CoreError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

struct QueueState {
    tx: mpsc::UnboundedSender<Job>,
    rx: Option<mpsc::UnboundedReceiver<Job>>,
    live_ids: HashSet<String>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn with_queue<T>(&self, name: &str, f: impl FnOnce(&mut QueueState) -> T) -> CoreResult<T> {
        let mut queues = self
            .inner
            .queues
            .lock()
            .map_err(|_| CoreError::Queue("queue registry poisoned".to_string()))?;
        let state = queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                tx,
                rx: Some(rx),
                live_ids: HashSet::new(),
            }
        });
        Ok(f(state))
    }

    fn release(&self, job: &Job) {
        let _ = self.with_queue(&job.queue, |q| q.live_ids.remove(&job.id));
    }

    fn deliver(&self, job: Job, delay: Option<Duration>) -> CoreResult<()> {
        let tx = self.with_queue(&job.queue, |q| q.tx.clone())?;
        match delay {
            None | Some(Duration::ZERO) => tx
                .send(job)
                .map_err(|_| CoreError::Queue("queue closed".to_string())),
            Some(delay) => {
                let token = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(job);
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// Start consuming `queue` with `handler`. Each queue has one consumer.
    pub fn consume(
        &self,
        queue: &str,
        settings: QueueSettings,
        handler: Arc<dyn JobHandler>,
    ) -> CoreResult<()> {
        let rx = self
            .with_queue(queue, |q| q.rx.take())?
            .ok_or_else(|| CoreError::Queue(format!("queue `{queue}` already has a consumer")))?;
        let concurrency = settings.concurrency.max(1);
        info!("Queue {} consuming (concurrency: {})", queue, concurrency);

        let this = self.clone();
        let name = queue.to_string();
        let handle = tokio::spawn(async move {
            this.dispatch(name, rx, settings, concurrency, handler).await;
        });
        self.inner
            .workers
            .lock()
            .map_err(|_| CoreError::Queue("worker registry poisoned".to_string()))?
            .push(handle);
        Ok(())
    }

    async fn dispatch(
        &self,
        name: String,
        mut rx: mpsc::UnboundedReceiver<Job>,
        settings: QueueSettings,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency));
        let token = self.inner.shutdown.clone();
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let this = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                this.run_job(job, settings, handler).await;
                drop(permit);
            });
        }
        // Let in-flight jobs finish.
        let _ = permits.acquire_many(concurrency as u32).await;
        debug!("Queue {} stopped", name);
    }

    async fn run_job(&self, job: Job, settings: QueueSettings, handler: Arc<dyn JobHandler>) {
        match handler.handle(&job).await {
            Ok(()) => {
                debug!("Job {} on {} done (attempt {})", job.id, job.queue, job.attempt);
                self.release(&job);
            }
            Err(e) if e.is_transient() && job.attempt < settings.max_attempts => {
                let backoff = backoff_delay(settings.retry_delay_ms, job.attempt);
                warn!(
                    "Job {} on {} failed (attempt {}/{}): {}; retrying in {}ms",
                    job.id,
                    job.queue,
                    job.attempt,
                    settings.max_attempts,
                    e,
                    backoff.as_millis()
                );
                let retry = Job {
                    attempt: job.attempt + 1,
                    ..job.clone()
                };
                if let Err(send_err) = self.deliver(retry, Some(backoff)) {
                    error!("Job {} could not be requeued: {}", job.id, send_err);
                    self.release(&job);
                    handler.on_exhausted(&job, &e).await;
                }
            }
            Err(e) => {
                error!(
                    "Job {} on {} failed permanently after {} attempt(s): {}",
                    job.id, job.queue, job.attempt, e
                );
                self.release(&job);
                handler.on_exhausted(&job, &e).await;
            }
        }
    }

    /// Stop dispatching and wait for in-flight jobs.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<_> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Queues shut down");
    }
}

/// Exponential backoff with up to 25% jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = if exp >= 4 {
        rand::thread_rng().gen_range(0..=exp / 4)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, queue: &str, payload: Value, opts: EnqueueOptions) -> CoreResult<bool> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::Queue("queue is shutting down".to_string()));
        }
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let fresh = self.with_queue(queue, |q| q.live_ids.insert(id.clone()))?;
        if !fresh {
            debug!("Job {} on {} deduplicated", id, queue);
            return Ok(false);
        }
        let job = Job {
            id,
            queue: queue.to_string(),
            payload,
            attempt: 1,
        };
        self.deliver(job, opts.delay_ms.map(Duration::from_millis))?;
        Ok(true)
    }
}
