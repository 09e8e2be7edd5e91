use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::core::queue::LocalQueue;
use crate::core::scheduler::Scheduler;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drains the in-process queue on shutdown.
pub struct QueueComponent {
    queue: LocalQueue,
}

impl QueueComponent {
    pub fn new(queue: LocalQueue) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for QueueComponent {
    async fn on_shutdown(&mut self) -> Result<()> {
        self.queue.shutdown().await;
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Run a scheduler tick on every fire of `cron_expr`.
    pub async fn schedule_ticks(&mut self, scheduler: Arc<Scheduler>, cron_expr: &str) -> Result<()> {
        let job = Job::new_async(cron_expr, move |_uuid, mut _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                if let Err(e) = scheduler.tick().await {
                    error!("Scheduler tick failed: {}", e);
                }
            })
        })?;
        self.scheduler.add(job).await?;
        info!("Scheduler ticks on '{}'", cron_expr);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        for comp in &self.components {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flag(Arc<std::sync::atomic::AtomicBool>);

    #[async_trait::async_trait]
    impl LifecycleComponent for Flag {
        async fn on_shutdown(&mut self) -> Result<()> {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_reaches_components() {
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        lifecycle.attach(Arc::new(Mutex::new(Flag(stopped.clone()))));
        lifecycle.attach(Arc::new(Mutex::new(QueueComponent::new(LocalQueue::new()))));

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::Shutdown);
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
