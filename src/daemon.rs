//! Wires config, store, queue, engine, consumers and the scheduler into a
//! running worker process.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RuncoreConfig;
use crate::core::lifecycle::{LifecycleManager, QueueComponent};
use crate::core::llm::LlmManager;
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::policy::PolicyEngine;
use crate::core::queue::{DELIVERY_QUEUE, JobQueue, LocalQueue, MEMORY_QUEUE, RUNS_QUEUE};
use crate::core::quota::QuotaLedger;
use crate::core::runs::RunEngine;
use crate::core::runs::compaction::{ContextCompactor, LlmSummarizer};
use crate::core::runs::events::StepEvents;
use crate::core::sandbox::IsolatedExecutor;
use crate::core::scheduler::Scheduler;
use crate::core::store::Store;
use crate::core::tools::{ToolRegistry, register_builtins};
use crate::core::worker::{DeliveryLog, MemoryWriter, RunWorker};
use crate::platform::{NativePlatform, Platform};

pub struct Daemon {
    pub engine: Arc<RunEngine>,
    pub queue: LocalQueue,
    lifecycle: LifecycleManager,
}

impl Daemon {
    pub async fn build(config: &RuncoreConfig, data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = config.db_path(data_dir);
        let store = Store::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);

        let api_key = std::env::var(&config.llm.api_key_env).ok();
        if api_key.is_none() {
            warn!(
                "{} is not set; model calls will be unauthenticated",
                config.llm.api_key_env
            );
        }
        let provider = GenericProvider::new(
            config.llm.provider.clone(),
            config.llm.base_url.clone(),
            api_key,
            Duration::from_secs(config.llm.timeout_secs),
        )?;
        let llm = LlmManager::new(
            Arc::new(provider),
            config.llm.model.clone(),
            config.llm.fallback_model.clone(),
        );

        let mut tools = ToolRegistry::new(Arc::new(IsolatedExecutor::new()));
        register_builtins(&mut tools)?;
        tools.register_manifests(&config.tools, &config.sandbox)?;

        let policy = PolicyEngine::new(
            store.clone(),
            QuotaLedger::new(store.clone()),
            Duration::from_secs(config.policy.cache_ttl_secs),
        );

        let queue = LocalQueue::new();
        let engine = Arc::new(RunEngine::new(
            store.clone(),
            Arc::new(policy),
            Arc::new(tools),
            Arc::new(queue.clone()) as Arc<dyn JobQueue>,
            StepEvents::new(),
            config.run_settings(),
        ));

        let worker = RunWorker::new(engine.clone(), llm.clone(), config.llm.system_prompt.clone());
        queue.consume(
            RUNS_QUEUE,
            config.queue_settings(config.queues.runs),
            Arc::new(worker),
        )?;
        queue.consume(
            DELIVERY_QUEUE,
            config.queue_settings(config.queues.delivery),
            Arc::new(DeliveryLog),
        )?;
        let compactor = (config.compaction.turn_threshold > 0).then(|| {
            Arc::new(ContextCompactor::new(
                store.clone(),
                Arc::new(LlmSummarizer::new(llm.clone())),
                config.compaction.turn_threshold,
            ))
        });
        queue.consume(
            MEMORY_QUEUE,
            config.queue_settings(config.queues.memory),
            Arc::new(MemoryWriter::new(compactor)),
        )?;

        let mut lifecycle = LifecycleManager::new().await?;
        lifecycle
            .schedule_ticks(Arc::new(Scheduler::new(engine.clone())), &config.scheduler.cron)
            .await?;
        lifecycle.attach(Arc::new(Mutex::new(QueueComponent::new(queue.clone()))));

        Ok(Self {
            engine,
            queue,
            lifecycle,
        })
    }

    /// Run until `shutdown` fires, then stop the scheduler and drain consumers.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.lifecycle.start().await?;
        info!("runcore worker ready");
        shutdown.cancelled().await;
        info!("Shutdown requested");
        self.lifecycle.shutdown().await
    }
}
