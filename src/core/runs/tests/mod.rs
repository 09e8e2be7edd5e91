mod confirmation;
mod outbound_messages;
mod scheduler_signals;
mod tool_calls;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::error::CoreResult;
use crate::core::policy::{
    NewPolicyRule, PolicyAction, PolicyEngine, RuleConditions, RuleConfig,
};
use crate::core::queue::{EnqueueOptions, JobQueue, RUNS_QUEUE};
use crate::core::quota::QuotaLedger;
use crate::core::runs::events::StepEvents;
use crate::core::runs::{NewRun, Run, RunEngine, RunSettings};
use crate::core::sandbox::IsolatedExecutor;
use crate::core::store::Store;
use crate::core::tools::{Classification, ToolDefinition, ToolHandler, ToolRegistry};

/// Queue double that records every accepted enqueue and dedups by job id.
#[derive(Default)]
pub(super) struct RecordingQueue {
    jobs: Mutex<Vec<(String, String, Value)>>,
    seen: Mutex<HashSet<String>>,
}

impl RecordingQueue {
    pub(super) fn jobs(&self, queue: &str) -> Vec<(String, Value)> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, id, payload)| (id.clone(), payload.clone()))
            .collect()
    }

    pub(super) fn job_ids(&self, queue: &str) -> Vec<String> {
        self.jobs(queue).into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, queue: &str, payload: Value, opts: EnqueueOptions) -> CoreResult<bool> {
        let id = opts
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !self.seen.lock().unwrap().insert(format!("{queue}/{id}")) {
            return Ok(false);
        }
        self.jobs
            .lock()
            .unwrap()
            .push((queue.to_string(), id, payload));
        Ok(true)
    }
}

/// Echoes its args back and counts invocations.
#[derive(Default)]
pub(super) struct CountingTool {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ToolHandler for CountingTool {
    async fn call(&self, _run: &Run, args: &Map<String, Value>) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if args.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err("asked to fail".into());
        }
        Ok(json!({ "echo": args }))
    }
}

pub(super) struct Harness {
    pub engine: RunEngine,
    pub store: Store,
    pub queue: Arc<RecordingQueue>,
    pub policy: Arc<PolicyEngine>,
    pub tool: Arc<CountingTool>,
}

impl Harness {
    pub(super) async fn new() -> Self {
        Self::with_settings(RunSettings::default()).await
    }

    pub(super) async fn with_settings(settings: RunSettings) -> Self {
        let store = Store::open_in_memory().unwrap();
        let policy = Arc::new(PolicyEngine::new(
            store.clone(),
            QuotaLedger::new(store.clone()),
            Duration::ZERO,
        ));
        let tool = Arc::new(CountingTool::default());
        let mut tools = ToolRegistry::new(Arc::new(IsolatedExecutor::new()));
        tools
            .register(ToolDefinition::in_process(
                "notes.echo",
                Classification::Read,
                "echo",
                tool.clone(),
            ))
            .unwrap();
        tools
            .register(ToolDefinition::in_process(
                "files.delete",
                Classification::Destruct,
                "delete",
                tool.clone(),
            ))
            .unwrap();
        let queue = Arc::new(RecordingQueue::default());
        let engine = RunEngine::new(
            store.clone(),
            policy.clone(),
            Arc::new(tools),
            queue.clone(),
            StepEvents::new(),
            settings,
        );
        Self {
            engine,
            store,
            queue,
            policy,
            tool,
        }
    }

    pub(super) fn tool_calls(&self) -> usize {
        self.tool.calls.load(Ordering::SeqCst)
    }

    pub(super) async fn add_rule(&self, tool: &str, action: PolicyAction, config: RuleConfig) {
        self.policy
            .add_rule(&NewPolicyRule {
                tenant_id: "t1".into(),
                agent_id: None,
                name: format!("{}-{}", action.as_str(), tool),
                priority: 10,
                conditions: RuleConditions {
                    tool: Some(tool.into()),
                    ..RuleConditions::default()
                },
                action,
                config,
                enabled: true,
            })
            .await
            .unwrap();
    }

    /// Create a run and claim its first iteration.
    pub(super) async fn running(&self, input: NewRun) -> Run {
        let run = self.engine.create_run(input).await.unwrap();
        self.engine.claim(&run.id, false).await.unwrap().unwrap()
    }

    /// Yield the current iteration and claim the next one.
    pub(super) async fn next_iteration(&self, run: &Run) -> Run {
        assert!(self.engine.yield_iteration(run).await.unwrap());
        self.engine.claim(&run.id, false).await.unwrap().unwrap()
    }

    pub(super) fn run_jobs(&self) -> Vec<String> {
        self.queue.job_ids(RUNS_QUEUE)
    }
}

pub(super) fn new_run(id: &str) -> NewRun {
    NewRun {
        id: Some(id.to_string()),
        tenant_id: "t1".into(),
        agent_id: "a1".into(),
        input_text: Some("do the thing".into()),
        ..NewRun::default()
    }
}

pub(super) fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
