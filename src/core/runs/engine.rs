use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{StepEvent, StepEvents};
use super::outbound::{OutboundGuard, OutboundScope, OutboundVerdict};
use super::{
    NewRun, NewStep, PendingConfirmation, Run, RunKind, RunStatus, RunStep, StepStatus, StepType,
    WakeReason, step_key,
};
use crate::core::command::{Command, OutputMode, RecoverAction, SubagentSpec, sleep_wake_at};
use crate::core::error::{CoreError, CoreResult};
use crate::core::policy::{PolicyContext, PolicyEngine, Verdict};
use crate::core::queue::{DELIVERY_QUEUE, EnqueueOptions, JobQueue, MEMORY_QUEUE, RUNS_QUEUE};
use crate::core::quota::UsageRow;
use crate::core::store::{MessageDirection, RunFilter, RunPatch, Store};
use crate::core::tools::ToolRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub default_max_iterations: u32,
    pub max_iterations_cap: u32,
    pub run_timeout: Duration,
    pub stale_after: Duration,
    /// Wake a parent as soon as any child finishes instead of waiting for all.
    pub wake_on_any_child: bool,
    pub similarity_threshold: f64,
    pub outbound_scope: OutboundScope,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            default_max_iterations: 25,
            max_iterations_cap: 100,
            run_timeout: Duration::from_secs(3600),
            stale_after: Duration::from_secs(300),
            wake_on_any_child: false,
            similarity_threshold: 0.92,
            outbound_scope: OutboundScope::Run,
        }
    }
}

/// Payload of a job on the runs queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub run_id: String,
}

/// Where a run stands after one command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Keep iterating.
    Continue,
    /// Now `waiting`; something external has to wake it.
    Parked(WakeReason),
    Finished(RunStatus),
    /// The run left `running` underneath us, e.g. it was cancelled.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub run_id: String,
    pub reason: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDecision {
    /// When given, must match the pending request.
    #[serde(default)]
    pub request_id: Option<String>,
    pub approved: bool,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The run state machine. All run and step mutation goes through here.
pub struct RunEngine {
    store: Store,
    policy: Arc<PolicyEngine>,
    tools: Arc<ToolRegistry>,
    queue: Arc<dyn JobQueue>,
    events: StepEvents,
    outbound: OutboundGuard,
    settings: RunSettings,
}

fn apply_mode(current: Option<&str>, text: &str, mode: OutputMode) -> String {
    match (mode, current) {
        (OutputMode::Append, Some(prev)) if !prev.is_empty() => format!("{prev}\n{text}"),
        _ => text.to_string(),
    }
}

impl RunEngine {
    pub fn new(
        store: Store,
        policy: Arc<PolicyEngine>,
        tools: Arc<ToolRegistry>,
        queue: Arc<dyn JobQueue>,
        events: StepEvents,
        settings: RunSettings,
    ) -> Self {
        let outbound = OutboundGuard::new(
            store.clone(),
            settings.similarity_threshold,
            settings.outbound_scope,
        );
        Self {
            store,
            policy,
            tools,
            queue,
            events,
            outbound,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    // ── Read API ──

    pub async fn get_run(&self, run_id: &str) -> CoreResult<Option<Run>> {
        self.store.get_run(run_id).await
    }

    pub async fn list_steps(&self, run_id: &str, after_seq: i64) -> CoreResult<Vec<RunStep>> {
        self.store.list_steps(run_id, after_seq).await
    }

    pub async fn list_children(&self, run_id: &str) -> CoreResult<Vec<Run>> {
        self.store.list_children(run_id).await
    }

    /// Tenant quota buckets for the current hour, day and month.
    pub async fn current_usage(&self, tenant_id: &str) -> CoreResult<Vec<UsageRow>> {
        self.policy.ledger().current_usage(tenant_id).await
    }

    pub fn subscribe(&self, run_id: &str) -> BroadcastStream<StepEvent> {
        self.events.subscribe(run_id)
    }

    // ── Internal plumbing ──

    fn clamp_iterations(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.settings.default_max_iterations)
            .clamp(1, self.settings.max_iterations_cap.max(1))
    }

    async fn enqueue_run(&self, run_id: &str, job_id: String) -> CoreResult<bool> {
        let payload = serde_json::to_value(RunJob {
            run_id: run_id.to_string(),
        })?;
        self.queue
            .enqueue(RUNS_QUEUE, payload, EnqueueOptions::id(job_id))
            .await
    }

    async fn transition(&self, run_id: &str, patch: &RunPatch) -> CoreResult<bool> {
        let changed = self.store.update_run(run_id, patch).await?;
        if changed && let Some(status) = patch.status {
            debug!("Run [{}] -> {}", run_id, status);
            self.events.publish(
                run_id,
                StepEvent::Status {
                    run_id: run_id.to_string(),
                    status,
                },
            );
        }
        Ok(changed)
    }

    /// Append a step; a repeated idempotency key returns the stored step.
    pub(crate) async fn record_step(&self, step: NewStep) -> CoreResult<(RunStep, bool)> {
        let (stored, inserted) = self.store.append_step(&step).await?;
        if inserted {
            self.events
                .publish(&stored.run_id, StepEvent::Appended(stored.clone()));
        } else {
            debug!(
                "Run [{}] step {} already recorded",
                stored.run_id, stored.idempotency_key
            );
        }
        Ok((stored, inserted))
    }

    async fn finish_step(&self, step: &RunStep, status: StepStatus, result: Option<&Value>) -> CoreResult<()> {
        if let Some(updated) = self.store.finish_step(&step.id, status, result).await? {
            self.events
                .publish(&updated.run_id, StepEvent::Updated(updated.clone()));
        }
        Ok(())
    }

    async fn park(
        &self,
        run: &Run,
        reason: WakeReason,
        wake_at: Option<DateTime<Utc>>,
        pending: Option<PendingConfirmation>,
    ) -> CoreResult<bool> {
        let mut patch = RunPatch::from(&[RunStatus::Running]).to(RunStatus::Waiting);
        patch.expect_iteration = Some(run.iteration);
        patch.iteration = Some(run.iteration + 1);
        patch.wake_reason = Some(Some(reason));
        patch.wake_at = Some(wake_at);
        if pending.is_some() {
            patch.pending_confirmation = Some(pending);
        }
        let parked = self.transition(&run.id, &patch).await?;
        if parked {
            info!("Run [{}] waiting ({})", run.id, reason.as_str());
        }
        Ok(parked)
    }

    // ── Lifecycle ──

    /// Create a top-level run and enqueue its first iteration. Creating a run
    /// whose id already exists returns the stored run.
    pub async fn create_run(&self, input: NewRun) -> CoreResult<Run> {
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let run = Run {
            id: id.clone(),
            tenant_id: input.tenant_id,
            agent_id: input.agent_id,
            user_id: input.user_id,
            channel_id: input.channel_id,
            context_id: input.context_id,
            parent_run_id: None,
            root_run_id: id.clone(),
            kind: RunKind::Coordinator,
            status: RunStatus::Pending,
            input_text: input.input_text,
            input_json: input.input_json,
            output_text: None,
            allowed_tools: input.allowed_tools,
            policy_profile: input.policy_profile,
            wake_at: None,
            wake_reason: None,
            iteration: 0,
            max_iterations: self.clamp_iterations(input.max_iterations),
            pending_confirmation: None,
            cancel_reason: None,
            cancel_requested_at: None,
            cancel_requested_by: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        if !self.store.insert_run(&run).await? {
            let existing = self.store.require_run(&id).await?;
            debug!("Run [{}] already exists ({})", id, existing.status);
            if existing.status == RunStatus::Pending && existing.iteration == 0 {
                self.enqueue_run(&id, format!("run:{id}:0")).await?;
            }
            return Ok(existing);
        }

        if let (Some(context_id), Some(text)) = (&run.context_id, &run.input_text) {
            self.store
                .append_context_message(context_id, MessageDirection::Inbound, text)
                .await?;
            self.queue
                .enqueue(
                    MEMORY_QUEUE,
                    json!({ "kind": "compact", "contextId": context_id }),
                    EnqueueOptions::id(format!("compact:{context_id}")),
                )
                .await?;
        }
        self.enqueue_run(&id, format!("run:{id}:0")).await?;
        info!("Run [{}] created for agent {}", id, run.agent_id);
        Ok(run)
    }

    /// Take a pending run for execution. A redelivered job may resume a run
    /// its own earlier attempt left `running`.
    pub async fn claim(&self, run_id: &str, redelivery: bool) -> CoreResult<Option<Run>> {
        let Some(run) = self.store.get_run(run_id).await? else {
            warn!("Run [{}] not found; dropping job", run_id);
            return Ok(None);
        };
        match run.status {
            RunStatus::Pending => {
                let mut patch = RunPatch::from(&[RunStatus::Pending]).to(RunStatus::Running);
                patch.expect_iteration = Some(run.iteration);
                if !self.transition(run_id, &patch).await? {
                    return Ok(None);
                }
                self.store.get_run(run_id).await
            }
            RunStatus::Running if redelivery => Ok(Some(run)),
            status => {
                debug!("Run [{}] is {}; nothing to claim", run_id, status);
                Ok(None)
            }
        }
    }

    /// A human-readable reason when the run is out of iterations or time.
    pub fn budget_exhausted(&self, run: &Run, now: DateTime<Utc>) -> Option<String> {
        if run.iteration >= run.max_iterations {
            return Some(format!(
                "Stopped after reaching the limit of {} iterations.",
                run.max_iterations
            ));
        }
        let age = now.signed_duration_since(run.created_at);
        if age.to_std().is_ok_and(|age| age > self.settings.run_timeout) {
            return Some(format!(
                "Stopped after exceeding the time budget of {}s.",
                self.settings.run_timeout.as_secs()
            ));
        }
        None
    }

    /// End the current iteration and schedule the next one.
    pub async fn yield_iteration(&self, run: &Run) -> CoreResult<bool> {
        let mut patch = RunPatch::from(&[RunStatus::Running]).to(RunStatus::Pending);
        patch.expect_iteration = Some(run.iteration);
        patch.iteration = Some(run.iteration + 1);
        patch.wake_reason = Some(None);
        patch.wake_at = Some(None);
        if !self.transition(&run.id, &patch).await? {
            return Ok(false);
        }
        self.enqueue_run(&run.id, format!("run:{}:{}", run.id, run.iteration + 1))
            .await?;
        Ok(true)
    }

    pub async fn fail_run(&self, run_id: &str, output: &str) -> CoreResult<bool> {
        let mut patch =
            RunPatch::from(&[RunStatus::Running, RunStatus::Waiting]).to(RunStatus::Failed);
        patch.output_text = Some(Some(output.to_string()));
        patch.wake_at = Some(None);
        let failed = self.transition(run_id, &patch).await?;
        if failed {
            warn!("Run [{}] failed: {}", run_id, output);
        }
        Ok(failed)
    }

    // ── Commands ──

    /// Apply one validated command for the run's current iteration.
    pub async fn apply(&self, run: &Run, command: &Command) -> CoreResult<ApplyOutcome> {
        let n = run.iteration;
        match command {
            Command::ToolCall { name, args } => self.apply_tool_call(run, name, args).await,
            Command::SendMessage { message, file_ids } => {
                self.send_message(run, message, file_ids).await?;
                Ok(ApplyOutcome::Continue)
            }
            Command::SetOutput { output, mode } => {
                let value = apply_mode(run.output_text.as_deref(), output, *mode);
                let (step, _) = self
                    .record_step(
                        NewStep::new(&run.id, StepType::OutputUpdate, step_key(n, "set_output"))
                            .args(json!({ "output": output, "mode": mode, "value": value })),
                    )
                    .await?;
                let stored = step
                    .args_json
                    .as_ref()
                    .and_then(|a| a.get("value"))
                    .and_then(Value::as_str)
                    .unwrap_or(value.as_str())
                    .to_string();
                let mut patch = RunPatch::from(&[RunStatus::Running]);
                patch.expect_iteration = Some(n);
                patch.output_text = Some(Some(stored));
                if !self.store.update_run(&run.id, &patch).await? {
                    return Ok(ApplyOutcome::Interrupted);
                }
                Ok(ApplyOutcome::Continue)
            }
            Command::Finish { output, mode } => self.finish(run, output.as_deref(), *mode).await,
            Command::Decision {
                content,
                importance,
            } => {
                let args = json!({ "kind": "decision", "content": content, "importance": importance });
                self.remember(run, "decision", args).await?;
                Ok(ApplyOutcome::Continue)
            }
            Command::Note { category, content } => {
                let args = json!({ "kind": "note", "category": category, "content": content });
                self.remember(run, "note", args).await?;
                Ok(ApplyOutcome::Continue)
            }
            Command::SetRunLimits {
                max_iterations,
                reason,
            } => {
                let cap = self.settings.max_iterations_cap.max(run.iteration + 1);
                let applied = (*max_iterations).clamp(run.iteration + 1, cap);
                let mut patch = RunPatch::from(&[RunStatus::Running]);
                patch.expect_iteration = Some(n);
                patch.max_iterations = Some(applied);
                if !self.store.update_run(&run.id, &patch).await? {
                    return Ok(ApplyOutcome::Interrupted);
                }
                self.record_step(
                    NewStep::new(&run.id, StepType::Message, step_key(n, "set_run_limits")).args(json!({
                        "kind": "set_run_limits",
                        "requested": max_iterations,
                        "applied": applied,
                        "reason": reason,
                    })),
                )
                .await?;
                info!("Run [{}] iteration budget set to {}", run.id, applied);
                Ok(ApplyOutcome::Continue)
            }
            Command::Recover {
                reason,
                action,
                message,
            } => self.recover(run, reason, *action, message.as_deref()).await,
            Command::SpawnSubagent { subagent } => {
                self.spawn_children(run, std::slice::from_ref(subagent)).await
            }
            Command::SpawnSubagents { subagents } => self.spawn_children(run, subagents).await,
            Command::Sleep {
                reason,
                wake_at,
                delay_seconds,
                cron,
            } => {
                self.sleep(run, reason.as_deref(), *wake_at, *delay_seconds, cron.as_deref())
                    .await
            }
        }
    }

    async fn apply_tool_call(
        &self,
        run: &Run,
        name: &str,
        args: &Map<String, Value>,
    ) -> CoreResult<ApplyOutcome> {
        let n = run.iteration;
        let result_key = step_key(n, "tool_result");
        if self.store.get_step_by_key(&run.id, &result_key).await?.is_some() {
            return Ok(ApplyOutcome::Continue);
        }
        let args_json = Value::Object(args.clone());

        let classification = match self.tools.classification(name) {
            Some(c) if run.is_tool_allowed(name) => c,
            _ => {
                self.record_step(
                    NewStep::new(&run.id, StepType::ToolResult, result_key)
                        .tool(name)
                        .args(args_json)
                        .result(json!({
                            "success": false,
                            "error": format!("tool `{name}` is not available to this run"),
                        }))
                        .status(StepStatus::Failed),
                )
                .await?;
                return Ok(ApplyOutcome::Continue);
            }
        };

        let namespace = name.split_once('.').map_or(name, |(ns, _)| ns);
        let decision = self
            .policy
            .decide(&PolicyContext {
                tenant_id: &run.tenant_id,
                agent_id: &run.agent_id,
                tool_name: namespace,
                command_name: name,
                classification: Some(classification),
                args,
                run_kind: run.kind,
                policy_profile: run.policy_profile.as_deref(),
            })
            .await?;

        match decision.verdict {
            Verdict::Deny => {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("tool `{name}` denied by policy"));
                let mut result = json!({
                    "success": false,
                    "denied": true,
                    "error": reason,
                    "rule": decision.rule_name,
                });
                if decision.is_quota_denial()
                    && let Some(q) = &decision.quota
                {
                    result["quota"] = json!({
                        "resourceType": crate::core::quota::TOOL_CALLS,
                        "period": q.period,
                        "usage": q.usage,
                        "limit": q.limit,
                    });
                }
                self.record_step(
                    NewStep::new(&run.id, StepType::ToolCall, step_key(n, "tool_call"))
                        .tool(name)
                        .args(args_json.clone())
                        .status(StepStatus::Failed),
                )
                .await?;
                self.record_step(
                    NewStep::new(&run.id, StepType::ToolResult, result_key)
                        .tool(name)
                        .args(args_json)
                        .result(result)
                        .status(StepStatus::Failed),
                )
                .await?;
                info!("Run [{}] tool {} denied: {}", run.id, name, reason);
                Ok(ApplyOutcome::Continue)
            }
            Verdict::Confirm => {
                let (call, _) = self
                    .record_step(
                        NewStep::new(&run.id, StepType::ToolCall, step_key(n, "tool_call"))
                            .tool(name)
                            .args(args_json)
                            .status(StepStatus::Pending),
                    )
                    .await?;
                let pending = PendingConfirmation {
                    request_id: call.id.clone(),
                    tool_name: name.to_string(),
                    args: args.clone(),
                    iteration: n,
                    approved: None,
                    decided_by: None,
                    require_reason: decision.require_reason,
                    reason: None,
                };
                if !self
                    .park(run, WakeReason::ToolConfirm, None, Some(pending))
                    .await?
                {
                    return Ok(ApplyOutcome::Interrupted);
                }
                Ok(ApplyOutcome::Parked(WakeReason::ToolConfirm))
            }
            Verdict::Allow => {
                self.execute_tool(run, n, name, args).await?;
                Ok(ApplyOutcome::Continue)
            }
        }
    }

    async fn execute_tool(
        &self,
        run: &Run,
        iteration: u32,
        name: &str,
        args: &Map<String, Value>,
    ) -> CoreResult<bool> {
        let args_json = Value::Object(args.clone());
        let (call, _) = self
            .record_step(
                NewStep::new(&run.id, StepType::ToolCall, step_key(iteration, "tool_call"))
                    .tool(name)
                    .args(args_json.clone())
                    .status(StepStatus::Running),
            )
            .await?;
        let outcome = self.tools.execute(run, name, args).await;
        let status = if outcome.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.finish_step(&call, status, None).await?;
        self.record_step(
            NewStep::new(&run.id, StepType::ToolResult, step_key(iteration, "tool_result"))
                .tool(name)
                .args(args_json)
                .result(outcome.to_json())
                .status(status),
        )
        .await?;
        if !outcome.success {
            info!(
                "Run [{}] tool {} failed: {}",
                run.id,
                name,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome.success)
    }

    async fn send_message(&self, run: &Run, message: &str, file_ids: &[String]) -> CoreResult<()> {
        let key = step_key(run.iteration, "send_message");
        let args = json!({ "kind": "outbound", "message": message, "fileIds": file_ids });
        match self.outbound.commit(run, run.iteration, message).await? {
            OutboundVerdict::Committed => {
                let (step, inserted) = self
                    .record_step(NewStep::new(&run.id, StepType::Message, key).args(args))
                    .await?;
                if inserted {
                    if let Some(context_id) = &run.context_id {
                        self.store
                            .append_context_message(context_id, MessageDirection::Outbound, message)
                            .await?;
                    }
                    self.queue
                        .enqueue(
                            DELIVERY_QUEUE,
                            json!({
                                "kind": "message",
                                "runId": run.id,
                                "tenantId": run.tenant_id,
                                "channelId": run.channel_id,
                                "userId": run.user_id,
                                "message": message,
                                "fileIds": file_ids,
                            }),
                            EnqueueOptions::id(format!("deliver:{}", step.id)),
                        )
                        .await?;
                }
            }
            OutboundVerdict::Blocked { reason } => {
                self.record_step(
                    NewStep::new(&run.id, StepType::Message, key)
                        .args(args)
                        .result(json!({ "error": reason }))
                        .status(StepStatus::Failed),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn remember(&self, run: &Run, what: &str, args: Value) -> CoreResult<()> {
        let (step, inserted) = self
            .record_step(NewStep::new(&run.id, StepType::Message, step_key(run.iteration, what)).args(args.clone()))
            .await?;
        if inserted {
            self.queue
                .enqueue(
                    MEMORY_QUEUE,
                    json!({
                        "kind": what,
                        "runId": run.id,
                        "tenantId": run.tenant_id,
                        "agentId": run.agent_id,
                        "entry": args,
                    }),
                    EnqueueOptions::id(format!("memory:{}", step.id)),
                )
                .await?;
        }
        Ok(())
    }

    async fn finish(&self, run: &Run, output: Option<&str>, mode: OutputMode) -> CoreResult<ApplyOutcome> {
        let value = match output {
            Some(text) => apply_mode(run.output_text.as_deref(), text, mode),
            None => run.output_text.clone().unwrap_or_default(),
        };
        let (step, _) = self
            .record_step(
                NewStep::new(&run.id, StepType::Finish, step_key(run.iteration, "finish"))
                    .args(json!({ "output": value })),
            )
            .await?;
        let final_output = step
            .args_json
            .as_ref()
            .and_then(|a| a.get("output"))
            .and_then(Value::as_str)
            .unwrap_or(value.as_str())
            .to_string();

        let mut patch = RunPatch::from(&[RunStatus::Running]).to(RunStatus::Completed);
        patch.output_text = Some(Some(final_output.clone()));
        patch.wake_reason = Some(None);
        patch.wake_at = Some(None);
        if !self.transition(&run.id, &patch).await? {
            return Ok(ApplyOutcome::Interrupted);
        }
        info!("Run [{}] completed", run.id);

        if run.kind == RunKind::Coordinator
            && let Some(channel_id) = &run.channel_id
            && !final_output.is_empty()
        {
            self.queue
                .enqueue(
                    DELIVERY_QUEUE,
                    json!({
                        "kind": "final",
                        "runId": run.id,
                        "tenantId": run.tenant_id,
                        "channelId": channel_id,
                        "userId": run.user_id,
                        "message": final_output,
                    }),
                    EnqueueOptions::id(format!("final:{}", run.id)),
                )
                .await?;
        }
        Ok(ApplyOutcome::Finished(RunStatus::Completed))
    }

    async fn recover(
        &self,
        run: &Run,
        reason: &str,
        action: RecoverAction,
        message: Option<&str>,
    ) -> CoreResult<ApplyOutcome> {
        self.record_step(
            NewStep::new(&run.id, StepType::Message, step_key(run.iteration, "recover")).args(json!({
                "kind": "recover",
                "reason": reason,
                "action": action,
                "message": message,
            })),
        )
        .await?;
        match action {
            RecoverAction::Continue => Ok(ApplyOutcome::Continue),
            RecoverAction::Abort => {
                if self.fail_run(&run.id, message.unwrap_or(reason)).await? {
                    Ok(ApplyOutcome::Finished(RunStatus::Failed))
                } else {
                    Ok(ApplyOutcome::Interrupted)
                }
            }
            RecoverAction::Retry => {
                let last_failed = self
                    .store
                    .latest_step(&run.id, StepType::ToolCall, Some(StepStatus::Failed))
                    .await?;
                match last_failed.and_then(|s| match (s.tool_name, s.args_json) {
                    (Some(name), Some(Value::Object(args))) => Some((name, args)),
                    _ => None,
                }) {
                    Some((name, args)) => {
                        info!("Run [{}] retrying {}", run.id, name);
                        self.apply_tool_call(run, &name, &args).await
                    }
                    None => Ok(ApplyOutcome::Continue),
                }
            }
        }
    }

    async fn spawn_children(&self, run: &Run, specs: &[SubagentSpec]) -> CoreResult<ApplyOutcome> {
        let n = run.iteration;
        let now = Utc::now();
        let mut spawned = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}:{}", run.id, n, i).as_bytes())
                .to_string();
            // A child can narrow its parent's tools, never widen them.
            let allowed_tools = match (&spec.allowed_tools, &run.allowed_tools) {
                (Some(wanted), Some(_)) => Some(
                    wanted
                        .iter()
                        .filter(|t| run.is_tool_allowed(t))
                        .cloned()
                        .collect(),
                ),
                (Some(wanted), None) => Some(wanted.clone()),
                (None, inherited) => inherited.clone(),
            };
            let child = Run {
                id: id.clone(),
                tenant_id: run.tenant_id.clone(),
                agent_id: spec.agent_id.clone().unwrap_or_else(|| run.agent_id.clone()),
                user_id: run.user_id.clone(),
                channel_id: None,
                context_id: None,
                parent_run_id: Some(run.id.clone()),
                root_run_id: run.root_run_id.clone(),
                kind: RunKind::Subagent,
                status: RunStatus::Pending,
                input_text: Some(spec.input.clone()),
                input_json: spec.input_json.clone(),
                output_text: None,
                allowed_tools,
                policy_profile: run.policy_profile.clone(),
                wake_at: None,
                wake_reason: None,
                iteration: 0,
                max_iterations: self.clamp_iterations(spec.max_iterations),
                pending_confirmation: None,
                cancel_reason: None,
                cancel_requested_at: None,
                cancel_requested_by: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            };
            if self.store.insert_run(&child).await? {
                info!("Run [{}] spawned subagent {}", run.id, id);
            }
            self.enqueue_run(&id, format!("run:{id}:0")).await?;
            spawned.push(json!({ "id": id, "name": spec.name }));
        }

        self.record_step(
            NewStep::new(&run.id, StepType::Message, step_key(n, "spawn"))
                .args(json!({ "kind": "spawn", "children": spawned })),
        )
        .await?;

        if self.park(run, WakeReason::ChildrenPending, None, None).await? {
            return Ok(ApplyOutcome::Parked(WakeReason::ChildrenPending));
        }
        // Cancelled while spawning: make sure the new children follow.
        if let Some(current) = self.store.get_run(&run.id).await?
            && current.status == RunStatus::Cancelled
        {
            self.cancel(CancelRequest {
                run_id: run.id.clone(),
                reason: current
                    .cancel_reason
                    .unwrap_or_else(|| "cancelled".to_string()),
                requested_by: current.cancel_requested_by,
            })
            .await?;
        }
        Ok(ApplyOutcome::Interrupted)
    }

    async fn sleep(
        &self,
        run: &Run,
        reason: Option<&str>,
        wake_at: Option<DateTime<Utc>>,
        delay_seconds: Option<u64>,
        cron: Option<&str>,
    ) -> CoreResult<ApplyOutcome> {
        let key = step_key(run.iteration, "sleep");
        let Some(computed) = sleep_wake_at(wake_at, delay_seconds, cron, Utc::now()) else {
            self.record_step(
                NewStep::new(&run.id, StepType::Message, key)
                    .args(json!({ "kind": "sleep", "reason": reason, "cron": cron }))
                    .result(json!({ "error": "sleep has no resolvable wake time" }))
                    .status(StepStatus::Failed),
            )
            .await?;
            return Ok(ApplyOutcome::Continue);
        };
        let (step, _) = self
            .record_step(NewStep::new(&run.id, StepType::Message, key).args(json!({
                "kind": "sleep",
                "reason": reason,
                "wakeAt": computed,
                "cron": cron,
            })))
            .await?;
        // A replayed sleep keeps the wake time chosen the first time.
        let wake = step
            .args_json
            .as_ref()
            .and_then(|a| a.get("wakeAt"))
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
            .unwrap_or(computed);
        if !self.park(run, WakeReason::Sleep, Some(wake), None).await? {
            return Ok(ApplyOutcome::Interrupted);
        }
        Ok(ApplyOutcome::Parked(WakeReason::Sleep))
    }

    // ── External signals ──

    /// Decide a pending tool confirmation and wake the run. The decision is
    /// carried out by the next iteration.
    pub async fn confirm_tool(&self, run_id: &str, decision: ConfirmDecision) -> CoreResult<Run> {
        let run = self.store.require_run(run_id).await?;
        let pending = match (&run.pending_confirmation, run.status, run.wake_reason) {
            (Some(p), RunStatus::Waiting, Some(WakeReason::ToolConfirm)) => p.clone(),
            _ => {
                return Err(CoreError::NotWaitingForConfirmation {
                    run_id: run_id.to_string(),
                });
            }
        };
        if let Some(received) = &decision.request_id
            && *received != pending.request_id
        {
            return Err(CoreError::ConfirmationConflict {
                expected: pending.request_id,
                received: received.clone(),
            });
        }
        if pending.require_reason
            && decision
                .reason
                .as_deref()
                .is_none_or(|r| r.trim().is_empty())
        {
            return Err(CoreError::ReasonRequired);
        }

        let request_id = pending.request_id.clone();
        let decided = PendingConfirmation {
            approved: Some(decision.approved),
            decided_by: decision.decided_by,
            reason: decision.reason,
            ..pending
        };
        let mut patch = RunPatch::from(&[RunStatus::Waiting]).to(RunStatus::Pending);
        patch.expect_wake_reason = Some(WakeReason::ToolConfirm);
        patch.wake_reason = Some(Some(WakeReason::Confirmed));
        patch.pending_confirmation = Some(Some(decided));
        if !self.transition(run_id, &patch).await? {
            return Err(CoreError::NotWaitingForConfirmation {
                run_id: run_id.to_string(),
            });
        }
        self.enqueue_run(run_id, format!("confirm:{run_id}:{request_id}"))
            .await?;
        info!(
            "Run [{}] tool confirmation {} {}",
            run_id,
            request_id,
            if decision.approved { "approved" } else { "rejected" }
        );
        self.store.require_run(run_id).await
    }

    /// Carry out a decided confirmation: run the approved call or record the
    /// rejection, then clear it from the run.
    pub async fn execute_confirmed(&self, run: &Run) -> CoreResult<()> {
        let Some(pending) = &run.pending_confirmation else {
            return Ok(());
        };
        let result_key = step_key(pending.iteration, "tool_result");
        if self
            .store
            .get_step_by_key(&run.id, &result_key)
            .await?
            .is_none()
        {
            if pending.approved == Some(true) {
                self.execute_tool(run, pending.iteration, &pending.tool_name, &pending.args)
                    .await?;
            } else {
                if let Some(call) = self
                    .store
                    .get_step_by_key(&run.id, &step_key(pending.iteration, "tool_call"))
                    .await?
                {
                    self.finish_step(&call, StepStatus::Failed, None).await?;
                }
                self.record_step(
                    NewStep::new(&run.id, StepType::ToolResult, result_key)
                        .tool(&pending.tool_name)
                        .args(Value::Object(pending.args.clone()))
                        .result(json!({
                            "success": false,
                            "rejected": true,
                            "error": "tool call was not approved",
                            "reason": pending.reason,
                            "decidedBy": pending.decided_by,
                        }))
                        .status(StepStatus::Failed),
                )
                .await?;
            }
        }
        let mut patch = RunPatch::from(&[RunStatus::Running]);
        patch.pending_confirmation = Some(None);
        self.store.update_run(&run.id, &patch).await?;
        Ok(())
    }

    /// Cancel every non-terminal run in the tree of `run_id`. Returns the ids
    /// that were cancelled by this call.
    pub async fn cancel(&self, request: CancelRequest) -> CoreResult<Vec<String>> {
        let run = self.store.require_run(&request.run_id).await?;
        let root_id = run.root_run_id.clone();
        let family = self
            .store
            .list_runs(&RunFilter {
                root_run_id: Some(root_id.clone()),
                statuses: RunStatus::NON_TERMINAL.to_vec(),
                ..RunFilter::default()
            })
            .await?;

        let mut cancelled = Vec::new();
        for member in family {
            let mut patch = RunPatch::from(&RunStatus::NON_TERMINAL).to(RunStatus::Cancelled);
            patch.cancel_reason = Some(request.reason.clone());
            patch.cancel_requested_by = request.requested_by.clone();
            patch.wake_at = Some(None);
            if self.transition(&member.id, &patch).await? {
                cancelled.push(member.id);
            }
        }

        let root = self.store.require_run(&root_id).await?;
        if cancelled.is_empty() && root.status != RunStatus::Cancelled {
            return Ok(cancelled);
        }

        let (_, inserted) = self
            .record_step(
                NewStep::new(&root_id, StepType::Message, format!("cancel:{root_id}")).args(json!({
                    "kind": "cancel",
                    "reason": request.reason,
                    "requestedBy": request.requested_by,
                    "requestedFor": request.run_id,
                    "cancelled": cancelled,
                })),
            )
            .await?;
        if inserted {
            info!(
                "Run [{}] cancelled with {} run(s) in its tree",
                root_id,
                cancelled.len()
            );
            if let Some(channel_id) = &root.channel_id {
                self.queue
                    .enqueue(
                        DELIVERY_QUEUE,
                        json!({
                            "kind": "cancelled",
                            "runId": root_id,
                            "tenantId": root.tenant_id,
                            "channelId": channel_id,
                            "userId": root.user_id,
                            "message": "Task cancelled.",
                        }),
                        EnqueueOptions::id(format!("cancel-notice:{root_id}")),
                    )
                    .await?;
            }
        }
        Ok(cancelled)
    }

    /// Wake sleeping runs whose time has come.
    pub async fn wake_due_sleepers(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let due = self
            .store
            .list_runs(&RunFilter {
                statuses: vec![RunStatus::Waiting],
                wake_reason: Some(WakeReason::Sleep),
                wake_at_or_before: Some(now),
                ..RunFilter::default()
            })
            .await?;
        let mut woken = 0;
        for run in due {
            let mut patch = RunPatch::from(&[RunStatus::Waiting]).to(RunStatus::Pending);
            patch.expect_wake_reason = Some(WakeReason::Sleep);
            patch.expect_iteration = Some(run.iteration);
            patch.wake_at = Some(None);
            if self.transition(&run.id, &patch).await? {
                self.enqueue_run(&run.id, format!("wake:{}:{}", run.id, run.iteration))
                    .await?;
                woken += 1;
            }
        }
        Ok(woken)
    }

    /// Wake parents whose children are done. The compare-and-set on the wake
    /// reason makes each parked parent wake exactly once.
    pub async fn wake_parents(&self) -> CoreResult<usize> {
        let parked = self
            .store
            .list_runs(&RunFilter {
                statuses: vec![RunStatus::Waiting],
                wake_reason: Some(WakeReason::ChildrenPending),
                ..RunFilter::default()
            })
            .await?;
        let mut woken = 0;
        for parent in parked {
            let children = self.store.list_children(&parent.id).await?;
            let all_done = children.iter().all(|c| c.status.is_terminal());
            let ready = if self.settings.wake_on_any_child {
                let reported = self.reported_children(&parent.id).await?;
                let finished: Vec<&str> = children
                    .iter()
                    .filter(|c| c.status.is_terminal())
                    .map(|c| c.id.as_str())
                    .collect();
                let fresh = finished.iter().any(|id| !reported.contains(*id));
                if fresh || all_done {
                    // Recorded before the wake so a concurrent tick dedups on the key.
                    self.record_step(
                        NewStep::new(
                            &parent.id,
                            StepType::Message,
                            step_key(parent.iteration, "children_seen"),
                        )
                        .args(json!({ "kind": "children_seen", "childIds": finished })),
                    )
                    .await?;
                }
                fresh || all_done
            } else {
                all_done
            };
            if !ready {
                continue;
            }
            let mut patch = RunPatch::from(&[RunStatus::Waiting]).to(RunStatus::Pending);
            patch.expect_wake_reason = Some(WakeReason::ChildrenPending);
            patch.expect_iteration = Some(parent.iteration);
            patch.wake_reason = Some(Some(WakeReason::ChildrenDone));
            if self.transition(&parent.id, &patch).await? {
                info!("Run [{}] woken: children done", parent.id);
                self.enqueue_run(&parent.id, format!("wake:{}:{}", parent.id, parent.iteration))
                    .await?;
                woken += 1;
            }
        }
        Ok(woken)
    }

    /// Child ids already reported to the parent by an earlier any-child wake.
    async fn reported_children(&self, parent_id: &str) -> CoreResult<HashSet<String>> {
        let steps = self.store.list_steps(parent_id, 0).await?;
        Ok(steps
            .iter()
            .filter(|s| s.step_type == StepType::Message)
            .filter_map(|s| s.args_json.as_ref())
            .filter(|a| a["kind"] == "children_seen")
            .filter_map(|a| a["childIds"].as_array())
            .flatten()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect())
    }

    /// Return runs stuck in `running` to the queue.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let Some(cutoff) = chrono::Duration::from_std(self.settings.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let stale = self
            .store
            .list_runs(&RunFilter {
                statuses: vec![RunStatus::Running],
                updated_before: Some(cutoff),
                ..RunFilter::default()
            })
            .await?;
        let mut recovered = 0;
        for run in stale {
            let mut patch = RunPatch::from(&[RunStatus::Running]).to(RunStatus::Pending);
            patch.expect_iteration = Some(run.iteration);
            patch.wake_reason = Some(Some(WakeReason::Recovered));
            if self.transition(&run.id, &patch).await? {
                warn!("Run [{}] was stale; requeued", run.id);
                self.enqueue_run(&run.id, format!("recover:{}:{}", run.id, run.iteration))
                    .await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
