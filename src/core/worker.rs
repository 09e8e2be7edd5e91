//! Queue consumers. `RunWorker` executes one run iteration per job; the
//! delivery and memory consumers are the daemon's default sinks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::core::command::{ParsedCommand, parse_model_output};
use crate::core::error::{CoreError, CoreResult};
use crate::core::llm::{ChatMessage, CompletionOptions, LlmManager};
use crate::core::queue::{Job, JobHandler};
use crate::core::runs::compaction::ContextCompactor;
use crate::core::runs::{
    ApplyOutcome, NewStep, Run, RunEngine, RunJob, RunStatus, RunStep, StepStatus, StepType,
    step_key,
};
use crate::core::store::MessageDirection;

/// Shown to the user when a run dies of an internal error.
const INTERNAL_FAILURE: &str = "The task stopped because of an internal error.";

const COMMAND_FORMAT: &str = "Reply with exactly one JSON command and nothing else.\n\
     Commands:\n\
     {\"type\":\"tool_call\",\"name\":\"namespace.command\",\"args\":{...}}\n\
     {\"type\":\"send_message\",\"message\":\"...\"}\n\
     {\"type\":\"set_output\",\"output\":\"...\",\"mode\":\"replace|append\"}\n\
     {\"type\":\"finish\",\"output\":\"...\"}\n\
     {\"type\":\"decision\",\"content\":\"...\",\"importance\":\"low|medium|high\"}\n\
     {\"type\":\"note\",\"category\":\"...\",\"content\":\"...\"}\n\
     {\"type\":\"set_run_limits\",\"maxIterations\":N,\"reason\":\"...\"}\n\
     {\"type\":\"recover\",\"reason\":\"...\",\"action\":\"retry|continue|abort\"}\n\
     {\"type\":\"spawn_subagents\",\"subagents\":[{\"input\":\"...\"}]}\n\
     {\"type\":\"sleep\",\"delaySeconds\":N}\n\
     You may send at most one message per turn. Finish when the task is done.\n";

pub struct RunWorker {
    engine: Arc<RunEngine>,
    llm: LlmManager,
    system_prompt: Option<String>,
}

impl RunWorker {
    pub fn new(engine: Arc<RunEngine>, llm: LlmManager, system_prompt: Option<String>) -> Self {
        Self {
            engine,
            llm,
            system_prompt,
        }
    }

    /// Execute one iteration of `run_id`. Returns `None` when there was
    /// nothing to claim.
    pub async fn run_iteration(&self, run_id: &str, redelivery: bool) -> CoreResult<Option<ApplyOutcome>> {
        let Some(mut run) = self.engine.claim(run_id, redelivery).await? else {
            return Ok(None);
        };
        debug!("Run [{}] iteration {} started", run.id, run.iteration);

        if let Some(reason) = self.engine.budget_exhausted(&run, Utc::now()) {
            self.engine.fail_run(&run.id, &reason).await?;
            return Ok(Some(ApplyOutcome::Finished(RunStatus::Failed)));
        }

        if run
            .pending_confirmation
            .as_ref()
            .is_some_and(|p| p.approved.is_some())
        {
            self.engine.execute_confirmed(&run).await?;
            run = self.engine.store().require_run(run_id).await?;
        }

        if !self.still_running(&run).await? {
            return Ok(Some(ApplyOutcome::Interrupted));
        }

        let Some(parsed) = self.model_command(&run).await? else {
            // Malformed output was recorded; the model sees the issues next turn.
            return Ok(Some(self.yield_or_interrupted(&run).await?));
        };

        if !self.still_running(&run).await? {
            return Ok(Some(ApplyOutcome::Interrupted));
        }

        let outcome = self.engine.apply(&run, &parsed.command).await?;
        match outcome {
            ApplyOutcome::Continue => Ok(Some(self.yield_or_interrupted(&run).await?)),
            other => Ok(Some(other)),
        }
    }

    async fn still_running(&self, run: &Run) -> CoreResult<bool> {
        let current = self.engine.store().require_run(&run.id).await?;
        if current.status != RunStatus::Running || current.iteration != run.iteration {
            info!(
                "Run [{}] is {} at a step boundary; stopping iteration {}",
                run.id, current.status, run.iteration
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn yield_or_interrupted(&self, run: &Run) -> CoreResult<ApplyOutcome> {
        if self.engine.yield_iteration(run).await? {
            Ok(ApplyOutcome::Continue)
        } else {
            Ok(ApplyOutcome::Interrupted)
        }
    }

    /// The command for this iteration: parsed from the stored model output
    /// on a replay, otherwise from a fresh model call. `None` when the output
    /// did not parse.
    async fn model_command(&self, run: &Run) -> CoreResult<Option<ParsedCommand>> {
        let key = step_key(run.iteration, "model");
        let text = match self.engine.store().get_step_by_key(&run.id, &key).await? {
            Some(step) if step.status == StepStatus::Failed => return Ok(None),
            Some(step) => step
                .args_json
                .as_ref()
                .and_then(|a| a.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None => {
                let prompt = self.build_prompt(run).await?;
                let text = self.llm.complete(&prompt, &CompletionOptions::default()).await?;
                info!("Run [{}] iteration {}: {} chars", run.id, run.iteration, text.len());
                text
            }
        };

        match parse_model_output(&text) {
            Ok(parsed) => {
                self.engine
                    .record_step(
                        NewStep::new(&run.id, StepType::AssistantMessage, key)
                            .args(json!({ "text": text }))
                            .result(json!({
                                "command": parsed.canonical,
                                "repairs": parsed.repairs,
                            })),
                    )
                    .await?;
                Ok(Some(parsed))
            }
            Err(e) => {
                warn!("Run [{}] model output rejected: {}", run.id, e);
                self.engine
                    .record_step(
                        NewStep::new(&run.id, StepType::AssistantMessage, key)
                            .args(json!({ "text": text }))
                            .result(json!({ "error": e.to_string(), "issues": e.issues() }))
                            .status(StepStatus::Failed),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    pub(crate) async fn build_prompt(&self, run: &Run) -> CoreResult<Vec<ChatMessage>> {
        let store = self.engine.store();
        let mut system = String::new();
        if let Some(prompt) = &self.system_prompt {
            system.push_str(prompt);
            system.push_str("\n\n");
        }
        system.push_str(COMMAND_FORMAT);
        system.push_str("\n--- AVAILABLE TOOLS ---\n");
        for tool in self.engine.tools().visible_to(run) {
            system.push_str(&format!(
                "{} [{}]: {}\n",
                tool.name,
                tool.classification.as_str(),
                tool.description
            ));
        }
        system.push_str("--- END OF TOOLS ---\n");

        let mut messages = vec![ChatMessage::system(system)];

        if let Some(context_id) = &run.context_id {
            if let Some(summary) = store.context_summary(context_id).await? {
                messages.push(ChatMessage::system(format!("Earlier conversation: {summary}")));
            }
            for m in store.context_messages(context_id).await? {
                if m.created_at >= run.created_at {
                    continue;
                }
                messages.push(match m.direction {
                    MessageDirection::Inbound => ChatMessage::user(m.content),
                    MessageDirection::Outbound => ChatMessage::assistant(m.content),
                });
            }
        }

        let mut task = run.input_text.clone().unwrap_or_default();
        if let Some(input) = &run.input_json {
            task.push_str(&format!("\n\nInput: {input}"));
        }
        messages.push(ChatMessage::user(task));

        for step in store.list_steps(&run.id, 0).await? {
            if let Some(message) = transcript_entry(&step) {
                messages.push(message);
            }
        }

        let children = store.list_children(&run.id).await?;
        if !children.is_empty() {
            let mut report = String::from("Subagent results:\n");
            for child in children {
                report.push_str(&format!(
                    "- {} ({}): {}\n",
                    child.id,
                    child.status,
                    child.output_text.as_deref().unwrap_or("")
                ));
            }
            messages.push(ChatMessage::user(report));
        }
        Ok(messages)
    }
}

fn transcript_entry(step: &RunStep) -> Option<ChatMessage> {
    let args = step.args_json.as_ref();
    let result = step.result_json.as_ref();
    match step.step_type {
        StepType::AssistantMessage => {
            let text = args?.get("text")?.as_str()?;
            if step.status == StepStatus::Failed {
                let error = result
                    .and_then(|r| r.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("invalid command");
                Some(ChatMessage::user(format!(
                    "Your reply was not a valid command ({error}). Previous reply:\n{text}"
                )))
            } else {
                Some(ChatMessage::assistant(text))
            }
        }
        StepType::ToolResult => Some(ChatMessage::user(format!(
            "Result of {}: {}",
            step.tool_name.as_deref().unwrap_or("tool"),
            result.cloned().unwrap_or(Value::Null)
        ))),
        StepType::Message if step.status == StepStatus::Failed => Some(ChatMessage::user(format!(
            "Not applied: {}",
            result.cloned().unwrap_or(Value::Null)
        ))),
        _ => None,
    }
}

#[async_trait]
impl JobHandler for RunWorker {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let RunJob { run_id } = serde_json::from_value::<RunJob>(job.payload.clone())?;
        if let Some(outcome) = self.run_iteration(&run_id, job.attempt > 1).await? {
            debug!("Run [{}] iteration outcome: {:?}", run_id, outcome);
        }
        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, err: &CoreError) {
        let Ok(RunJob { run_id }) = serde_json::from_value::<RunJob>(job.payload.clone()) else {
            error!("Job [{}] has no run id; dropping", job.id);
            return;
        };
        error!("Run [{}] failed after {} attempts: {}", run_id, job.attempt, err);
        if let Err(e) = self.engine.fail_run(&run_id, INTERNAL_FAILURE).await {
            error!("Run [{}] could not be marked failed: {}", run_id, e);
        }
    }
}

/// Default delivery sink: logs what would be sent.
pub struct DeliveryLog;

#[async_trait]
impl JobHandler for DeliveryLog {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let p = &job.payload;
        info!(
            "Delivery [{}] {} for run {} to channel {}: {}",
            job.id,
            p["kind"].as_str().unwrap_or("message"),
            p["runId"].as_str().unwrap_or("?"),
            p["channelId"].as_str().unwrap_or("none"),
            p["message"].as_str().unwrap_or("")
        );
        Ok(())
    }
}

/// Memory-writes consumer: context compaction requests plus decision and
/// note records.
pub struct MemoryWriter {
    compactor: Option<Arc<ContextCompactor>>,
}

impl MemoryWriter {
    pub fn new(compactor: Option<Arc<ContextCompactor>>) -> Self {
        Self { compactor }
    }
}

#[async_trait]
impl JobHandler for MemoryWriter {
    async fn handle(&self, job: &Job) -> CoreResult<()> {
        let p = &job.payload;
        match p["kind"].as_str() {
            Some("compact") => {
                let (Some(compactor), Some(context_id)) = (&self.compactor, p["contextId"].as_str())
                else {
                    return Ok(());
                };
                compactor.maybe_compact(context_id).await?;
            }
            Some(kind) => info!(
                "Memory [{}] {} from run {}: {}",
                job.id,
                kind,
                p["runId"].as_str().unwrap_or("?"),
                p["entry"]["content"].as_str().unwrap_or("")
            ),
            None => warn!("Memory job [{}] has no kind; ignored", job.id),
        }
        Ok(())
    }
}
