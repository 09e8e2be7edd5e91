//! Runs, steps and the state machine that moves them.

pub mod compaction;
mod engine;
pub mod events;
pub mod outbound;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::CoreError;

pub use engine::{ApplyOutcome, CancelRequest, ConfirmDecision, RunEngine, RunJob, RunSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub const NON_TERMINAL: [RunStatus; 3] =
        [RunStatus::Pending, RunStatus::Running, RunStatus::Waiting];
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "waiting" => RunStatus::Waiting,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            other => {
                return Err(CoreError::Corrupt {
                    field: "runs.status",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// Allowed run status transitions. Self-transitions are not transitions.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    match from {
        RunStatus::Pending => matches!(to, RunStatus::Running | RunStatus::Cancelled),
        RunStatus::Running => matches!(
            to,
            RunStatus::Pending
                | RunStatus::Waiting
                | RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
        ),
        RunStatus::Waiting => matches!(
            to,
            RunStatus::Pending | RunStatus::Running | RunStatus::Failed | RunStatus::Cancelled
        ),
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Coordinator,
    Subagent,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Coordinator => "coordinator",
            RunKind::Subagent => "subagent",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "coordinator" => Ok(RunKind::Coordinator),
            "subagent" => Ok(RunKind::Subagent),
            other => Err(CoreError::Corrupt {
                field: "runs.kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    ToolConfirm,
    Sleep,
    ChildrenPending,
    ChildrenDone,
    Confirmed,
    Recovered,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WakeReason::ToolConfirm => "tool_confirm",
            WakeReason::Sleep => "sleep",
            WakeReason::ChildrenPending => "children_pending",
            WakeReason::ChildrenDone => "children_done",
            WakeReason::Confirmed => "confirmed",
            WakeReason::Recovered => "recovered",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "tool_confirm" => WakeReason::ToolConfirm,
            "sleep" => WakeReason::Sleep,
            "children_pending" => WakeReason::ChildrenPending,
            "children_done" => WakeReason::ChildrenDone,
            "confirmed" => WakeReason::Confirmed,
            "recovered" => WakeReason::Recovered,
            other => {
                return Err(CoreError::Corrupt {
                    field: "runs.wake_reason",
                    value: other.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Message,
    ToolCall,
    ToolResult,
    AssistantMessage,
    OutputUpdate,
    Finish,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Message => "message",
            StepType::ToolCall => "tool_call",
            StepType::ToolResult => "tool_result",
            StepType::AssistantMessage => "assistant_message",
            StepType::OutputUpdate => "output_update",
            StepType::Finish => "finish",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "message" => StepType::Message,
            "tool_call" => StepType::ToolCall,
            "tool_result" => StepType::ToolResult,
            "assistant_message" => StepType::AssistantMessage,
            "output_update" => StepType::OutputUpdate,
            "finish" => StepType::Finish,
            other => {
                return Err(CoreError::Corrupt {
                    field: "run_steps.step_type",
                    value: other.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            other => {
                return Err(CoreError::Corrupt {
                    field: "run_steps.status",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// A tool call held back until someone approves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
    pub request_id: String,
    pub tool_name: String,
    pub args: serde_json::Map<String, Value>,
    /// Iteration that asked for confirmation.
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub require_reason: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub context_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub root_run_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub input_text: Option<String>,
    pub input_json: Option<Value>,
    pub output_text: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub policy_profile: Option<String>,
    pub wake_at: Option<DateTime<Utc>>,
    pub wake_reason: Option<WakeReason>,
    /// Next iteration to execute.
    pub iteration: u32,
    pub max_iterations: u32,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub cancel_reason: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_tool_allowed(&self, name: &str) -> bool {
        match &self.allowed_tools {
            None => true,
            Some(list) => list.iter().any(|pattern| {
                pattern == "*"
                    || pattern == name
                    || pattern
                        .strip_suffix('*')
                        .is_some_and(|prefix| name.starts_with(prefix))
            }),
        }
    }
}

/// Input for a new top-level run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    #[serde(default)]
    pub id: Option<String>,
    pub tenant_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub input_json: Option<Value>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub policy_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub seq: i64,
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub args_json: Option<Value>,
    pub result_json: Option<Value>,
    pub status: StepStatus,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A step to be appended; `seq` and `id` are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub run_id: String,
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub args_json: Option<Value>,
    pub result_json: Option<Value>,
    pub status: StepStatus,
    pub idempotency_key: String,
}

impl NewStep {
    pub fn new(run_id: &str, step_type: StepType, key: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_type,
            tool_name: None,
            args_json: None,
            result_json: None,
            status: StepStatus::Completed,
            idempotency_key: key.into(),
        }
    }

    pub fn tool(mut self, name: &str) -> Self {
        self.tool_name = Some(name.to_string());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args_json = Some(args);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result_json = Some(result);
        self
    }

    pub fn status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }
}

/// Idempotency key for a step produced during iteration `n`.
pub fn step_key(iteration: u32, what: &str) -> String {
    format!("it{iteration}:{what}")
}
