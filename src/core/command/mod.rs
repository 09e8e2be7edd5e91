//! Model-issued commands.
//!
//! Raw model output goes through three passes before it reaches the run
//! engine: [`canonicalize`] (pure shape normalization), [`validate`] (schema
//! check producing structured issues) and, only when validation fails,
//! [`repair`] followed by a second validation.

mod canonicalize;
mod repair;
mod validate;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use canonicalize::{canonicalize, is_tool_command_name};
pub use repair::{Repaired, repair};
pub use validate::{IssueCode, ValidationIssue, validate};

/// Every canonical command tag.
pub const COMMAND_TAGS: &[&str] = &[
    "tool_call",
    "send_message",
    "set_output",
    "finish",
    "decision",
    "note",
    "set_run_limits",
    "recover",
    "spawn_subagent",
    "spawn_subagents",
    "sleep",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverAction {
    Retry,
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    ToolCall {
        name: String,
        args: Map<String, Value>,
    },
    SendMessage {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        file_ids: Vec<String>,
    },
    SetOutput {
        output: String,
        #[serde(default)]
        mode: OutputMode,
    },
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default)]
        mode: OutputMode,
    },
    Decision {
        content: String,
        #[serde(default)]
        importance: Importance,
    },
    Note {
        category: String,
        content: String,
    },
    SetRunLimits {
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Recover {
        reason: String,
        #[serde(default)]
        action: RecoverAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SpawnSubagent {
        subagent: SubagentSpec,
    },
    SpawnSubagents {
        subagents: Vec<SubagentSpec>,
    },
    Sleep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wake_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cron: Option<String>,
    },
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::ToolCall { .. } => "tool_call",
            Command::SendMessage { .. } => "send_message",
            Command::SetOutput { .. } => "set_output",
            Command::Finish { .. } => "finish",
            Command::Decision { .. } => "decision",
            Command::Note { .. } => "note",
            Command::SetRunLimits { .. } => "set_run_limits",
            Command::Recover { .. } => "recover",
            Command::SpawnSubagent { .. } => "spawn_subagent",
            Command::SpawnSubagents { .. } => "spawn_subagents",
            Command::Sleep { .. } => "sleep",
        }
    }
}

/// Parse a cron expression, accepting the classic five-field form by
/// prepending a zero seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {expr}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}

/// Resolve when a `sleep` should wake. `wakeAt` wins over `delaySeconds`,
/// which wins over `cron`.
pub fn sleep_wake_at(
    wake_at: Option<DateTime<Utc>>,
    delay_seconds: Option<u64>,
    cron: Option<&str>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(at) = wake_at {
        return Some(at);
    }
    if let Some(secs) = delay_seconds {
        let secs = i64::try_from(secs).ok()?;
        return now.checked_add_signed(chrono::Duration::try_seconds(secs)?);
    }
    let schedule = parse_cron(cron?).ok()?;
    schedule.after(&now).next()
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("model output is not a JSON command: {0}")]
    NotJson(String),
    #[error("command failed validation and no repair applied: {}", summarize(.issues))]
    Invalid { issues: Vec<ValidationIssue> },
    #[error("command still invalid after repairs [{}]: {}", .applied.join(", "), summarize(.issues))]
    StillInvalid {
        applied: Vec<&'static str>,
        issues: Vec<ValidationIssue>,
    },
}

impl CommandError {
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            CommandError::NotJson(_) => &[],
            CommandError::Invalid { issues } | CommandError::StillInvalid { issues, .. } => issues,
        }
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| {
            if i.path.is_empty() {
                i.message.clone()
            } else {
                format!("{}: {}", i.path.join("."), i.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command: Command,
    /// The value that finally validated.
    pub canonical: Value,
    /// Names of repairs that were needed, empty for a clean parse.
    pub repairs: Vec<&'static str>,
}

impl ParsedCommand {
    pub fn was_repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Canonicalize, validate and, if needed, repair a decoded command.
pub fn parse_command(raw: &Value) -> Result<ParsedCommand, CommandError> {
    let canonical = canonicalize(raw);
    let issues = match validate(&canonical) {
        Ok(command) => {
            debug!("Command [{}] validated cleanly", command.tag());
            return Ok(ParsedCommand {
                command,
                canonical,
                repairs: Vec::new(),
            });
        }
        Err(issues) => issues,
    };

    let Some(Repaired { value, applied }) = repair(&canonical, &issues) else {
        warn!(
            "Command rejected, no repair matched: {}",
            summarize(&issues)
        );
        return Err(CommandError::Invalid { issues });
    };

    let value = canonicalize(&value);
    match validate(&value) {
        Ok(command) => {
            warn!(
                "Command [{}] validated after repair [{}]",
                command.tag(),
                applied.join(", ")
            );
            Ok(ParsedCommand {
                command,
                canonical: value,
                repairs: applied,
            })
        }
        Err(issues) => {
            warn!(
                "Command still invalid after repair [{}]: {}",
                applied.join(", "),
                summarize(&issues)
            );
            Err(CommandError::StillInvalid { applied, issues })
        }
    }
}

/// Pull a JSON value out of model text. Accepts a fenced ```json block or a
/// bare object/array.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

pub fn decode_model_output(text: &str) -> Result<Value, CommandError> {
    let block = extract_json_block(text)
        .ok_or_else(|| CommandError::NotJson("no JSON object found".into()))?;
    serde_json::from_str(block).map_err(|e| CommandError::NotJson(e.to_string()))
}

/// Decode and parse raw model text in one go.
pub fn parse_model_output(text: &str) -> Result<ParsedCommand, CommandError> {
    parse_command(&decode_model_output(text)?)
}
