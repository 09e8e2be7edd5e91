//! Schema check for canonical command values.
//!
//! Produces structured issues (path + code) so the repairer can target the
//! exact fields that failed, then deserializes into [`Command`].

use serde::Serialize;
use serde_json::{Map, Value};

use super::{Command, parse_cron};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum IssueCode {
    InvalidType {
        expected: &'static str,
        received: &'static str,
    },
    Required,
    UnknownType,
    InvalidValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: Vec<String>,
    #[serde(flatten)]
    pub code: IssueCode,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: Vec<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            path,
            code,
            message: message.into(),
        }
    }

    /// Last path segment, the field the issue is about.
    pub fn field(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    String,
    NonNegativeInteger,
    PositiveInteger,
    Object,
    StringArray,
    OneOf(&'static [&'static str]),
    Timestamp,
    Subagent,
    SubagentArray,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

const OUTPUT_MODES: &[&str] = &["replace", "append"];
const IMPORTANCE: &[&str] = &["low", "medium", "high"];
const RECOVER_ACTIONS: &[&str] = &["retry", "continue", "abort"];

const SUBAGENT_FIELDS: &[FieldSpec] = &[
    req("input", FieldKind::String),
    opt("name", FieldKind::String),
    opt("agentId", FieldKind::String),
    opt("inputJson", FieldKind::Object),
    opt("allowedTools", FieldKind::StringArray),
    opt("maxIterations", FieldKind::PositiveInteger),
];

fn variant_fields(tag: &str) -> Option<&'static [FieldSpec]> {
    const TOOL_CALL: &[FieldSpec] = &[req("name", FieldKind::String), req("args", FieldKind::Object)];
    const SEND_MESSAGE: &[FieldSpec] = &[
        req("message", FieldKind::String),
        opt("fileIds", FieldKind::StringArray),
    ];
    const SET_OUTPUT: &[FieldSpec] = &[
        req("output", FieldKind::String),
        opt("mode", FieldKind::OneOf(OUTPUT_MODES)),
    ];
    const FINISH: &[FieldSpec] = &[
        opt("output", FieldKind::String),
        opt("mode", FieldKind::OneOf(OUTPUT_MODES)),
    ];
    const DECISION: &[FieldSpec] = &[
        req("content", FieldKind::String),
        opt("importance", FieldKind::OneOf(IMPORTANCE)),
    ];
    const NOTE: &[FieldSpec] = &[
        req("category", FieldKind::String),
        req("content", FieldKind::String),
    ];
    const SET_RUN_LIMITS: &[FieldSpec] = &[
        req("maxIterations", FieldKind::PositiveInteger),
        opt("reason", FieldKind::String),
    ];
    const RECOVER: &[FieldSpec] = &[
        req("reason", FieldKind::String),
        opt("action", FieldKind::OneOf(RECOVER_ACTIONS)),
        opt("message", FieldKind::String),
    ];
    const SPAWN_SUBAGENT: &[FieldSpec] = &[req("subagent", FieldKind::Subagent)];
    const SPAWN_SUBAGENTS: &[FieldSpec] = &[req("subagents", FieldKind::SubagentArray)];
    const SLEEP: &[FieldSpec] = &[
        opt("reason", FieldKind::String),
        opt("wakeAt", FieldKind::Timestamp),
        opt("delaySeconds", FieldKind::NonNegativeInteger),
        opt("cron", FieldKind::String),
    ];

    Some(match tag {
        "tool_call" => TOOL_CALL,
        "send_message" => SEND_MESSAGE,
        "set_output" => SET_OUTPUT,
        "finish" => FINISH,
        "decision" => DECISION,
        "note" => NOTE,
        "set_run_limits" => SET_RUN_LIMITS,
        "recover" => RECOVER,
        "spawn_subagent" => SPAWN_SUBAGENT,
        "spawn_subagents" => SPAWN_SUBAGENTS,
        "sleep" => SLEEP,
        _ => return None,
    })
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected_name(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::String | FieldKind::OneOf(_) | FieldKind::Timestamp => "string",
        FieldKind::NonNegativeInteger | FieldKind::PositiveInteger => "integer",
        FieldKind::Object | FieldKind::Subagent => "object",
        FieldKind::StringArray | FieldKind::SubagentArray => "array",
    }
}

fn check_fields(
    obj: &Map<String, Value>,
    fields: &[FieldSpec],
    prefix: &[String],
    issues: &mut Vec<ValidationIssue>,
) {
    for spec in fields {
        let mut path = prefix.to_vec();
        path.push(spec.name.to_string());
        match obj.get(spec.name) {
            None | Some(Value::Null) if !spec.required => {}
            None => issues.push(ValidationIssue::new(
                path,
                IssueCode::Required,
                format!("`{}` is required", spec.name),
            )),
            Some(value) => check_value(value, spec.kind, path, issues),
        }
    }
}

fn type_issue(path: Vec<String>, kind: FieldKind, value: &Value) -> ValidationIssue {
    let expected = expected_name(kind);
    let received = json_type_name(value);
    let message = format!("expected {expected}, received {received}");
    ValidationIssue::new(path, IssueCode::InvalidType { expected, received }, message)
}

fn check_value(value: &Value, kind: FieldKind, path: Vec<String>, issues: &mut Vec<ValidationIssue>) {
    match kind {
        FieldKind::String => {
            if !value.is_string() {
                issues.push(type_issue(path, kind, value));
            }
        }
        FieldKind::NonNegativeInteger | FieldKind::PositiveInteger => match value.as_u64() {
            Some(0) if matches!(kind, FieldKind::PositiveInteger) => issues.push(
                ValidationIssue::new(path, IssueCode::InvalidValue, "must be a positive integer"),
            ),
            Some(n) if matches!(kind, FieldKind::PositiveInteger) && n > u64::from(u32::MAX) => {
                issues.push(ValidationIssue::new(
                    path,
                    IssueCode::InvalidValue,
                    format!("must be at most {}", u32::MAX),
                ))
            }
            Some(_) => {}
            None if value.is_number() && value.as_i64().is_some() => issues.push(
                ValidationIssue::new(path, IssueCode::InvalidValue, "must not be negative"),
            ),
            None => issues.push(type_issue(path, kind, value)),
        },
        FieldKind::Object => {
            if !value.is_object() {
                issues.push(type_issue(path, kind, value));
            }
        }
        FieldKind::StringArray => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        let mut item_path = path.clone();
                        item_path.push(i.to_string());
                        issues.push(type_issue(item_path, FieldKind::String, item));
                    }
                }
            }
            None => issues.push(type_issue(path, kind, value)),
        },
        FieldKind::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            Some(s) => issues.push(ValidationIssue::new(
                path,
                IssueCode::InvalidValue,
                format!("`{s}` is not one of {}", allowed.join(", ")),
            )),
            None => issues.push(type_issue(path, kind, value)),
        },
        FieldKind::Timestamp => match value.as_str() {
            Some(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {}
            Some(_) => issues.push(ValidationIssue::new(
                path,
                IssueCode::InvalidValue,
                "expected an RFC 3339 timestamp",
            )),
            None => issues.push(type_issue(path, kind, value)),
        },
        FieldKind::Subagent => match value.as_object() {
            Some(obj) => check_fields(obj, SUBAGENT_FIELDS, &path, issues),
            None => issues.push(type_issue(path, kind, value)),
        },
        FieldKind::SubagentArray => match value.as_array() {
            Some(items) if items.is_empty() => issues.push(ValidationIssue::new(
                path,
                IssueCode::InvalidValue,
                "at least one subagent is required",
            )),
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let mut item_path = path.clone();
                    item_path.push(i.to_string());
                    check_value(item, FieldKind::Subagent, item_path, issues);
                }
            }
            None => issues.push(type_issue(path, kind, value)),
        },
    }
}

/// Validate a canonical command value and convert it into the typed union.
pub fn validate(value: &Value) -> Result<Command, Vec<ValidationIssue>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![ValidationIssue::new(
            Vec::new(),
            IssueCode::InvalidType {
                expected: "object",
                received: json_type_name(value),
            },
            "command must be a JSON object",
        )]);
    };

    let tag = match obj.get("type") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(other) => {
            return Err(vec![type_issue(vec!["type".into()], FieldKind::String, other)]);
        }
        None => {
            return Err(vec![ValidationIssue::new(
                vec!["type".into()],
                IssueCode::Required,
                "`type` is required",
            )]);
        }
    };

    let Some(fields) = variant_fields(tag) else {
        return Err(vec![ValidationIssue::new(
            vec!["type".into()],
            IssueCode::UnknownType,
            format!("unknown command type `{tag}`"),
        )]);
    };

    let mut issues = Vec::new();
    check_fields(obj, fields, &[], &mut issues);

    if tag == "sleep"
        && ["wakeAt", "delaySeconds", "cron"]
            .iter()
            .all(|k| obj.get(*k).is_none_or(Value::is_null))
    {
        issues.push(ValidationIssue::new(
            Vec::new(),
            IssueCode::Required,
            "sleep requires one of `wakeAt`, `delaySeconds` or `cron`",
        ));
    }
    if tag == "sleep"
        && let Some(Value::String(expr)) = obj.get("cron")
        && parse_cron(expr).is_err()
    {
        issues.push(ValidationIssue::new(
            vec!["cron".into()],
            IssueCode::InvalidValue,
            format!("`{expr}` is not a valid cron expression"),
        ));
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    let mut present = obj.clone();
    present.retain(|_, v| !v.is_null());
    serde_json::from_value::<Command>(Value::Object(present)).map_err(|e| {
        vec![ValidationIssue::new(
            Vec::new(),
            IssueCode::InvalidValue,
            e.to_string(),
        )]
    })
}
