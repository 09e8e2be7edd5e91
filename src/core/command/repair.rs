//! Error-driven second pass over a command that failed validation.
//!
//! Each fix is narrow and keyed off a specific validation issue. When nothing
//! applies the caller gets `None` and must treat the command as malformed.

use serde_json::{Map, Value};

use super::{IssueCode, ValidationIssue};

#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub value: Value,
    pub applied: Vec<&'static str>,
}

fn pointer(path: &[String]) -> String {
    path.iter()
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn tag_of(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Move `from` to `to` in `obj` when `from` holds a string and `to` is absent.
fn rename_string_field(obj: &mut Map<String, Value>, from: &str, to: &str) -> bool {
    if obj.contains_key(to) || !obj.get(from).is_some_and(Value::is_string) {
        return false;
    }
    match obj.remove(from) {
        Some(v) => {
            obj.insert(to.to_string(), v);
            true
        }
        None => false,
    }
}

fn record(name: &'static str, applied: &mut Vec<&'static str>) {
    if !applied.contains(&name) {
        applied.push(name);
    }
}

fn parse_positive_integer(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return u32::try_from(n).ok().filter(|n| *n > 0);
    }
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f > 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

/// Attempt targeted fixes for `issues` on `raw`.
pub fn repair(raw: &Value, issues: &[ValidationIssue]) -> Option<Repaired> {
    let mut value = raw.clone();
    let mut applied: Vec<&'static str> = Vec::new();

    let tag = tag_of(raw).map(str::to_owned);

    for issue in issues {
        let field = issue.field();
        match (&issue.code, tag.as_deref(), field) {
            (IssueCode::Required, Some("send_message"), Some("message")) => {
                if let Some(obj) = value.as_object_mut()
                    && rename_string_field(obj, "content", "message")
                {
                    record("content→message", &mut applied);
                }
            }
            (IssueCode::Required, Some("note"), Some("content")) => {
                if let Some(obj) = value.as_object_mut()
                    && rename_string_field(obj, "text", "content")
                {
                    record("text→content", &mut applied);
                }
            }
            (
                IssueCode::InvalidType {
                    received: "string", ..
                },
                Some("tool_call"),
                Some("args"),
            ) if issue.path.len() == 1 => {
                let parsed = value
                    .get("args")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_str::<Value>(s).ok());
                if let Some(args @ Value::Object(_)) = parsed
                    && let Some(obj) = value.as_object_mut()
                {
                    obj.insert("args".into(), args);
                    record("args:string→object", &mut applied);
                }
            }
            (
                IssueCode::InvalidType {
                    expected: "array",
                    received: "string",
                },
                Some("send_message"),
                Some("fileIds"),
            ) => {
                if let Some(obj) = value.as_object_mut()
                    && let Some(Value::String(id)) = obj.remove("fileIds")
                {
                    obj.insert("fileIds".into(), Value::Array(vec![Value::String(id)]));
                    record("fileIds:string→array", &mut applied);
                }
            }
            (
                IssueCode::InvalidType {
                    expected: "string",
                    received: "number" | "boolean",
                },
                _,
                Some(_),
            ) => {
                if let Some(slot) = value.pointer_mut(&pointer(&issue.path)) {
                    let coerced = match slot {
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    };
                    if let Some(s) = coerced {
                        *slot = Value::String(s);
                        record("scalar→string", &mut applied);
                    }
                }
            }
            (
                IssueCode::InvalidType {
                    expected: "integer",
                    received: "string",
                },
                _,
                Some("maxIterations"),
            ) => {
                if let Some(slot) = value.pointer_mut(&pointer(&issue.path))
                    && let Some(n) = slot.as_str().and_then(parse_positive_integer)
                {
                    *slot = Value::from(n);
                    record("maxIterations:string→integer", &mut applied);
                }
            }
            _ => {}
        }
    }

    // `file_ids` is outside the schema so it never shows up as an issue path;
    // fix it alongside any other send_message repair.
    if tag.as_deref() == Some("send_message")
        && !issues.is_empty()
        && let Some(obj) = value.as_object_mut()
        && !obj.contains_key("fileIds")
        && let Some(ids) = obj.remove("file_ids")
    {
        let ids = match ids {
            Value::String(s) => Value::Array(vec![Value::String(s)]),
            other => other,
        };
        obj.insert("fileIds".into(), ids);
        record("file_ids→fileIds", &mut applied);
    }

    if applied.is_empty() {
        None
    } else {
        Some(Repaired { value, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::super::validate;
    use super::*;
    use serde_json::json;

    fn repair_raw(raw: Value) -> Option<Repaired> {
        let issues = validate(&raw).unwrap_err();
        repair(&raw, &issues)
    }

    #[test]
    fn content_becomes_message() {
        for text in ["hello", "", "multi\nline"] {
            let out = repair_raw(json!({"type": "send_message", "content": text})).unwrap();
            assert_eq!(out.value, json!({"type": "send_message", "message": text}));
            assert!(out.applied.contains(&"content→message"));
        }
    }

    #[test]
    fn stringified_args_become_object() {
        let objects = [json!({}), json!({"q": "rust", "limit": 3}), json!({"nested": {"a": [1]}})];
        for o in objects {
            let raw = json!({"type": "tool_call", "name": "web.search", "args": o.to_string()});
            let out = repair_raw(raw).unwrap();
            assert_eq!(out.value["args"], o);
        }
    }

    #[test]
    fn stringified_non_object_args_are_not_repaired() {
        assert!(repair_raw(json!({"type": "tool_call", "name": "a.b", "args": "[1,2]"})).is_none());
        assert!(repair_raw(json!({"type": "tool_call", "name": "a.b", "args": "{oops"})).is_none());
    }

    #[test]
    fn note_text_becomes_content() {
        let out = repair_raw(json!({"type": "note", "category": "fact", "text": "t"})).unwrap();
        assert_eq!(out.value["content"], "t");
        assert_eq!(out.applied, vec!["text→content"]);
    }

    #[test]
    fn scalars_coerced_to_strings() {
        let out = repair_raw(json!({"type": "note", "category": 7, "content": true})).unwrap();
        assert_eq!(out.value["category"], "7");
        assert_eq!(out.value["content"], "true");

        let nested = repair_raw(json!({"type": "spawn_subagent", "subagent": {"input": 42}})).unwrap();
        assert_eq!(nested.value["subagent"]["input"], "42");
    }

    #[test]
    fn max_iterations_string_coercion() {
        let out = repair_raw(json!({"type": "set_run_limits", "maxIterations": "40"})).unwrap();
        assert_eq!(out.value["maxIterations"], 40);
        let out = repair_raw(json!({"type": "set_run_limits", "maxIterations": " 12.0 "})).unwrap();
        assert_eq!(out.value["maxIterations"], 12);
        let out = repair_raw(json!({"type": "set_run_limits", "maxIterations": "4294967295"})).unwrap();
        assert_eq!(out.value["maxIterations"], u32::MAX);

        for bad in ["0", "-3", "1.5", "NaN", "inf", "lots", "4294967296", "5e9"] {
            assert!(
                repair_raw(json!({"type": "set_run_limits", "maxIterations": bad})).is_none(),
                "{bad} should not be repaired"
            );
        }
    }

    #[test]
    fn file_ids_renamed_with_other_repairs() {
        let out = repair_raw(json!({"type": "send_message", "content": "c", "file_ids": "f"})).unwrap();
        assert_eq!(out.value["fileIds"], json!(["f"]));
        assert_eq!(out.applied, vec!["content→message", "file_ids→fileIds"]);
    }

    #[test]
    fn nothing_matched_returns_none() {
        assert!(repair_raw(json!({"type": "sleep"})).is_none());
        assert!(repair_raw(json!({"type": "unknown"})).is_none());
    }
}
