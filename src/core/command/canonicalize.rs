//! First-pass normalization of decoded model output.
//!
//! Works on the untyped JSON value before validation. Never fails: anything it
//! does not recognise is passed through for the validator to reject.

use serde_json::{Map, Value};

use super::COMMAND_TAGS;

const TYPE_ALIASES: &[(&str, &str)] = &[
    ("message", "send_message"),
    ("msg", "send_message"),
    ("send", "send_message"),
    ("tool", "tool_call"),
    ("call", "tool_call"),
    ("output", "set_output"),
    ("done", "finish"),
    ("end", "finish"),
    ("complete", "finish"),
    ("spawn", "spawn_subagent"),
    ("wait", "sleep"),
];

/// Returns true for `namespace.command` names: exactly one dot, both halves
/// non-empty, no whitespace.
pub fn is_tool_command_name(name: &str) -> bool {
    if name.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = name.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ns), Some(cmd), None) => !ns.is_empty() && !cmd.is_empty(),
        _ => false,
    }
}

fn alias_for(tag: &str) -> Option<&'static str> {
    TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == tag)
        .map(|(_, canonical)| *canonical)
}

fn is_known_tag(tag: &str) -> bool {
    COMMAND_TAGS.contains(&tag) || alias_for(tag).is_some()
}

pub fn canonicalize(raw: &Value) -> Value {
    let Some(obj) = raw.as_object() else {
        return raw.clone();
    };
    let mut obj = obj.clone();

    rewrite_tool_shapes(&mut obj);

    if let Some(canonical) = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(alias_for)
    {
        obj.insert("type".into(), Value::String(canonical.to_string()));
    }

    fold_tool_args(&mut obj);

    if obj.get("type").and_then(Value::as_str) == Some("send_message") {
        rename_content_to_message(&mut obj);
        normalize_file_ids(&mut obj);
    }

    collapse_done_output(obj)
}

/// `{type:"web.search", ...}` and `{name:"web.search"}` become tool calls.
fn rewrite_tool_shapes(obj: &mut Map<String, Value>) {
    match obj.get("type") {
        Some(Value::String(tag)) if !is_known_tag(tag) && is_tool_command_name(tag) => {
            let name = tag.clone();
            obj.remove("type");
            let args = match obj.remove("args") {
                Some(args) => args,
                None => Value::Object(std::mem::take(obj)),
            };
            obj.clear();
            obj.insert("type".into(), Value::String("tool_call".into()));
            obj.insert("name".into(), Value::String(name));
            obj.insert("args".into(), args);
        }
        None => {
            let Some(name) = obj.get("name").and_then(Value::as_str) else {
                return;
            };
            if !is_tool_command_name(name) {
                return;
            }
            let name = name.to_string();
            let args = obj
                .remove("args")
                .unwrap_or_else(|| Value::Object(Map::new()));
            obj.clear();
            obj.insert("type".into(), Value::String("tool_call".into()));
            obj.insert("name".into(), Value::String(name));
            obj.insert("args".into(), args);
        }
        _ => {}
    }
}

/// A `tool_call` with a name but no `args` carries its arguments inline.
fn fold_tool_args(obj: &mut Map<String, Value>) {
    if obj.get("type").and_then(Value::as_str) != Some("tool_call")
        || !obj.contains_key("name")
        || obj.contains_key("args")
    {
        return;
    }
    let inline: Vec<String> = obj
        .keys()
        .filter(|k| !matches!(k.as_str(), "type" | "name" | "args"))
        .cloned()
        .collect();
    let mut args = Map::new();
    for key in inline {
        if let Some(value) = obj.remove(&key) {
            args.insert(key, value);
        }
    }
    obj.insert("args".into(), Value::Object(args));
}

fn rename_content_to_message(obj: &mut Map<String, Value>) {
    if obj.contains_key("message") {
        return;
    }
    if let Some(Value::String(_)) = obj.get("content")
        && let Some(content) = obj.remove("content")
    {
        obj.insert("message".into(), content);
    }
}

fn normalize_file_ids(obj: &mut Map<String, Value>) {
    if obj.contains_key("fileIds") {
        return;
    }
    for key in ["file_ids", "file_id"] {
        let Some(value) = obj.get(key) else {
            continue;
        };
        let ids = match value {
            Value::Array(items) => Value::Array(items.clone()),
            Value::String(s) => Value::Array(vec![Value::String(s.clone())]),
            _ => continue,
        };
        obj.remove(key);
        obj.insert("fileIds".into(), ids);
        return;
    }
}

fn collapse_done_output(obj: Map<String, Value>) -> Value {
    let done = obj.get("done") == Some(&Value::Bool(true))
        || obj.get("finished") == Some(&Value::Bool(true));
    if !obj.contains_key("type") && done {
        if let Some(Value::String(output)) = obj.get("output") {
            let mut finish = Map::new();
            finish.insert("type".into(), Value::String("finish".into()));
            finish.insert("output".into(), Value::String(output.clone()));
            return Value::Object(finish);
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_type_becomes_tool_call_with_rest_as_args() {
        let out = canonicalize(&json!({"type": "web.search", "query": "x"}));
        assert_eq!(
            out,
            json!({"type": "tool_call", "name": "web.search", "args": {"query": "x"}})
        );
    }

    #[test]
    fn dotted_type_prefers_explicit_args() {
        let out = canonicalize(&json!({"type": "memory.put", "args": {"k": 1}, "noise": true}));
        assert_eq!(
            out,
            json!({"type": "tool_call", "name": "memory.put", "args": {"k": 1}})
        );
    }

    #[test]
    fn bare_name_becomes_tool_call() {
        let out = canonicalize(&json!({"name": "fs.read"}));
        assert_eq!(out, json!({"type": "tool_call", "name": "fs.read", "args": {}}));

        let untouched = canonicalize(&json!({"name": "plain"}));
        assert_eq!(untouched, json!({"name": "plain"}));
    }

    #[test]
    fn tool_call_without_args_folds_extra_keys() {
        let out = canonicalize(&json!({"type": "tool_call", "name": "web.fetch", "url": "u"}));
        assert_eq!(
            out,
            json!({"type": "tool_call", "name": "web.fetch", "args": {"url": "u"}})
        );
    }

    #[test]
    fn aliases_are_applied() {
        assert_eq!(canonicalize(&json!({"type": "msg", "message": "hi"}))["type"], "send_message");
        assert_eq!(canonicalize(&json!({"type": "done"}))["type"], "finish");
        assert_eq!(canonicalize(&json!({"type": "wait", "delaySeconds": 5}))["type"], "sleep");
        assert_eq!(canonicalize(&json!({"type": "spawn"}))["type"], "spawn_subagent");
        assert_eq!(canonicalize(&json!({"type": "output", "output": "o"}))["type"], "set_output");
    }

    #[test]
    fn aliased_tool_folds_args() {
        let out = canonicalize(&json!({"type": "call", "name": "web.search", "q": "rust"}));
        assert_eq!(
            out,
            json!({"type": "tool_call", "name": "web.search", "args": {"q": "rust"}})
        );
    }

    #[test]
    fn send_message_content_and_file_ids() {
        let out = canonicalize(&json!({"type": "send", "content": "hello", "file_id": "f1"}));
        assert_eq!(
            out,
            json!({"type": "send_message", "message": "hello", "fileIds": ["f1"]})
        );

        let kept = canonicalize(&json!({
            "type": "send_message", "message": "m", "fileIds": ["a"], "file_ids": ["b"]
        }));
        assert_eq!(kept["fileIds"], json!(["a"]));
    }

    #[test]
    fn done_flag_collapses_to_finish() {
        assert_eq!(
            canonicalize(&json!({"output": "done", "done": true})),
            json!({"type": "finish", "output": "done"})
        );
        assert_eq!(
            canonicalize(&json!({"output": "x", "finished": true, "extra": 1})),
            json!({"type": "finish", "output": "x"})
        );
        let not_done = json!({"output": "x", "done": false});
        assert_eq!(canonicalize(&not_done), not_done);
    }

    #[test]
    fn canonical_shapes_are_fixed_points() {
        let samples = [
            json!({"type": "tool_call", "name": "web.search", "args": {"q": "x"}}),
            json!({"type": "send_message", "message": "hi", "fileIds": ["a"]}),
            json!({"type": "set_output", "output": "o", "mode": "append"}),
            json!({"type": "finish", "output": "done", "mode": "replace"}),
            json!({"type": "decision", "content": "c", "importance": "high"}),
            json!({"type": "note", "category": "c", "content": "n"}),
            json!({"type": "set_run_limits", "maxIterations": 10}),
            json!({"type": "recover", "reason": "r", "action": "retry"}),
            json!({"type": "spawn_subagent", "subagent": {"input": "do"}}),
            json!({"type": "spawn_subagents", "subagents": [{"input": "a"}]}),
            json!({"type": "sleep", "delaySeconds": 30}),
            json!({"type": "web.search", "query": "x"}),
            json!({"output": "done", "done": true}),
            json!("not an object"),
        ];
        for sample in samples {
            let once = canonicalize(&sample);
            assert_eq!(canonicalize(&once), once, "not idempotent for {sample}");
        }
    }

    #[test]
    fn tool_name_shape() {
        assert!(is_tool_command_name("web.search"));
        assert!(!is_tool_command_name("web."));
        assert!(!is_tool_command_name(".search"));
        assert!(!is_tool_command_name("a.b.c"));
        assert!(!is_tool_command_name("web search.x"));
        assert!(!is_tool_command_name("send_message"));
    }
}
