//! Reference guest for the runcore WASM sandbox.
//!
//! Compiles to `wasm32-wasip1`. The host passes the tool name as `argv[0]`
//! and the JSON envelope `{"context": {...}, "args": {...}}` as `argv[1]`,
//! and expects exactly one call to `env.host_set_result` with the reply.

use std::env;

use serde_json::{Value, json};

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "env")]
unsafe extern "C" {
    /// Hand the reply JSON to the host. Returns 0 when accepted.
    fn host_set_result(ptr: *const u8, len: u32) -> u32;
}

#[cfg(target_arch = "wasm32")]
fn set_result(reply: &Value) {
    let bytes = reply.to_string();
    // SAFETY: the host only reads `len` bytes starting at `ptr` before returning.
    let status = unsafe { host_set_result(bytes.as_ptr(), bytes.len() as u32) };
    if status != 0 {
        eprintln!("host rejected the reply ({status})");
        std::process::exit(2);
    }
}

/// Native builds print the reply to stdout.
#[cfg(not(target_arch = "wasm32"))]
fn set_result(reply: &Value) {
    println!("{reply}");
}

fn text_arg(args: &Value) -> Result<&str, String> {
    args.get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string argument `text`".to_string())
}

fn text_stats(args: &Value) -> Result<Value, String> {
    let text = text_arg(args)?;
    Ok(json!({
        "chars": text.chars().count(),
        "words": text.split_whitespace().count(),
        "lines": text.lines().count(),
    }))
}

fn text_upper(args: &Value) -> Result<Value, String> {
    Ok(Value::String(text_arg(args)?.to_uppercase()))
}

fn dispatch(tool: &str, args: &Value) -> Result<Value, String> {
    match tool {
        "text.stats" => text_stats(args),
        "text.upper" => text_upper(args),
        other => Err(format!("this guest does not implement `{other}`")),
    }
}

fn main() {
    let argv: Vec<String> = env::args().collect();
    let Some(raw) = argv.get(1) else {
        eprintln!("Usage: sandbox_guest <envelope-json>");
        std::process::exit(1);
    };

    let envelope: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            set_result(&json!({ "success": false, "error": format!("bad envelope: {e}") }));
            return;
        }
    };
    let tool = envelope["context"]["toolName"]
        .as_str()
        .or_else(|| argv.first().map(String::as_str))
        .unwrap_or_default();

    let reply = match dispatch(tool, &envelope["args"]) {
        Ok(result) => json!({ "success": true, "result": result }),
        Err(error) => json!({ "success": false, "error": error }),
    };
    set_result(&reply);
}
