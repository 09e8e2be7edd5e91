use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, info};
use wasmtime::*;
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use super::{Envelope, SandboxConfig, SandboxContext, SandboxResult, interpret_reply};

/// Slack on top of the epoch deadline before the host stops waiting for the
/// blocking task.
const JOIN_GRACE: Duration = Duration::from_secs(2);

struct HostState {
    wasi: WasiP1Ctx,
    reply: Option<Vec<u8>>,
    reply_limit: usize,
    limiter: StoreLimits,
}

enum Finish {
    Exited(i32),
    Interrupted,
    Trapped(String),
}

/// Runs a WASI preview-1 module. The envelope arrives as `argv[1]`; the
/// guest answers by calling `env.host_set_result(ptr, len)` with the reply
/// JSON.
#[derive(Debug, Default)]
pub struct WasmBackend;

impl WasmBackend {
    pub async fn run(
        &self,
        module: &Path,
        context: &SandboxContext,
        args: &Map<String, Value>,
        config: &SandboxConfig,
    ) -> SandboxResult {
        let started = Instant::now();
        let elapsed = move || started.elapsed().as_millis() as u64;

        if !module.exists() {
            return SandboxResult::failure(format!("wasm module not found at {module:?}"), elapsed());
        }
        let envelope = match serde_json::to_string(&Envelope { context, args }) {
            Ok(s) => s,
            Err(e) => return SandboxResult::failure(format!("failed to encode input: {e}"), elapsed()),
        };

        // Each call gets its own engine so that bumping the epoch only ever
        // interrupts this instance.
        let mut engine_config = Config::new();
        engine_config.epoch_interruption(true);
        let engine = match Engine::new(&engine_config) {
            Ok(engine) => engine,
            Err(e) => return SandboxResult::failure(format!("wasm engine: {e}"), elapsed()),
        };

        info!(
            "WASM Sandbox [{}] {} (mem_limit: {}MB, timeout: {}ms)",
            context.run_id, context.tool_name, config.memory_limit_mb, config.timeout_ms
        );

        let ticker = engine.clone();
        let timeout = Duration::from_millis(config.timeout_ms);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ticker.increment_epoch();
        });

        let module = module.to_path_buf();
        let tool_name = context.tool_name.clone();
        let config_owned = config.clone();
        let job = tokio::task::spawn_blocking(move || {
            run_module(&engine, &module, &tool_name, &envelope, &config_owned)
        });

        let joined = tokio::time::timeout(timeout + JOIN_GRACE, job).await;
        deadline.abort();

        let (finish, reply) = match joined {
            Err(_) => return SandboxResult::timeout(config.timeout_ms, elapsed()),
            Ok(Err(e)) => return SandboxResult::failure(format!("wasm task panicked: {e}"), elapsed()),
            Ok(Ok(Err(e))) => return SandboxResult::failure(format!("wasm setup failed: {e}"), elapsed()),
            Ok(Ok(Ok(parts))) => parts,
        };
        debug!(
            "WASM Sandbox [{}] finished, reply={} bytes",
            context.run_id,
            reply.as_ref().map_or(0, Vec::len)
        );

        match (finish, reply) {
            (Finish::Interrupted, _) => SandboxResult::timeout(config.timeout_ms, elapsed()),
            (_, Some(bytes)) if bytes.len() > config.max_output_bytes => SandboxResult::failure(
                format!("tool output exceeded {} bytes", config.max_output_bytes),
                elapsed(),
            ),
            (Finish::Exited(code), Some(bytes)) => interpret_reply(&bytes, code == 0, elapsed()),
            (Finish::Exited(0), None) => SandboxResult::failure("wasm tool produced no result", elapsed()),
            (Finish::Exited(code), None) => {
                SandboxResult::failure(format!("wasm tool exited with code {code}"), elapsed())
            }
            (Finish::Trapped(msg), _) => {
                SandboxResult::failure(format!("wasm tool trapped: {msg}"), elapsed())
            }
        }
    }
}

fn run_module(
    engine: &Engine,
    module_path: &Path,
    tool_name: &str,
    envelope: &str,
    config: &SandboxConfig,
) -> Result<(Finish, Option<Vec<u8>>)> {
    let mut wasi_builder = WasiCtxBuilder::new();
    wasi_builder.args(&[tool_name, envelope]);
    wasi_builder.env("RUNCORE_SANDBOX", "1");
    wasi_builder.inherit_stderr();

    let scratch = if config.allow_file_system {
        let dir = std::env::temp_dir().join(format!("runcore-wasm-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        wasi_builder.preopened_dir(&dir, "/scratch", DirPerms::all(), FilePerms::all())?;
        Some(dir)
    } else {
        None
    };

    let mut limits_builder = StoreLimitsBuilder::new();
    if config.memory_limit_mb > 0 {
        limits_builder = limits_builder.memory_size(config.memory_limit_mb as usize * 1024 * 1024);
    }

    let state = HostState {
        wasi: wasi_builder.build_p1(),
        reply: None,
        reply_limit: config.max_output_bytes.saturating_add(1),
        limiter: limits_builder.build(),
    };

    let mut linker: Linker<HostState> = Linker::new(engine);
    p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)?;
    linker.func_wrap(
        "env",
        "host_set_result",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(mem) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
                return 1;
            };
            let limit = caller.data().reply_limit;
            let start = ptr as usize;
            let end = start.saturating_add((len as usize).min(limit));
            let Some(bytes) = mem.data(&caller).get(start..end).map(<[u8]>::to_vec) else {
                return 1;
            };
            caller.data_mut().reply = Some(bytes);
            0
        },
    )?;

    let module = Module::from_file(engine, module_path)?;
    let mut store = Store::new(engine, state);
    store.limiter(|state| &mut state.limiter);
    store.set_epoch_deadline(1);

    let instance = linker.instantiate(&mut store, &module)?;
    let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
    let finish = match start.call(&mut store, ()) {
        Ok(()) => Finish::Exited(0),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Finish::Exited(exit.0)
            } else if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                Finish::Interrupted
            } else {
                Finish::Trapped(e.to_string())
            }
        }
    };

    if let Some(dir) = scratch {
        let _ = std::fs::remove_dir_all(dir);
    }
    let reply = store.into_data().reply;
    Ok((finish, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_module_is_a_failure() {
        let ctx = SandboxContext {
            run_id: "r1".into(),
            tool_name: "demo.wasm".into(),
            ..SandboxContext::default()
        };
        let result = WasmBackend
            .run(
                Path::new("/nonexistent/tool.wasm"),
                &ctx,
                &Map::new(),
                &SandboxConfig::default(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn spinning_module_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spin.wat");
        std::fs::write(
            &path,
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "_start") (loop $l (br $l))))"#,
        )
        .unwrap();
        let ctx = SandboxContext {
            run_id: "r1".into(),
            tool_name: "demo.spin".into(),
            ..SandboxContext::default()
        };
        let config = SandboxConfig {
            timeout_ms: 200,
            ..SandboxConfig::default()
        };
        let result = WasmBackend.run(&path, &ctx, &Map::new(), &config).await;
        assert!(!result.success);
        assert!(result.timed_out, "{:?}", result.error);
    }

    #[tokio::test]
    async fn guest_reports_through_host_set_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reply.wat");
        let reply = r#"{"success":true,"result":42}"#;
        std::fs::write(
            &path,
            format!(
                r#"(module
                     (import "env" "host_set_result" (func $set (param i32 i32) (result i32)))
                     (memory (export "memory") 1)
                     (data (i32.const 16) "{}")
                     (func (export "_start") (drop (call $set (i32.const 16) (i32.const {})))))"#,
                reply.replace('"', "\\\""),
                reply.len()
            ),
        )
        .unwrap();
        let ctx = SandboxContext {
            run_id: "r1".into(),
            tool_name: "demo.reply".into(),
            ..SandboxContext::default()
        };
        let result = WasmBackend
            .run(&path, &ctx, &Map::new(), &SandboxConfig::default())
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(serde_json::json!(42)));
    }
}
