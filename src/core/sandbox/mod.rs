//! Isolated execution of untrusted tool handlers.
//!
//! Every call gets a fresh, single-use worker (an OS process or a wasmtime
//! instance). The parent enforces the wall-clock limit itself and always
//! resolves to a [`SandboxResult`]; nothing here returns an error to the
//! caller.

pub mod process;
pub mod wasm;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use self::process::ProcessBackend;
use self::wasm::WasmBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Allow,
    #[default]
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// `0` disables the ceiling.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default, rename = "network")]
    pub network_policy: NetworkPolicy,
    #[serde(default)]
    pub allow_file_system: bool,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_memory_limit_mb() -> u64 {
    256
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            network_policy: NetworkPolicy::default(),
            allow_file_system: false,
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Per-tool overrides on top of the daemon-wide sandbox defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOverrides {
    pub timeout_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub network: Option<NetworkPolicy>,
    pub allow_file_system: Option<bool>,
    pub max_output_bytes: Option<usize>,
}

impl SandboxConfig {
    pub fn with_overrides(&self, o: &SandboxOverrides) -> Self {
        Self {
            timeout_ms: o.timeout_ms.unwrap_or(self.timeout_ms),
            memory_limit_mb: o.memory_limit_mb.unwrap_or(self.memory_limit_mb),
            network_policy: o.network.unwrap_or(self.network_policy),
            allow_file_system: o.allow_file_system.unwrap_or(self.allow_file_system),
            max_output_bytes: o.max_output_bytes.unwrap_or(self.max_output_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxHandler {
    /// A program that reads the JSON envelope on stdin and answers on stdout.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A WASI preview-1 module reporting through `env.host_set_result`.
    Wasm { module: PathBuf },
}

/// The serializable slice of run state a worker is allowed to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub tenant_id: String,
    pub agent_id: String,
    pub run_id: String,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub tool_name: String,
    pub tool_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl SandboxResult {
    pub fn ok(result: Value, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            elapsed_ms,
            timed_out: false,
        }
    }

    pub fn failure(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            elapsed_ms,
            timed_out: false,
        }
    }

    pub fn timeout(timeout_ms: u64, elapsed_ms: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(format!("sandbox timed out after {timeout_ms}ms"), elapsed_ms)
        }
    }
}

/// Input written across the isolation boundary.
#[derive(Debug, Serialize)]
pub(crate) struct Envelope<'a> {
    pub context: &'a SandboxContext,
    pub args: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Turn a worker's reply bytes into a result. Replies are the JSON object
/// `{success, result | error}`; any other output from a worker that exited
/// cleanly is taken as a plain string result.
pub(crate) fn interpret_reply(bytes: &[u8], exited_ok: bool, elapsed_ms: u64) -> SandboxResult {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if let Ok(reply) = serde_json::from_str::<WorkerReply>(trimmed) {
        return if reply.success {
            SandboxResult::ok(reply.result.unwrap_or(Value::Null), elapsed_ms)
        } else {
            SandboxResult::failure(
                reply
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
                elapsed_ms,
            )
        };
    }
    if exited_ok {
        SandboxResult::ok(Value::String(trimmed.to_string()), elapsed_ms)
    } else {
        SandboxResult::failure("worker exited without a reply", elapsed_ms)
    }
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(
        &self,
        handler: &SandboxHandler,
        context: &SandboxContext,
        args: &Map<String, Value>,
        config: &SandboxConfig,
    ) -> SandboxResult;
}

/// Dispatches to the process or wasm backend by handler kind.
#[derive(Default)]
pub struct IsolatedExecutor {
    process: ProcessBackend,
    wasm: WasmBackend,
}

impl IsolatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxExecutor for IsolatedExecutor {
    async fn execute(
        &self,
        handler: &SandboxHandler,
        context: &SandboxContext,
        args: &Map<String, Value>,
        config: &SandboxConfig,
    ) -> SandboxResult {
        let result = match handler {
            SandboxHandler::Process { program, args: argv } => {
                self.process.run(program, argv, context, args, config).await
            }
            SandboxHandler::Wasm { module } => self.wasm.run(module, context, args, config).await,
        };
        if result.success {
            info!(
                "Sandbox [{}] {} ok in {}ms",
                context.run_id, context.tool_name, result.elapsed_ms
            );
        } else {
            warn!(
                "Sandbox [{}] {} failed in {}ms: {}",
                context.run_id,
                context.tool_name,
                result.elapsed_ms,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }
}
