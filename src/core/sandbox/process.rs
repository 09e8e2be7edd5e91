use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{Envelope, NetworkPolicy, SandboxConfig, SandboxContext, SandboxResult, interpret_reply};
use crate::platform::{NativePlatform, Platform};

/// Proxy target nothing listens on; well-behaved HTTP clients fail fast.
const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";
const STDERR_TAIL_BYTES: usize = 4096;

/// Runs a handler as a fresh child process: JSON envelope on stdin, one JSON
/// reply on stdout.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub async fn run(
        &self,
        program: &str,
        argv: &[String],
        context: &SandboxContext,
        args: &Map<String, Value>,
        config: &SandboxConfig,
    ) -> SandboxResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let envelope = match serde_json::to_vec(&Envelope { context, args }) {
            Ok(bytes) => bytes,
            Err(e) => return SandboxResult::failure(format!("failed to encode input: {e}"), elapsed()),
        };

        let scratch = match ScratchDir::create() {
            Ok(dir) => dir,
            Err(e) => {
                return SandboxResult::failure(format!("failed to prepare scratch dir: {e}"), elapsed());
            }
        };

        let mut cmd = NativePlatform::memory_limited_command(program, argv, config.memory_limit_mb);
        cmd.env_clear();
        cmd.env("PATH", NativePlatform::sandboxed_path());
        cmd.env("RUNCORE_SANDBOX", "1");
        cmd.env("RUNCORE_TOOL", &context.tool_name);
        cmd.current_dir(scratch.path());
        if config.allow_file_system {
            cmd.env("HOME", scratch.path());
            cmd.env("TMPDIR", scratch.path());
        }
        if config.network_policy == NetworkPolicy::Deny {
            for key in [
                "HTTP_PROXY",
                "HTTPS_PROXY",
                "ALL_PROXY",
                "http_proxy",
                "https_proxy",
                "all_proxy",
            ] {
                cmd.env(key, BLACKHOLE_PROXY);
            }
            cmd.env("RUNCORE_NETWORK", "deny");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return SandboxResult::failure(format!("failed to spawn {program}: {e}"), elapsed());
            }
        };
        debug!(
            "Sandbox [{}] spawned {} for {}",
            context.run_id, program, context.tool_name
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits without reading its input is not an error here.
            let _ = stdin.write_all(&envelope).await;
            drop(stdin);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = config.max_output_bytes;
        let collect = async {
            let (out, err, status) = tokio::join!(
                read_bounded(stdout, limit.saturating_add(1)),
                read_bounded(stderr, STDERR_TAIL_BYTES),
                child.wait()
            );
            (out, err, status)
        };

        let outcome = tokio::time::timeout(Duration::from_millis(config.timeout_ms), collect).await;
        let (out, err, status) = match outcome {
            Ok(parts) => parts,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return SandboxResult::timeout(config.timeout_ms, elapsed());
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => return SandboxResult::failure(format!("failed to wait for worker: {e}"), elapsed()),
        };
        if out.len() > limit {
            return SandboxResult::failure(
                format!("tool output exceeded {limit} bytes"),
                elapsed(),
            );
        }

        let result = interpret_reply(&out, status.success(), elapsed());
        if !status.success() && !result.success {
            let tail = String::from_utf8_lossy(&err);
            let tail = tail.trim();
            if !tail.is_empty() {
                warn!("Sandbox [{}] {} stderr: {}", context.run_id, context.tool_name, tail);
            }
            if result.error.as_deref() == Some("worker exited without a reply") {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let detail = if tail.is_empty() {
                    format!("worker exited with {code}")
                } else {
                    format!("worker exited with {code}: {tail}")
                };
                return SandboxResult::failure(detail, result.elapsed_ms);
            }
        }
        result
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        let _ = reader.take(limit as u64).read_to_end(&mut buf).await;
    }
    buf
}

/// A per-call working directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create() -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("runcore-sbx-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        NativePlatform::restrict_dir_permissions(&path);
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
