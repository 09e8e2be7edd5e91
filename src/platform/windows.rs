use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }

    fn memory_limited_command(
        program: &str,
        args: &[String],
        _memory_limit_mb: u64,
    ) -> tokio::process::Command {
        // No ulimit equivalent without job objects; the wall-clock timeout
        // still applies.
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd
    }

    fn restrict_dir_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn restrict_file_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn sandboxed_path() -> String {
        std::env::var("SystemRoot")
            .map(|root| format!("{root}\\System32;{root}"))
            .unwrap_or_default()
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("runcore"),
        )
    }
}
