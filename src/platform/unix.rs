use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }

    fn memory_limited_command(
        program: &str,
        args: &[String],
        memory_limit_mb: u64,
    ) -> tokio::process::Command {
        if memory_limit_mb == 0 {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args);
            return cmd;
        }
        // `ulimit -v` takes KiB. The program and its args are passed
        // positionally so nothing is re-parsed by the shell.
        let mut cmd = Self::shell_inline(&format!(
            "ulimit -v {} && exec \"$0\" \"$@\"",
            memory_limit_mb.saturating_mul(1024)
        ));
        cmd.arg(program).args(args);
        cmd
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn sandboxed_path() -> String {
        "/usr/local/bin:/usr/bin:/bin".to_string()
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".runcore"),
        )
    }
}
