use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Build a **tokio** `Command` for `program args..` with its address space
    /// capped at `memory_limit_mb` where the OS supports it. `0` means no cap.
    fn memory_limited_command(
        program: &str,
        args: &[String],
        memory_limit_mb: u64,
    ) -> tokio::process::Command;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Default `PATH` value for sandboxed tool execution.
    fn sandboxed_path() -> String;

    /// Root data directory.
    /// Unix: `~/.runcore`, Windows: `%APPDATA%\runcore`.
    fn data_dir() -> PathBuf;
}

/// `RUNCORE_DATA_DIR` overrides the platform default.
fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("RUNCORE_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
