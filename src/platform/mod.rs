use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Name of the OpenSSH client binary.
    fn ssh_binary() -> &'static str;

    /// Build a **tokio** `Command` for the OpenSSH client.
    fn ssh_command() -> tokio::process::Command {
        tokio::process::Command::new(Self::ssh_binary())
    }

    /// Whether the OpenSSH client on this platform supports connection multiplexing.
    fn supports_control_master() -> bool;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory.
    /// Unix: `~/.remote-pull-runner`, Windows: `%APPDATA%\remote-pull-runner`.
    fn data_dir() -> PathBuf;
}

pub const DATA_DIR_ENV: &str = "RPR_DATA_DIR";

/// `RPR_DATA_DIR` wins over the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
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
