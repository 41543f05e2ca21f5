//! Platform helpers for locating external tools.

use std::path::PathBuf;

/// Checks if the current platform is Windows.
#[must_use]
pub const fn is_windows() -> bool {
    cfg!(windows)
}

/// Name of the Git executable for this platform.
#[must_use]
pub const fn get_git_command() -> &'static str {
    if is_windows() { "git.exe" } else { "git" }
}

/// Full path of an executable found on `PATH`, if any.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Whether an executable is available on `PATH`.
pub fn command_exists(name: &str) -> bool {
    find_executable(name).is_some()
}
