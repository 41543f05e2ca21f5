//! Cross-cutting utilities: file publication, deterministic archives,
//! subprocess execution, retry schedules and tool lookup.

pub mod backoff;
pub mod fs;
pub mod lock;
pub mod platform;
pub mod process;
pub mod tarball;

pub use fs::{atomic_write, ensure_dir, publish_no_clobber};
pub use lock::FileLock;
pub use platform::get_git_command;
pub use process::{ToolCommand, ToolOutput};
