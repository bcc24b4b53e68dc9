//! Small public helpers shared across modules.

use std::io;
use std::path::{Path, PathBuf};

use crate::charset::Charset;

pub use crate::process::destroy_process_tree;

/// Resolve an executable name against the search path, honoring the
/// platform's executable suffix list (`PATHEXT` on Windows).
pub fn find_executable(name: impl AsRef<Path>) -> Option<PathBuf> {
    which::which(name.as_ref()).ok()
}

/// Path of the currently running executable.
pub fn current_executable() -> io::Result<PathBuf> {
    std::env::current_exe()
}

/// The platform-native character handling for process output.
pub fn native_charset() -> Charset {
    Charset::Utf8Lossy
}
