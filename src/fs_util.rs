//! Filesystem helpers used around process execution.
//!
//! Recursive operations never follow symbolic links: a symlink inside the
//! tree is removed (or recreated) as a link, its target is left alone. The
//! quiet delete variant swallows individual errors and reports statistics
//! instead, for cleanup paths where a best effort is all that is wanted.

use std::fs;
use std::io;
use std::path::Path;

/// Outcome counters of [`remove_recursively_quiet`].
///
/// `removed <= found` for both kinds; a difference means some entries
/// could not be deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub directories_found: u64,
    pub directories_removed: u64,
    pub files_found: u64,
    pub files_removed: u64,
}

impl DeleteStats {
    /// Whether everything that was found was also removed.
    pub fn is_complete(&self) -> bool {
        self.directories_found == self.directories_removed
            && self.files_found == self.files_removed
    }
}

/// Whether a path exists (without following a trailing symlink).
pub fn exists(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Whether the path is a regular file.
pub fn is_regular_file(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Whether the path is a directory.
pub fn is_directory(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Delete a file or directory tree, raising on the first failure.
///
/// A missing path is not an error.
pub fn remove_recursively(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            remove_recursively(entry?.path())?;
        }
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Delete a file or directory tree, swallowing errors and returning what
/// was found and what was actually removed.
pub fn remove_recursively_quiet(path: impl AsRef<Path>) -> DeleteStats {
    let mut stats = DeleteStats::default();
    remove_quiet_inner(path.as_ref(), &mut stats);
    stats
}

fn remove_quiet_inner(path: &Path, stats: &mut DeleteStats) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.is_dir() {
        stats.directories_found += 1;
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                remove_quiet_inner(&entry.path(), stats);
            }
        }
        if fs::remove_dir(path).is_ok() {
            stats.directories_removed += 1;
        }
    } else {
        stats.files_found += 1;
        if fs::remove_file(path).is_ok() {
            stats.files_removed += 1;
        }
    }
}

/// Copy a file or directory tree. Symlinks are recreated as links.
pub fn copy_recursively(from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
    copy_inner(from.as_ref(), to.as_ref())
}

fn copy_inner(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_inner(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, to)
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "symlink copy is not supported on this platform",
            ))
        }
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

/// Move a file or directory tree: a rename when source and destination are
/// on the same filesystem, copy-then-delete otherwise.
pub fn move_recursively(from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_recursively(from, to)?;
            remove_recursively(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.txt"), "top").unwrap();
        fs::write(root.join("a/one.txt"), "one").unwrap();
        fs::write(root.join("a/b/two.txt"), "two").unwrap();
    }

    #[test]
    fn test_remove_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        remove_recursively(&root).unwrap();
        assert!(!exists(&root));
    }

    #[test]
    fn test_remove_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_recursively(dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_quiet_delete_counts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        build_tree(&root);
        let stats = remove_recursively_quiet(&root);
        assert_eq!(stats.directories_found, 3);
        assert_eq!(stats.directories_removed, 3);
        assert_eq!(stats.files_found, 3);
        assert_eq!(stats.files_removed, 3);
        assert!(stats.is_complete());
        assert!(!exists(&root));
    }

    #[test]
    fn test_quiet_delete_of_missing_path_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stats = remove_recursively_quiet(dir.path().join("nope"));
        assert_eq!(stats, DeleteStats::default());
    }

    #[test]
    fn test_copy_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        build_tree(&src);

        let copied = dir.path().join("copied");
        copy_recursively(&src, &copied).unwrap();
        assert_eq!(fs::read_to_string(copied.join("a/b/two.txt")).unwrap(), "two");
        assert!(exists(&src));

        let moved = dir.path().join("moved");
        move_recursively(&copied, &moved).unwrap();
        assert!(exists(moved.join("a/one.txt")));
        assert!(!exists(&copied));
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep.txt"), "keep").unwrap();

        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        remove_recursively(&root).unwrap();
        assert!(!exists(&root));
        assert!(exists(outside.join("keep.txt")));
    }
}
