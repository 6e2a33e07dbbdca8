//! FileAccess (§6 capability, consumed): the operations `SaveToLocal` and
//! `SaveToRemote` use to touch the filesystem, kept behind a trait so
//! tests can supply in-memory stubs (§9 design note) instead of a real
//! mount root — the same separation the teacher draws between `Mount`
//! (owns a real root + lock) and the pure-logic pieces around it.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;

pub trait FileAccess: Send {
    fn mkdir_p(&self, relative: &str) -> Result<()>;
    fn create_symlink(&self, relative: &str, target: &str) -> Result<()>;
    fn delete(&self, relative: &str, recursive: bool) -> Result<()>;
    fn write_file(&self, relative: &str, data: &[u8], executable: bool) -> Result<()>;
    fn set_modified_time(&self, relative: &str, mod_time_millis: i64) -> Result<()>;
    fn read_file(&self, relative: &str) -> Result<Vec<u8>>;
    fn force_writable(&self, relative: &str) -> Result<()>;
    fn exists(&self, relative: &str) -> bool;
}

/// The default `FileAccess`, rooted at an absolute mount directory on the
/// local disk. Mirrors the teacher's pattern of joining a relative,
/// forward-slash path onto an absolute base (`Mount::root`).
///
/// `_lock` is `None` for `new()` (tests, and the `scan` CLI subcommand's
/// dry-run, which never writes) and `Some` for `locked()`, grounded on the
/// teacher's `Mount::new_rw` (`fs2::FileExt::try_lock_exclusive` on a file
/// under the mount root), generalized from locking `.codeindex/index.json`
/// specifically to a dedicated `.driftless.lock` file, since this crate has
/// no equivalent index file of its own to lock. Held in an `Arc` so cloning
/// `LocalFileAccess` across the session's worker threads shares one lock
/// rather than each clone trying to acquire its own.
#[derive(Clone)]
pub struct LocalFileAccess {
    root: PathBuf,
    _lock: Option<Arc<File>>,
}

impl LocalFileAccess {
    /// No exclusive lock taken. For tests and read-only inspection (the
    /// `scan` subcommand), where a second process touching the same mount
    /// root concurrently isn't a correctness concern.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _lock: None,
        }
    }

    /// Acquire an exclusive lock on `<root>/.driftless.lock` before
    /// returning, so a second session against the same mount root fails
    /// fast instead of racing this one's writes (§5: "the filesystem is a
    /// shared resource; within one mount, SaveToLocal is the sole writer").
    /// The lock is released when every clone of the returned value is
    /// dropped.
    pub fn locked(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating mount root {}", root.display()))?;
        let lock_path = root.join(".driftless.lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;
        lock_file
            .try_lock_exclusive()
            .with_context(|| format!("another session already holds {}", lock_path.display()))?;
        Ok(Self {
            root,
            _lock: Some(Arc::new(lock_file)),
        })
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

impl FileAccess for LocalFileAccess {
    fn mkdir_p(&self, relative: &str) -> Result<()> {
        let path = self.absolute(relative);
        fs::create_dir_all(&path).with_context(|| format!("mkdir -p {}", path.display()))
    }

    fn create_symlink(&self, relative: &str, target: &str) -> Result<()> {
        let path = self.absolute(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        // Replace anything already there (no-follow: symlink_metadata, not metadata).
        if fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path)
                .with_context(|| format!("removing existing entry at {}", path.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &path)
            .with_context(|| format!("symlink {} -> {target}", path.display()))?;
        #[cfg(not(unix))]
        anyhow::bail!("symlinks are not supported on this platform");
        Ok(())
    }

    fn delete(&self, relative: &str, recursive: bool) -> Result<()> {
        let path = self.absolute(relative);
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            return Ok(()); // already gone
        };
        if metadata.is_dir() && !metadata.is_symlink() {
            if recursive {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("rm -r {}", path.display()))?;
            } else {
                fs::remove_dir(&path).with_context(|| format!("rmdir {}", path.display()))?;
            }
        } else {
            fs::remove_file(&path).with_context(|| format!("rm {}", path.display()))?;
        }
        Ok(())
    }

    fn write_file(&self, relative: &str, data: &[u8], executable: bool) -> Result<()> {
        let path = self.absolute(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        // Atomic replace: write to a sibling temp file, then rename over
        // the target (same filesystem, so rename is atomic on all major
        // platforms for a plain file-to-file replace).
        let tmp_name = format!(
            "{}.driftless-tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
        );
        let tmp_path = path.with_file_name(tmp_name);
        fs::write(&tmp_path, data)
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;

        if executable {
            #[cfg(unix)]
            {
                let mut perms = fs::metadata(&tmp_path)?.permissions();
                perms.set_mode(perms.mode() | 0o111);
                fs::set_permissions(&tmp_path, perms)?;
            }
        }

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {} -> {}", tmp_path.display(), path.display()))?;
        Ok(())
    }

    fn set_modified_time(&self, relative: &str, mod_time_millis: i64) -> Result<()> {
        let path = self.absolute(relative);
        if fs::symlink_metadata(&path).is_ok_and(|m| m.is_symlink()) {
            // std::fs has no no-follow mtime setter (no `lutimes`
            // equivalent without libc). Best-effort: leave the symlink's
            // own mtime alone rather than silently stamping its target.
            tracing::debug!("skipping mtime stamp on symlink {relative:?} (no-follow unsupported)");
            return Ok(());
        }
        let time = UNIX_EPOCH + Duration::from_millis(mod_time_millis.max(0) as u64);
        set_mtime(&path, time)
    }

    fn read_file(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.absolute(relative);
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn force_writable(&self, relative: &str) -> Result<()> {
        let path = self.absolute(relative);
        let metadata =
            fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        let mut perms = metadata.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(&path, perms)
                .with_context(|| format!("chmod +w {}", path.display()))?;
        }
        Ok(())
    }

    fn exists(&self, relative: &str) -> bool {
        fs::symlink_metadata(self.absolute(relative)).is_ok()
    }
}

/// `std::fs::File::set_modified` needs an open handle; reopening for
/// write is the simplest portable route to a cross-platform mtime-set
/// without pulling in an extra crate the teacher never depended on.
fn set_mtime(path: &Path, time: SystemTime) -> Result<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} to set mtime", path.display()))?;
    file.set_modified(time)
        .with_context(|| format!("setting mtime on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_file_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.write_file("a.txt", b"hello", false).unwrap();
        assert_eq!(access.read_file("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn mkdir_p_creates_nested_directories() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.mkdir_p("a/b/c").unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());
    }

    #[test]
    fn delete_is_idempotent_on_missing_path() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        assert!(access.delete("missing.txt", false).is_ok());
    }

    #[test]
    fn delete_directory_recursive_removes_children() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.mkdir_p("dir").unwrap();
        access.write_file("dir/inner.txt", b"x", false).unwrap();
        access.delete("dir", true).unwrap();
        assert!(!tmp.path().join("dir").exists());
    }

    #[cfg(unix)]
    #[test]
    fn create_symlink_points_at_target() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.write_file("real.txt", b"x", false).unwrap();
        access.create_symlink("link.txt", "real.txt").unwrap();
        let resolved = fs::read_link(tmp.path().join("link.txt")).unwrap();
        assert_eq!(resolved, Path::new("real.txt"));
    }

    #[test]
    fn force_writable_clears_readonly_bit() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.write_file("ro.txt", b"x", false).unwrap();
        let path = tmp.path().join("ro.txt");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        access.force_writable("ro.txt").unwrap();
        assert!(!fs::metadata(&path).unwrap().permissions().readonly());
    }

    #[test]
    fn locked_rejects_a_second_exclusive_holder() {
        let tmp = TempDir::new().unwrap();
        let first = LocalFileAccess::locked(tmp.path()).unwrap();
        assert!(LocalFileAccess::locked(tmp.path()).is_err());
        drop(first);
        // Released once the only holder is dropped.
        assert!(LocalFileAccess::locked(tmp.path()).is_ok());
    }

    #[test]
    fn locked_clone_shares_the_same_lock() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::locked(tmp.path()).unwrap();
        let _clone = access.clone();
        // A second independent acquisition still fails while either the
        // original or its clone is alive.
        assert!(LocalFileAccess::locked(tmp.path()).is_err());
    }

    #[test]
    fn set_modified_time_is_observable() {
        let tmp = TempDir::new().unwrap();
        let access = LocalFileAccess::new(tmp.path());
        access.write_file("a.txt", b"x", false).unwrap();
        access.set_modified_time("a.txt", 1_700_000_000_000).unwrap();
        let metadata = fs::metadata(tmp.path().join("a.txt")).unwrap();
        let modified = metadata.modified().unwrap();
        let millis = modified
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert_eq!(millis, 1_700_000_000_000);
    }
}
