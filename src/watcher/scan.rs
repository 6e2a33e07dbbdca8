//! The initial-scan walker behind `FileWatcher::perform_initial_scan`.
//!
//! Grounded on the teacher's `mount::walker::walk_mount`, which drives a
//! `WalkDir` traversal and emits one event per entry; this version drops
//! the incremental-gitignore-during-walk step (no directories are pruned
//! here — see the module doc on `watcher::mod`) but keeps the same
//! metadata-extraction shape: stat each entry, detect symlinks without
//! following them, and special-case `.gitignore` bodies.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::tree::Update;

/// Walk `root`, producing one `Update` per entry (root itself excluded —
/// the tree's root node is synthetic and never carries a real path).
pub fn scan_mount(root: &Path) -> Result<Vec<Update>> {
    let mut updates = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = entry.context("walking mount root")?;
        if entry.path() == root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        match scan_one(root, entry.path(), &relative) {
            Ok(update) => updates.push(update),
            Err(e) => {
                tracing::warn!("skipping {relative:?} during initial scan: {e:#}");
            }
        }
    }
    Ok(updates)
}

pub(crate) fn scan_one(root: &Path, absolute: &Path, relative: &str) -> Result<Update> {
    let metadata = fs::symlink_metadata(absolute)
        .with_context(|| format!("stat {}", absolute.display()))?;
    let mod_time = mod_time_millis(&metadata);

    if metadata.is_symlink() {
        let raw_target = fs::read_link(absolute)
            .with_context(|| format!("read_link {}", absolute.display()))?;
        let symlink_target = relativize_symlink_target(root, absolute, &raw_target);
        return Ok(Update {
            path: relative.to_string(),
            mod_time,
            is_directory: false,
            symlink_target,
            is_executable: false,
            delete: false,
            data: None,
            ignore_string: String::new(),
            local: true,
        });
    }

    if metadata.is_dir() {
        return Ok(Update {
            path: relative.to_string(),
            mod_time,
            is_directory: true,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: None,
            ignore_string: String::new(),
            local: true,
        });
    }

    let ignore_string = if absolute.file_name().and_then(|n| n.to_str()) == Some(".gitignore") {
        match fs::read_to_string(absolute) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to read {} as utf-8: {e}", absolute.display());
                String::new()
            }
        }
    } else {
        String::new()
    };

    Ok(Update {
        path: relative.to_string(),
        mod_time,
        is_directory: false,
        symlink_target: String::new(),
        is_executable: is_executable(&metadata),
        delete: false,
        data: None,
        ignore_string,
        local: true,
    })
}

fn mod_time_millis(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// If `raw_target` is absolute and falls inside `root`, rewrite it
/// relative to the symlink's own parent directory (§6: "rewritten to be
/// relative to the symlink's parent if the on-disk target was absolute
/// inside the mount"). Otherwise pass the raw string through unchanged.
fn relativize_symlink_target(root: &Path, symlink_path: &Path, raw_target: &Path) -> String {
    if !raw_target.is_absolute() {
        return raw_target.to_string_lossy().into_owned();
    }
    let Ok(inside_mount) = raw_target.strip_prefix(root) else {
        return raw_target.to_string_lossy().into_owned();
    };
    let Some(parent) = symlink_path.parent() else {
        return raw_target.to_string_lossy().into_owned();
    };
    let absolute_target = root.join(inside_mount);
    match pathdiff_relative(&absolute_target, parent) {
        Some(relative) => relative,
        None => raw_target.to_string_lossy().into_owned(),
    }
}

/// Minimal relative-path computation between two absolute, non-symlink
/// paths sharing a common ancestor (both are always under `root` here).
fn pathdiff_relative(target: &Path, from: &Path) -> Option<String> {
    let target_components: Vec<_> = target.components().collect();
    let from_components: Vec<_> = from.components().collect();
    let common = target_components
        .iter()
        .zip(from_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let ups = from_components.len() - common;
    let mut parts: Vec<String> = (0..ups).map(|_| "..".to_string()).collect();
    parts.extend(
        target_components[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn scans_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/main.rs"), "fn main() {}").unwrap();

        let updates = scan_mount(tmp.path()).unwrap();
        let paths: Vec<_> = updates.iter().map(|u| u.path.clone()).collect();
        assert!(paths.contains(&"src".to_string()));
        assert!(paths.contains(&"src/main.rs".to_string()));

        let dir_update = updates.iter().find(|u| u.path == "src").unwrap();
        assert!(dir_update.is_directory);
        let file_update = updates.iter().find(|u| u.path == "src/main.rs").unwrap();
        assert!(!file_update.is_directory);
    }

    #[test]
    fn reads_gitignore_body() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), "target/\n").unwrap();

        let updates = scan_mount(tmp.path()).unwrap();
        let gi = updates.iter().find(|u| u.path == ".gitignore").unwrap();
        assert_eq!(gi.ignore_string, "target/\n");
    }

    #[cfg(unix)]
    #[test]
    fn detects_symlink_and_rewrites_absolute_target() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("real.txt"), "hi").unwrap();
        let absolute_target = tmp.path().join("real.txt");
        std::os::unix::fs::symlink(&absolute_target, tmp.path().join("sub/link.txt")).unwrap();

        let updates = scan_mount(tmp.path()).unwrap();
        let link = updates.iter().find(|u| u.path == "sub/link.txt").unwrap();
        assert!(!link.is_directory);
        assert_eq!(link.symlink_target, "../real.txt");
    }

    #[cfg(unix)]
    #[test]
    fn detects_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let updates = scan_mount(tmp.path()).unwrap();
        let entry = updates.iter().find(|u| u.path == "run.sh").unwrap();
        assert!(entry.is_executable);
    }
}
