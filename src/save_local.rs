//! SaveToLocal (§4.4): drains `saveToLocal`, applying remote-origin
//! updates to the filesystem via `FileAccess`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use crate::error::SyncError;
use crate::fsaccess::FileAccess;
use crate::queue::QueueReceiver;
use crate::tree::{NodeType, Update};

/// Bounded wait between queue polls, so a stop signal is noticed within
/// one iteration rather than blocking indefinitely on an empty queue.
const STOP_POLL: Duration = Duration::from_millis(200);

/// The sentinel body a seed uses as a "body to follow" placeholder
/// (§4.6, §6). Reaching this stage means a bug upstream.
pub const INITIAL_SYNC_MARKER: &[u8] = b"initialSyncMarker";

/// Notification sent back to SyncLogic after a successful write, so it
/// can add `(path, modTime)` to its echo-suppression set (§4.3, §4.4).
#[derive(Debug, Clone)]
pub struct Committed {
    pub path: String,
    pub mod_time: i64,
}

pub struct SaveToLocal<A: FileAccess> {
    access: A,
}

impl<A: FileAccess> SaveToLocal<A> {
    pub fn new(access: A) -> Self {
        Self { access }
    }

    /// Drain one queue's worth of updates, applying each and collecting
    /// commit notifications that SyncLogic should fold into its
    /// echo-suppression set. Returns `Err` (and stops draining) the
    /// moment a fatal invariant violation is observed (§7); the caller
    /// is responsible for tearing the session down.
    pub fn run(&self, queue: &QueueReceiver<Update>, committed: &mut Vec<Committed>) -> Result<()> {
        while let Some(update) = queue.take() {
            match self.apply(&update) {
                Ok(()) => committed.push(Committed {
                    path: update.path.clone(),
                    mod_time: update.mod_time,
                }),
                Err(e) if e.downcast_ref::<SyncError>().is_some_and(SyncError::is_fatal) => {
                    tracing::error!("fatal error applying {:?}: {e:#}", update.path);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("failed to apply update for {:?}: {e:#}", update.path);
                }
            }
        }
        Ok(())
    }

    /// Like `run`, but for a long-lived worker thread: polls `stop`
    /// between items instead of running until the channel disconnects
    /// (§5 cancellation: "finishes its current loop iteration then
    /// exits"), and reports each commit through `on_commit` as it happens
    /// rather than collecting them into a `Vec` for the caller to drain
    /// afterward.
    pub fn run_with_stop(
        &self,
        queue: &QueueReceiver<Update>,
        stop: &AtomicBool,
        mut on_commit: impl FnMut(Committed),
    ) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let Some(update) = queue.take_timeout(STOP_POLL) else {
                continue;
            };
            match self.apply(&update) {
                Ok(()) => on_commit(Committed {
                    path: update.path.clone(),
                    mod_time: update.mod_time,
                }),
                Err(e) if e.downcast_ref::<SyncError>().is_some_and(SyncError::is_fatal) => {
                    tracing::error!("fatal error applying {:?}: {e:#}", update.path);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("failed to apply update for {:?}: {e:#}", update.path);
                }
            }
        }
        Ok(())
    }

    fn apply(&self, update: &Update) -> Result<()> {
        if let Some(data) = &update.data {
            if data.as_slice() == INITIAL_SYNC_MARKER {
                return Err(SyncError::Fatal(format!(
                    "initialSyncMarker reached SaveToLocal for {:?}; seed construction bug",
                    update.path
                ))
                .into());
            }
        }

        if update.delete {
            return self.access.delete(&update.path, true);
        }

        match update.kind() {
            NodeType::Directory => {
                self.access.mkdir_p(&update.path)?;
                self.access
                    .set_modified_time(&update.path, update.mod_time)?;
            }
            NodeType::Symlink => {
                self.access
                    .create_symlink(&update.path, &update.symlink_target)?;
                self.access
                    .set_modified_time(&update.path, update.mod_time)?;
            }
            NodeType::File => {
                self.write_regular_file(update)?;
            }
        }
        Ok(())
    }

    fn write_regular_file(&self, update: &Update) -> Result<()> {
        let data = update.data.as_deref().unwrap_or(&[]);
        let attempt = self
            .access
            .write_file(&update.path, data, update.is_executable);

        let attempt = match attempt {
            Ok(()) => Ok(()),
            Err(e) if self.access.exists(&update.path) => {
                // Might be a read-only leftover from a prior write. Force
                // writable and retry exactly once (§7).
                tracing::debug!("retrying write of {:?} after forcing writable: {e:#}", update.path);
                self.access.force_writable(&update.path)?;
                self.access
                    .write_file(&update.path, data, update.is_executable)
            }
            Err(e) => Err(e),
        };
        attempt?;
        self.access
            .set_modified_time(&update.path, update.mod_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsaccess::LocalFileAccess;
    use crate::queue::Queues;
    use tempfile::TempDir;

    fn update(path: &str, mod_time: i64) -> Update {
        Update {
            path: path.to_string(),
            mod_time,
            is_directory: false,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: Some(b"hello".to_vec()),
            ignore_string: String::new(),
            local: false,
        }
    }

    #[test]
    fn writes_regular_file_and_reports_commit() {
        let tmp = TempDir::new().unwrap();
        let queues = Queues::with_capacities(4, 4, 4, 4);
        queues
            .save_to_local_sender()
            .put(update("a.txt", 5000))
            .unwrap();
        drop(queues.save_to_local_sender());

        let saver = SaveToLocal::new(LocalFileAccess::new(tmp.path()));
        let mut committed = Vec::new();
        saver.run(queues.save_to_local_receiver(), &mut committed).unwrap();

        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].path, "a.txt");
    }

    #[test]
    fn delete_removes_existing_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("gone.txt"), "x").unwrap();

        let queues = Queues::with_capacities(4, 4, 4, 4);
        let mut delete_update = update("gone.txt", 6000);
        delete_update.delete = true;
        delete_update.data = None;
        queues.save_to_local_sender().put(delete_update).unwrap();
        drop(queues.save_to_local_sender());

        let saver = SaveToLocal::new(LocalFileAccess::new(tmp.path()));
        let mut committed = Vec::new();
        saver.run(queues.save_to_local_receiver(), &mut committed).unwrap();
        assert!(!tmp.path().join("gone.txt").exists());
    }

    #[test]
    fn initial_sync_marker_reaching_disk_is_not_written() {
        let tmp = TempDir::new().unwrap();
        let queues = Queues::with_capacities(4, 4, 4, 4);
        let mut bad = update("bad.txt", 1000);
        bad.data = Some(INITIAL_SYNC_MARKER.to_vec());
        queues.save_to_local_sender().put(bad).unwrap();
        drop(queues.save_to_local_sender());

        let saver = SaveToLocal::new(LocalFileAccess::new(tmp.path()));
        let mut committed = Vec::new();
        let result = saver.run(queues.save_to_local_receiver(), &mut committed);
        assert!(result.is_err());
        assert!(!tmp.path().join("bad.txt").exists());
    }
}
