//! SaveToRemote (§4.5): drains `saveToRemote`, attaches file bodies, and
//! forwards the result onto `outgoing` for the transport to frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::fsaccess::FileAccess;
use crate::queue::{OutgoingFrame, QueueReceiver, QueueSender};
use crate::tree::{NodeType, Update};

const STOP_POLL: Duration = Duration::from_millis(200);

pub struct SaveToRemote<A: FileAccess> {
    access: A,
}

impl<A: FileAccess> SaveToRemote<A> {
    pub fn new(access: A) -> Self {
        Self { access }
    }

    /// Drain everything currently queued, reading bodies as needed and
    /// forwarding onto `outgoing`. A file that vanished between the diff
    /// pass and this read is dropped silently (§4.5: "transient file");
    /// any other read error is logged and the update is dropped, the
    /// session continues (§7).
    pub fn run(&self, queue: &QueueReceiver<Update>, outgoing: &QueueSender<OutgoingFrame>) {
        while let Some(mut update) = queue.take() {
            if update.kind() == NodeType::File && !update.delete && update.data.is_none() {
                match self.access.read_file(&update.path) {
                    Ok(body) => update.data = Some(body),
                    Err(_e) if !self.access.exists(&update.path) => {
                        tracing::debug!(
                            "{:?} vanished before its body could be read, dropping",
                            update.path
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("failed to read body for {:?}: {e:#}", update.path);
                        continue;
                    }
                }
            }

            update.local = false;
            if outgoing.put(OutgoingFrame { update }).is_err() {
                // Outgoing side has shut down; nothing left to drain into.
                break;
            }
        }
    }

    /// Like `run`, but polls `stop` between items instead of running
    /// until the channel disconnects, for use as a long-lived session
    /// worker (§5 cancellation).
    pub fn run_with_stop(
        &self,
        queue: &QueueReceiver<Update>,
        outgoing: &QueueSender<OutgoingFrame>,
        stop: &AtomicBool,
    ) {
        while !stop.load(Ordering::Relaxed) {
            let Some(mut update) = queue.take_timeout(STOP_POLL) else {
                continue;
            };
            if update.kind() == NodeType::File && !update.delete && update.data.is_none() {
                match self.access.read_file(&update.path) {
                    Ok(body) => update.data = Some(body),
                    Err(_e) if !self.access.exists(&update.path) => {
                        tracing::debug!(
                            "{:?} vanished before its body could be read, dropping",
                            update.path
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("failed to read body for {:?}: {e:#}", update.path);
                        continue;
                    }
                }
            }

            update.local = false;
            if outgoing.put(OutgoingFrame { update }).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsaccess::LocalFileAccess;
    use crate::queue::Queues;
    use tempfile::TempDir;

    fn file_update(path: &str) -> Update {
        Update {
            path: path.to_string(),
            mod_time: 5000,
            is_directory: false,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: None,
            ignore_string: String::new(),
            local: true,
        }
    }

    #[test]
    fn reads_body_from_disk_when_missing() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "payload").unwrap();

        let queues = Queues::with_capacities(4, 4, 4, 4);
        queues
            .save_to_remote_sender()
            .put(file_update("a.txt"))
            .unwrap();
        drop(queues.save_to_remote_sender());

        let saver = SaveToRemote::new(LocalFileAccess::new(tmp.path()));
        saver.run(queues.save_to_remote_receiver(), &queues.outgoing_sender());

        let frame = queues.outgoing_receiver().take().unwrap();
        assert_eq!(frame.update.data.as_deref(), Some(b"payload".as_slice()));
        assert!(!frame.update.local);
    }

    #[test]
    fn silently_drops_vanished_file() {
        let tmp = TempDir::new().unwrap();
        // Note: never actually created on disk.
        let queues = Queues::with_capacities(4, 4, 4, 4);
        queues
            .save_to_remote_sender()
            .put(file_update("ghost.txt"))
            .unwrap();
        drop(queues.save_to_remote_sender());

        let saver = SaveToRemote::new(LocalFileAccess::new(tmp.path()));
        saver.run(queues.save_to_remote_receiver(), &queues.outgoing_sender());

        assert_eq!(queues.outgoing_receiver().take_timeout(std::time::Duration::from_millis(10)), None);
    }

    #[test]
    fn deletes_pass_through_without_reading_a_body() {
        let tmp = TempDir::new().unwrap();
        let queues = Queues::with_capacities(4, 4, 4, 4);
        let mut delete_update = file_update("gone.txt");
        delete_update.delete = true;
        queues.save_to_remote_sender().put(delete_update).unwrap();
        drop(queues.save_to_remote_sender());

        let saver = SaveToRemote::new(LocalFileAccess::new(tmp.path()));
        saver.run(queues.save_to_remote_receiver(), &queues.outgoing_sender());

        let frame = queues.outgoing_receiver().take().unwrap();
        assert!(frame.update.delete);
        assert!(frame.update.data.is_none());
    }
}
