//! FileWatcher (§6 capability, consumed): emits local change events and
//! performs the initial scan.
//!
//! Generalizes the teacher's `GitignoreWatcher` (per-directory,
//! non-recursive watches added lazily as gitignore-permitted directories
//! are discovered) to a single recursive watch at the mount root: this
//! crate's ignore decisions live entirely in `UpdateTree::should_ignore`
//! (§4.3), so the watcher's only job is faithful collection — it reports
//! everything under the mount and lets SyncLogic decide what to skip,
//! rather than duplicating ignore logic at watch-setup time the way a
//! code-search tool optimizing for huge `node_modules` trees would.

pub mod notify_backend;
pub mod scan;

use std::time::Duration;

use anyhow::Result;

use crate::queue::{IncomingEvent, QueueSender};
use crate::tree::Update;

pub use notify_backend::NotifyFileWatcher;

/// The abstract capability §6 describes. Implementations may poll or
/// block in `run_one_loop`; tests supply in-memory stubs (§9 design
/// note: "tests supply in-memory stubs").
pub trait FileWatcher: Send {
    /// Snapshot of the mount root: directories, regular files (metadata
    /// only), and symlinks (targets resolved relative to the symlink's
    /// parent). Follows no symlinks.
    fn perform_initial_scan(&mut self) -> Result<Vec<Update>>;

    fn on_start(&mut self) -> Result<()>;
    fn on_stop(&mut self) -> Result<()>;

    /// Invoked repeatedly by the task host. Pushes any observed changes
    /// onto `incoming` tagged `Origin::Local`. Returns a suggested wait
    /// before calling again, or `None` if this call already blocked
    /// until something happened.
    fn run_one_loop(&mut self, incoming: &QueueSender<IncomingEvent>) -> Result<Option<Duration>>;
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory `FileWatcher` for exercising SyncLogic without a real
    /// filesystem, per the §9 design note on capability stubs.
    pub struct StubFileWatcher {
        pub scan_result: Vec<Update>,
        pub pending_events: VecDeque<Update>,
        pub started: bool,
    }

    impl StubFileWatcher {
        pub fn new(scan_result: Vec<Update>) -> Self {
            Self {
                scan_result,
                pending_events: VecDeque::new(),
                started: false,
            }
        }
    }

    impl FileWatcher for StubFileWatcher {
        fn perform_initial_scan(&mut self) -> Result<Vec<Update>> {
            Ok(std::mem::take(&mut self.scan_result))
        }

        fn on_start(&mut self) -> Result<()> {
            self.started = true;
            Ok(())
        }

        fn on_stop(&mut self) -> Result<()> {
            self.started = false;
            Ok(())
        }

        fn run_one_loop(
            &mut self,
            incoming: &QueueSender<IncomingEvent>,
        ) -> Result<Option<Duration>> {
            if let Some(update) = self.pending_events.pop_front() {
                let _ = incoming.put(IncomingEvent {
                    update,
                    origin: crate::queue::Origin::Local,
                });
            }
            Ok(Some(Duration::from_millis(10)))
        }
    }
}
