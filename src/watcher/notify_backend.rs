//! `notify`-backed `FileWatcher` (§6), using a single recursive watch
//! plus `notify-debouncer-mini` for coalescing — generalized from the
//! teacher's `watcher::handler::start_watcher`, which drives the same
//! crate's debouncer with an idle-flush timer layered on top.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};

use crate::queue::{IncomingEvent, Origin, QueueSender};
use crate::tree::Update;
use crate::watcher::scan::scan_mount;
use crate::watcher::FileWatcher;

/// How long the debouncer coalesces bursts of events for one path before
/// reporting it (matches the teacher's `start_watcher` default).
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

pub struct NotifyFileWatcher {
    root: PathBuf,
    debouncer: Option<Debouncer<notify::RecommendedWatcher>>,
    events: Option<Receiver<DebounceEventResult>>,
}

impl NotifyFileWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debouncer: None,
            events: None,
        }
    }

    /// Turn one changed path into an `Update`. A path that no longer
    /// exists is reported as a delete with `mod_time = 0` — `UpdateTree`'s
    /// slot-write rules (§4.2) copy the prior slot's `modTime` for us.
    fn path_to_update(&self, absolute: &Path) -> Option<Update> {
        let relative = absolute
            .strip_prefix(&self.root)
            .ok()?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if relative.is_empty() {
            return None;
        }

        if std::fs::symlink_metadata(absolute).is_err() {
            return Some(Update {
                path: relative,
                mod_time: 0,
                is_directory: false,
                symlink_target: String::new(),
                is_executable: false,
                delete: true,
                data: None,
                ignore_string: String::new(),
                local: true,
            });
        }

        match crate::watcher::scan::scan_one(&self.root, absolute, &relative) {
            Ok(update) => Some(update),
            Err(e) => {
                tracing::warn!("failed to stat changed path {relative:?}: {e:#}");
                None
            }
        }
    }
}

impl FileWatcher for NotifyFileWatcher {
    fn perform_initial_scan(&mut self) -> Result<Vec<Update>> {
        scan_mount(&self.root)
    }

    fn on_start(&mut self) -> Result<()> {
        let (tx, rx) = channel();
        let mut debouncer = new_debouncer(DEBOUNCE_INTERVAL, tx)
            .context("failed to create file watcher debouncer")?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.root.display()))?;
        self.debouncer = Some(debouncer);
        self.events = Some(rx);
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.debouncer = None;
        self.events = None;
        Ok(())
    }

    fn run_one_loop(&mut self, incoming: &QueueSender<IncomingEvent>) -> Result<Option<Duration>> {
        let Some(events) = &self.events else {
            return Ok(Some(DEBOUNCE_INTERVAL));
        };
        match events.recv_timeout(DEBOUNCE_INTERVAL) {
            Ok(Ok(batch)) => {
                for event in batch {
                    if let Some(update) = self.path_to_update(&event.path) {
                        let _ = incoming.put(IncomingEvent {
                            update,
                            origin: Origin::Local,
                        });
                    }
                }
                Ok(Some(Duration::ZERO))
            }
            Ok(Err(errors)) => {
                for e in errors {
                    tracing::warn!("file watcher error: {e}");
                }
                Ok(Some(Duration::ZERO))
            }
            Err(_timeout) => Ok(Some(Duration::ZERO)),
        }
    }
}
