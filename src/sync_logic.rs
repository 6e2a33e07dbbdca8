//! SyncLogic (§4.3): the single-threaded owner of the `UpdateTree`.
//!
//! Pure decision logic — no queue or socket handles live here, matching §5's
//! "suspension points are confined to queue put/take, filesystem syscalls,
//! network I/O; SyncLogic is otherwise purely CPU." The actual queue
//! draining loop lives in `session`, which owns the `Queues` and calls into
//! this module once per dequeued event plus once per diff tick, exactly the
//! "debounce, then dispatch" shape the teacher's
//! `watcher::handler::start_watcher` and `mount::handler::run_event_loop`
//! use (drain events, act, flush on idle), generalized here to two
//! directions and a decide-not-just-dispatch step.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::proto::{is_body_request, make_body_request, INITIAL_SYNC_MARKER};
use crate::queue::{IncomingEvent, Origin};
use crate::rules::PathRules;
use crate::tree::{current_millis, NodeType, Side, Update, UpdateTree};

/// How long a `(path, modTime)` pair stays in the echo-suppression set
/// after `SaveToLocal` reports a commit (§9 open question: "the
/// echo-suppression window is left implicit in the source... a tuning
/// parameter" — fixed here at 5 seconds).
const ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Mirrors `save_local::Committed` — the notification SaveToLocal sends
/// back after a successful write (§4.4), duplicated here rather than
/// imported to keep `sync_logic` from depending on `save_local`'s I/O
/// machinery for what is really just a `(path, modTime)` pair.
#[derive(Debug, Clone)]
pub struct Committed {
    pub path: String,
    pub mod_time: i64,
}

pub struct SyncLogic {
    tree: UpdateTree,
    extra_includes: PathRules,
    extra_excludes: PathRules,
    debug_prefixes: Vec<String>,
    recent_writes: HashMap<String, (i64, Instant)>,
}

impl SyncLogic {
    pub fn new(extra_includes: PathRules, extra_excludes: PathRules, debug_prefixes: Vec<String>) -> Self {
        Self {
            tree: UpdateTree::new(),
            extra_includes,
            extra_excludes,
            debug_prefixes,
            recent_writes: HashMap::new(),
        }
    }

    pub fn tree(&self) -> &UpdateTree {
        &self.tree
    }

    /// Apply this side's own initial scan (§4.6 step 2: "both sides apply
    /// received seeds via addRemote and their own scan via addLocal").
    pub fn seed_local(&mut self, updates: Vec<Update>) {
        for update in updates {
            if let Err(e) = self.tree.add_local(update) {
                tracing::info!("rejected malformed update during local seed: {e}");
            }
        }
    }

    /// Apply the peer's seed stream.
    pub fn seed_remote(&mut self, updates: Vec<Update>) {
        for update in updates {
            if let Err(e) = self.tree.add_remote(update) {
                tracing::info!("rejected malformed update during remote seed: {e}");
            }
        }
    }

    /// Classify and apply one `incomingQueue` event (§4.3 "Classification").
    /// Any body-request response this produces is appended to
    /// `to_remote` for the caller to forward onto `saveToRemote`.
    pub fn handle_incoming(&mut self, event: IncomingEvent, to_remote: &mut Vec<Update>) {
        match event.origin {
            Origin::Local => self.handle_local(event.update),
            Origin::Remote => self.handle_remote(event.update, to_remote),
        }
    }

    fn handle_local(&mut self, update: Update) {
        if self.is_echo(&update.path, update.mod_time) {
            tracing::debug!(path = %update.path, "suppressing echo of our own write");
            return;
        }
        self.log_if_debug(&update.path, "local update");
        if let Err(e) = self.tree.add_local(update) {
            tracing::info!("rejected malformed local update: {e}");
        }
    }

    fn handle_remote(&mut self, update: Update, to_remote: &mut Vec<Update>) {
        if is_body_request(&update) {
            self.handle_body_request(&update.path, to_remote);
            return;
        }
        self.log_if_debug(&update.path, "remote update");
        if let Err(e) = self.tree.add_remote(update) {
            tracing::info!("rejected malformed remote update: {e}");
        }
    }

    /// The peer is asking for a file body it only has metadata for (§4.6
    /// step 3). Look up our own local knowledge of the path and, if we
    /// have live content, queue a metadata-only Update for `saveToRemote`
    /// to fill in the body and send back.
    fn handle_body_request(&mut self, path: &str, to_remote: &mut Vec<Update>) {
        let Ok(node_id) = self.tree.find(path) else {
            tracing::info!("body request for invalid path {path:?} ignored");
            return;
        };
        let Some(local) = self.tree.get(node_id).local.clone() else {
            tracing::debug!("body request for {path:?} but we have no local copy");
            return;
        };
        if local.delete {
            tracing::debug!("body request for {path:?} but our copy is deleted");
            return;
        }
        let mut response = local;
        response.path = path.to_string();
        response.data = None;
        to_remote.push(response);
    }

    /// Record that `SaveToLocal` just committed `(path, modTime)` to disk,
    /// so the next watcher event echoing this write is suppressed (§4.3,
    /// §4.4).
    pub fn note_committed(&mut self, committed: Committed) {
        self.recent_writes.insert(
            committed.path,
            (committed.mod_time, Instant::now() + ECHO_WINDOW),
        );
    }

    fn is_echo(&mut self, path: &str, mod_time: i64) -> bool {
        self.purge_expired_echoes();
        self.recent_writes
            .get(path)
            .is_some_and(|(committed_mt, _)| *committed_mt == mod_time)
    }

    fn purge_expired_echoes(&mut self) {
        let now = Instant::now();
        self.recent_writes.retain(|_, (_, expiry)| *expiry > now);
    }

    fn log_if_debug(&self, path: &str, what: &str) {
        if self.debug_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            tracing::debug!(path, "{what}");
        } else {
            tracing::trace!(path, "{what}");
        }
    }

    /// Run one diff pass over everything dirty since the last call (§4.3
    /// "Diff pass"). Returns `(to_local, to_remote)`: updates the caller
    /// should queue onto `saveToLocal` and `saveToRemote` respectively.
    pub fn diff_pass(&mut self) -> (Vec<Update>, Vec<Update>) {
        let now_ms = current_millis();
        let dirty = self.tree.take_dirty_nodes();
        let mut to_local = Vec::new();
        let mut to_remote = Vec::new();

        for node_id in dirty {
            if self
                .tree
                .should_ignore(node_id, &self.extra_includes, &self.extra_excludes)
            {
                continue;
            }
            if self.tree.is_local_newer(node_id, now_ms) {
                let mut update = self.reconstruct(node_id, Side::Local);
                update.data = None;
                to_remote.push(update);
            } else if self.tree.is_remote_newer(node_id, now_ms) {
                self.emit_remote_win(node_id, &mut to_local, &mut to_remote);
            }
        }

        (to_local, to_remote)
    }

    fn reconstruct(&self, node_id: crate::tree::NodeId, side: Side) -> Update {
        let node = self.tree.get(node_id);
        let slot = node.slot(side).cloned().unwrap_or_default();
        Update {
            path: self.tree.path_of(node_id),
            ..slot
        }
    }

    /// The remote side wins for this node: reconcile `saveToLocal` (§4.3
    /// "Else if isRemoteNewer()").
    fn emit_remote_win(
        &mut self,
        node_id: crate::tree::NodeId,
        to_local: &mut Vec<Update>,
        to_remote: &mut Vec<Update>,
    ) {
        let path = self.tree.path_of(node_id);
        let node = self.tree.get(node_id);
        let local_slot = node.local.clone();
        let Some(remote_slot) = node.remote.clone() else {
            return;
        };

        if remote_slot.kind() == NodeType::File && !remote_slot.delete {
            let has_body = remote_slot
                .data
                .as_deref()
                .is_some_and(|d| d != INITIAL_SYNC_MARKER);
            if !has_body {
                if !self.tree.get(node_id).awaiting_data {
                    self.tree.set_awaiting_data(node_id, true);
                    to_remote.push(make_body_request(&path));
                }
                return;
            }
            self.tree.set_awaiting_data(node_id, false);
        }

        // Retype: the local disk currently holds a different kind of
        // entry than the winning remote side. Queue the old entry's
        // delete first, then the create (§4.3: "queue a delete of the
        // local side first, then a create from the remote payload").
        if let Some(local) = &local_slot {
            if local.kind() != remote_slot.kind() {
                to_local.push(Update {
                    path: path.clone(),
                    mod_time: local.mod_time,
                    is_directory: local.is_directory,
                    symlink_target: String::new(),
                    is_executable: false,
                    delete: true,
                    data: None,
                    ignore_string: String::new(),
                    local: true,
                });
            }
        }

        let mut outgoing = remote_slot;
        outgoing.path = path;
        if outgoing.delete || outgoing.kind() != NodeType::File {
            outgoing.data = None;
        }
        to_local.push(outgoing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Origin;

    fn file(path: &str, mod_time: i64, data: &[u8], local: bool) -> Update {
        Update {
            path: path.to_string(),
            mod_time,
            is_directory: false,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: Some(data.to_vec()),
            ignore_string: String::new(),
            local,
        }
    }

    fn dir(path: &str, mod_time: i64, local: bool) -> Update {
        Update {
            is_directory: true,
            data: None,
            ..file(path, mod_time, b"", local)
        }
    }

    fn sync_logic() -> SyncLogic {
        SyncLogic::new(PathRules::empty(), PathRules::empty(), Vec::new())
    }

    /// Scenario 1 (§8): A writes foo.txt = "abc"; B reads foo.txt = "abc".
    #[test]
    fn local_write_is_forwarded_to_remote() {
        let mut logic = sync_logic();
        let mut unused = Vec::new();
        logic.handle_incoming(
            IncomingEvent {
                update: file("foo.txt", 5000, b"abc", true),
                origin: Origin::Local,
            },
            &mut unused,
        );
        let (to_local, to_remote) = logic.diff_pass();
        assert!(to_local.is_empty());
        assert_eq!(to_remote.len(), 1);
        assert_eq!(to_remote[0].path, "foo.txt");
        // data is stripped — SaveToRemote reads the body from disk.
        assert!(to_remote[0].data.is_none());
    }

    /// Scenario 2 (§8): both have foo.txt; A deletes it; B's copy is removed.
    #[test]
    fn delete_propagates_when_newer() {
        let mut logic = sync_logic();
        let mut unused = Vec::new();
        logic.handle_incoming(
            IncomingEvent {
                update: file("foo.txt", 1000, b"abc", true),
                origin: Origin::Local,
            },
            &mut unused,
        );
        logic.handle_incoming(
            IncomingEvent {
                update: file("foo.txt", 1000, b"abc", false),
                origin: Origin::Remote,
            },
            &mut unused,
        );
        logic.diff_pass(); // settle the initial steady state

        let mut deletion = file("foo.txt", 0, b"", true);
        deletion.delete = true;
        deletion.data = None;
        logic.handle_incoming(
            IncomingEvent {
                update: deletion,
                origin: Origin::Local,
            },
            &mut unused,
        );
        let (_, to_remote) = logic.diff_pass();
        assert_eq!(to_remote.len(), 1);
        assert!(to_remote[0].delete);
    }

    /// Scenario 3 (§8): A writes "abc" at mtime 2000, B writes "abcd" at
    /// mtime 1000; after reconciliation, A's copy wins on mtime.
    #[test]
    fn higher_mod_time_wins_conflicting_seeds() {
        let mut logic = sync_logic();
        logic.seed_local(vec![file("foo.txt", 2000, b"abc", true)]);
        logic.seed_remote(vec![file("foo.txt", 1000, b"abcd", false)]);

        let (to_local, to_remote) = logic.diff_pass();
        assert_eq!(to_remote.len(), 1, "local is newer, should push to remote");
        assert!(to_local.is_empty());
        assert_eq!(to_remote[0].mod_time, 2000);
    }

    /// Scenario 4 (§8): a `.gitignore` excluding foo.txt means it never
    /// reaches the remote side.
    #[test]
    fn gitignored_path_never_emitted() {
        let mut logic = sync_logic();
        let mut gi = file(".gitignore", 1000, b"foo.txt\n", true);
        gi.ignore_string = "foo.txt\n".to_string();
        logic.seed_local(vec![gi, file("foo.txt", 2000, b"secret", true)]);

        let (to_local, to_remote) = logic.diff_pass();
        assert!(to_local.is_empty());
        assert!(to_remote.iter().all(|u| u.path != "foo.txt"));
    }

    /// Scenario 6 (§8): B has a symlink where A has a real directory;
    /// after sync B gets a delete (of the symlink) then a directory create.
    #[test]
    fn retype_queues_delete_before_create() {
        let mut logic = sync_logic();
        let mut symlink = file("src", 1000, b"", true);
        symlink.symlink_target = "elsewhere".to_string();
        logic.seed_local(vec![symlink]);
        logic.seed_remote(vec![dir("src", 9000, false)]);

        let (to_local, _) = logic.diff_pass();
        assert_eq!(to_local.len(), 2, "expected a delete then a create");
        assert!(to_local[0].delete);
        assert!(!to_local[1].delete);
        assert!(to_local[1].is_directory);
    }

    #[test]
    fn remote_file_without_body_triggers_body_request_not_a_local_write() {
        let mut logic = sync_logic();
        let mut seeded = file("big.bin", 5000, INITIAL_SYNC_MARKER, false);
        seeded.data = Some(INITIAL_SYNC_MARKER.to_vec());
        logic.seed_remote(vec![seeded]);

        let (to_local, to_remote) = logic.diff_pass();
        assert!(to_local.is_empty());
        assert_eq!(to_remote.len(), 1);
        assert!(is_body_request(&to_remote[0]));

        // Once the real body arrives, the diff pass should emit the write.
        logic.tree_for_test_only_add_remote(file("big.bin", 5000, b"real bytes", false));
        let (to_local, _) = logic.diff_pass();
        assert_eq!(to_local.len(), 1);
        assert_eq!(to_local[0].data.as_deref(), Some(b"real bytes".as_slice()));
    }

    /// Regression for a live-session bug: a seed entry arriving through
    /// `handle_incoming` (as it actually does over the wire, unlike
    /// `seed_remote` above which pokes the tree directly) shares its
    /// sentinel body with a body-request and must still reach `add_remote`
    /// rather than being answered as if we were the one being asked for
    /// data.
    #[test]
    fn remote_seed_delivered_via_handle_incoming_is_not_treated_as_body_request() {
        let mut logic = sync_logic();
        let mut to_remote = Vec::new();
        let mut seed = file("foo.txt", 5000, b"abc", false);
        seed.data = Some(INITIAL_SYNC_MARKER.to_vec());
        logic.handle_incoming(
            IncomingEvent {
                update: seed,
                origin: Origin::Remote,
            },
            &mut to_remote,
        );
        assert!(
            to_remote.is_empty(),
            "a seed entry must reach add_remote, not handle_body_request"
        );

        let (to_local, remote) = logic.diff_pass();
        assert!(to_local.is_empty());
        assert_eq!(remote.len(), 1);
        assert!(
            is_body_request(&remote[0]),
            "the diff pass should be the one to request the body, now that metadata arrived"
        );
    }

    #[test]
    fn echo_of_our_own_write_is_suppressed() {
        let mut logic = sync_logic();
        logic.note_committed(Committed {
            path: "foo.txt".to_string(),
            mod_time: 5000,
        });
        let mut unused = Vec::new();
        logic.handle_incoming(
            IncomingEvent {
                update: file("foo.txt", 5000, b"abc", true),
                origin: Origin::Local,
            },
            &mut unused,
        );
        // Nothing dirty — the echoed write never reached the tree.
        let (to_local, to_remote) = logic.diff_pass();
        assert!(to_local.is_empty());
        assert!(to_remote.is_empty());
    }

    #[test]
    fn body_request_from_peer_is_answered_from_local_knowledge() {
        let mut logic = sync_logic();
        logic.seed_local(vec![file("foo.txt", 5000, b"abc", true)]);
        logic.diff_pass();

        let mut to_remote = Vec::new();
        logic.handle_incoming(
            IncomingEvent {
                update: make_body_request("foo.txt"),
                origin: Origin::Remote,
            },
            &mut to_remote,
        );
        assert_eq!(to_remote.len(), 1);
        assert_eq!(to_remote[0].path, "foo.txt");
        assert!(to_remote[0].data.is_none(), "SaveToRemote fills the body in");
    }

    impl SyncLogic {
        /// Test-only helper: poke the tree's remote slot directly to
        /// simulate a body-response arriving over the wire.
        fn tree_for_test_only_add_remote(&mut self, update: Update) {
            self.tree.add_remote(update).unwrap();
        }
    }
}
