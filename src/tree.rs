//! The UpdateTree (§3, §4.2): a path-indexed catalog of local + remote
//! metadata per entry, with dirty-tracking for the diff pass.
//!
//! Modeled as an arena of `Node`s addressed by stable indices (§9 design
//! note: "implement as an arena of nodes addressed by stable indices;
//! parent/child edges are indices"), generalizing the teacher's flat
//! `HashMap<PathBuf, Mount>` (`mount::MountTable`) to a recursive tree,
//! since mounts there never nest but paths here always do.

use std::cell::Cell;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::rules::PathRules;

/// Which side of the mount an `Update` or slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// A metadata record for one path (§3).
///
/// `path` is cleared once stored in a `Node` slot (invariant 3); the
/// field still exists on the struct because the same type is used for
/// in-flight updates (watcher events, wire messages) where the path is
/// exactly what identifies the target node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub path: String,
    /// Milliseconds since epoch. 0 is permitted only for deletes.
    pub mod_time: i64,
    pub is_directory: bool,
    /// Non-empty iff this entry is a symlink; holds the raw target.
    pub symlink_target: String,
    pub is_executable: bool,
    pub delete: bool,
    /// None = metadata only. Some(vec![]) = an explicit empty file body.
    pub data: Option<Vec<u8>>,
    /// Non-empty only when `path` ends in `.gitignore`; full file text.
    pub ignore_string: String,
    /// True if this update originated on this side.
    pub local: bool,
}

impl Update {
    pub fn kind(&self) -> NodeType {
        if self.is_directory {
            NodeType::Directory
        } else if !self.symlink_target.is_empty() {
            NodeType::Symlink
        } else {
            NodeType::File
        }
    }
}

/// The type of a node, derived from whichever side's Update is in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Directory,
    Symlink,
    File,
}

/// An entry in the UpdateTree.
pub struct Node {
    pub name: String,
    parent: Option<NodeId>,
    /// Ordered by insertion (§3): at most one child per name.
    children: Vec<(String, NodeId)>,
    pub local: Option<Update>,
    pub remote: Option<Update>,
    /// Non-null only on directory nodes whose immediate child is a
    /// `.gitignore`, or that received extra rules.
    ignore_rules: Option<PathRules>,
    is_dirty: bool,
    has_dirty_descendant: bool,
    should_ignore: Cell<Option<bool>>,
    /// Set when the diff pass decided the remote side wins for a regular
    /// file but no body has arrived yet; cleared once data is attached.
    pub awaiting_data: bool,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            local: None,
            remote: None,
            ignore_rules: None,
            is_dirty: false,
            has_dirty_descendant: false,
            should_ignore: Cell::new(None),
            awaiting_data: false,
        }
    }

    pub fn slot(&self, side: Side) -> Option<&Update> {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }

    /// The node's type, preferring local metadata, falling back to
    /// remote when local is absent (used for ignore-rule directory
    /// detection where either side's knowledge is good enough).
    fn either_kind(&self) -> Option<NodeType> {
        self.local
            .as_ref()
            .or(self.remote.as_ref())
            .map(Update::kind)
    }
}

/// Stable index into the tree's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Quantize a `modTime` to whole seconds, with the two exceptions the
/// spec calls out: literal values under 1000ms are left untouched (test
/// fidelity, §9), and values more than an hour in the future are clamped
/// to `now - 1min` before quantizing (clock skew sanity check, §4.2).
pub(crate) fn sanitize_mod_time(mod_time: i64, now_ms: i64) -> i64 {
    if mod_time < 1000 {
        return mod_time;
    }
    if mod_time > now_ms + 3_600_000 {
        return ((now_ms - 60_000) / 1000) * 1000;
    }
    (mod_time / 1000) * 1000
}

/// Raw "is `a` newer than `b`" comparison (§4.2), without the no-op
/// suppression rules — those are layered on by `is_local_newer` /
/// `is_remote_newer`.
fn raw_newer(a: Option<&Update>, b: Option<&Update>, now_ms: i64) -> bool {
    let Some(a) = a else { return false };
    let a_mt = sanitize_mod_time(a.mod_time, now_ms);
    match b {
        None => true,
        Some(b) => {
            let b_mt = sanitize_mod_time(b.mod_time, now_ms);
            if a_mt == b_mt {
                // Tie-break: a delete loses to a live entry at the same time.
                !a.delete && b.delete
            } else {
                a_mt > b_mt
            }
        }
    }
}

/// Whether a "newer" verdict for `a` over `b` should be suppressed as a
/// no-op (§4.2): both sides are deletes (or `b` is absent and `a` is a
/// delete), or both current sides are live directories (mtime noise).
fn suppressed(a: Option<&Update>, b: Option<&Update>) -> bool {
    let a_is_delete = a.is_some_and(|u| u.delete);
    if a_is_delete && (b.is_none() || b.is_some_and(|u| u.delete)) {
        return true;
    }
    if let (Some(a), Some(b)) = (a, b) {
        if a.is_directory && !a.delete && b.is_directory && !b.delete {
            return true;
        }
    }
    false
}

/// Strip `ancestor_path` (possibly empty) as a path prefix of `full_path`,
/// returning the remaining relative path.
fn relative_to(full_path: &str, ancestor_path: &str) -> String {
    if ancestor_path.is_empty() {
        return full_path.to_string();
    }
    full_path
        .strip_prefix(ancestor_path)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(full_path)
        .to_string()
}

/// The path-addressed store of Nodes (§4.2), single-threaded — driven
/// exclusively by SyncLogic's one worker (§5).
pub struct UpdateTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl UpdateTree {
    pub fn new() -> Self {
        let mut nodes = vec![Node::new(String::new(), None)];
        let root = NodeId(0);
        let root_update = |local: bool| Update {
            path: String::new(),
            mod_time: 0,
            is_directory: true,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: None,
            ignore_string: String::new(),
            local,
        };
        nodes[0].local = Some(root_update(true));
        nodes[0].remote = Some(root_update(false));
        Self { nodes, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> &Node {
        self.node(id)
    }

    fn child_or_create(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some((_, id)) = self
            .node(parent)
            .children
            .iter()
            .find(|(n, _)| n == name)
        {
            return *id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name.to_string(), Some(parent)));
        self.node_mut(parent).children.push((name.to_string(), id));
        id
    }

    /// Navigate by path segments, creating missing intermediate nodes
    /// (without populating `local`/`remote` on them).
    pub fn find(&mut self, path: &str) -> Result<NodeId, SyncError> {
        validate_path(path)?;
        if path.is_empty() {
            return Ok(self.root);
        }
        let mut current = self.root;
        for segment in path.split('/') {
            current = self.child_or_create(current, segment);
        }
        Ok(current)
    }

    /// Reconstruct the full path of a node by walking parents (invariant 3).
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current);
            let Some(parent) = node.parent else { break };
            parts.push(node.name.clone());
            current = parent;
        }
        parts.reverse();
        parts.join("/")
    }

    pub fn add_local(&mut self, update: Update) -> Result<(), SyncError> {
        self.add_local_at(update, current_millis())
    }

    pub fn add_remote(&mut self, update: Update) -> Result<(), SyncError> {
        self.add_remote_at(update, current_millis())
    }

    pub fn add_local_at(&mut self, update: Update, now_ms: i64) -> Result<(), SyncError> {
        self.add(update, Side::Local, now_ms)
    }

    pub fn add_remote_at(&mut self, update: Update, now_ms: i64) -> Result<(), SyncError> {
        self.add(update, Side::Remote, now_ms)
    }

    fn add(&mut self, update: Update, side: Side, now_ms: i64) -> Result<(), SyncError> {
        validate_path(&update.path)?;
        let path = update.path.clone();
        let node_id = self.find(&path)?;
        self.set_slot(node_id, side, update, now_ms);
        Ok(())
    }

    fn set_slot(&mut self, node_id: NodeId, side: Side, mut new: Update, now_ms: i64) {
        new.mod_time = sanitize_mod_time(new.mod_time, now_ms);
        let prior = self.node(node_id).slot(side).cloned();

        if let Some(prior) = &prior {
            if new.delete && new.mod_time == 0 {
                new.mod_time = prior.mod_time;
            }
            if prior.is_directory && new.is_directory {
                new.mod_time = prior.mod_time;
            }
            if prior.delete && !new.delete && new.mod_time <= prior.mod_time {
                new.mod_time = prior.mod_time + 1000;
            }
            if !prior.delete && new.delete && new.mod_time < prior.mod_time {
                new.mod_time = prior.mod_time + 1000;
            }
        }

        let cascade =
            new.delete || (prior.as_ref().is_some_and(|p| p.is_directory) && !new.is_directory);

        new.path.clear();
        let is_gitignore = self.node(node_id).name == ".gitignore";
        match side {
            Side::Local => self.node_mut(node_id).local = Some(new),
            Side::Remote => self.node_mut(node_id).remote = Some(new),
        }

        if cascade {
            self.cascade_delete_descendants(node_id, side);
        }

        if is_gitignore {
            if let Some(parent) = self.node(node_id).parent {
                self.refresh_ignore_rules(parent);
            }
        }

        self.mark_dirty(node_id);
    }

    /// On retype directory→non-directory, or any delete of a directory,
    /// mark all descendants deleted on the same side, preserving their
    /// prior `modTime` (invariant 8).
    fn cascade_delete_descendants(&mut self, node_id: NodeId, side: Side) {
        let children: Vec<NodeId> = self
            .node(node_id)
            .children
            .iter()
            .map(|(_, id)| *id)
            .collect();
        for child in children {
            if let Some(slot) = self.node(child).slot(side).cloned() {
                if !slot.delete {
                    let tombstone = Update {
                        path: String::new(),
                        mod_time: slot.mod_time,
                        is_directory: slot.is_directory,
                        symlink_target: String::new(),
                        is_executable: false,
                        delete: true,
                        data: None,
                        ignore_string: String::new(),
                        local: slot.local,
                    };
                    match side {
                        Side::Local => self.node_mut(child).local = Some(tombstone),
                        Side::Remote => self.node_mut(child).remote = Some(tombstone),
                    }
                    self.mark_dirty(child);
                }
            }
            self.cascade_delete_descendants(child, side);
        }
    }

    fn mark_dirty(&mut self, node_id: NodeId) {
        self.node_mut(node_id).is_dirty = true;
        let mut current = self.node(node_id).parent;
        while let Some(id) = current {
            let node = self.node_mut(id);
            if node.has_dirty_descendant {
                break;
            }
            node.has_dirty_descendant = true;
            current = node.parent;
        }
    }

    /// Rebuild `parent`'s ignore rules from whichever side of its
    /// `.gitignore` child is newer, and invalidate the memoized
    /// `should_ignore` verdict for the whole subtree rooted at `parent`.
    fn refresh_ignore_rules(&mut self, parent: NodeId) {
        let gitignore_child = self
            .node(parent)
            .children
            .iter()
            .find(|(name, _)| name == ".gitignore")
            .map(|(_, id)| *id);

        let Some(gitignore_id) = gitignore_child else {
            return;
        };
        let node = self.node(gitignore_id);
        let now_ms = current_millis();
        let winner = if raw_newer(node.local.as_ref(), node.remote.as_ref(), now_ms) {
            node.local.as_ref()
        } else {
            node.remote.as_ref()
        };

        let rules = match winner {
            Some(u) if !u.delete => PathRules::compile(&u.ignore_string).unwrap_or_else(|e| {
                tracing::warn!("invalid .gitignore content, ignoring: {e}");
                PathRules::empty()
            }),
            _ => PathRules::empty(),
        };

        self.node_mut(parent).ignore_rules = Some(rules);
        self.invalidate_should_ignore_subtree(parent);
    }

    fn invalidate_should_ignore_subtree(&mut self, node_id: NodeId) {
        self.node(node_id).should_ignore.set(None);
        let children: Vec<NodeId> = self
            .node(node_id)
            .children
            .iter()
            .map(|(_, id)| *id)
            .collect();
        for child in children {
            self.invalidate_should_ignore_subtree(child);
        }
    }

    /// §4.2 newer-than comparison, local's perspective, with no-op
    /// suppression applied.
    pub fn is_local_newer(&self, node_id: NodeId, now_ms: i64) -> bool {
        let node = self.node(node_id);
        if suppressed(node.local.as_ref(), node.remote.as_ref()) {
            return false;
        }
        raw_newer(node.local.as_ref(), node.remote.as_ref(), now_ms)
    }

    /// Symmetric to `is_local_newer`.
    pub fn is_remote_newer(&self, node_id: NodeId, now_ms: i64) -> bool {
        let node = self.node(node_id);
        if suppressed(node.remote.as_ref(), node.local.as_ref()) {
            return false;
        }
        raw_newer(node.remote.as_ref(), node.local.as_ref(), now_ms)
    }

    /// §4.3 ignore inheritance: ignored if any ancestor is itself ignored,
    /// or any ancestor's own rules match (tested relative to that
    /// ancestor), or the mount-wide excludes match — unless the mount-wide
    /// includes override. Memoized per node.
    pub fn should_ignore(&self, node_id: NodeId, extra_includes: &PathRules, extra_excludes: &PathRules) -> bool {
        if let Some(cached) = self.node(node_id).should_ignore.get() {
            return cached;
        }
        let result = self.compute_should_ignore(node_id, extra_includes, extra_excludes);
        self.node(node_id).should_ignore.set(Some(result));
        result
    }

    fn compute_should_ignore(&self, node_id: NodeId, extra_includes: &PathRules, extra_excludes: &PathRules) -> bool {
        let full_path = self.path_of(node_id);
        // A node with no slot of its own is a path component that exists
        // only because some descendant needed it to exist (§3 invariant 1:
        // ancestor nodes are created on demand) — it can only be a
        // directory, never a file or symlink, so it must answer `is_dir`
        // queries as one. Otherwise a directory-only exclude pattern (e.g.
        // `target/`) could never match the ancestor directly and ignore
        // inheritance would silently stop at the first un-seeded ancestor.
        let is_dir = self
            .node(node_id)
            .either_kind()
            .map(|k| k == NodeType::Directory)
            .unwrap_or(true);

        // "If any ancestor is itself ignored, this node is ignored" (§4.3)
        // is recursive, not just a rule-text check against each ancestor:
        // an ancestor can be ignored by *its own* parent, or by the
        // mount-wide extra-excludes, without having any `ignore_rules` of
        // its own. Recursing through `should_ignore` (memoized, so this
        // walk is amortized O(depth) overall) propagates that down instead
        // of only checking each ancestor's own PathRules in isolation.
        let mut any_parent_ignores = false;
        let mut current = self.node(node_id).parent;
        while let Some(ancestor_id) = current {
            if self.should_ignore(ancestor_id, extra_includes, extra_excludes) {
                any_parent_ignores = true;
                break;
            }
            let ancestor = self.node(ancestor_id);
            if let Some(rules) = &ancestor.ignore_rules {
                let ancestor_path = self.path_of(ancestor_id);
                let relative = relative_to(&full_path, &ancestor_path);
                if rules.matches(&relative, is_dir) {
                    any_parent_ignores = true;
                    break;
                }
            }
            current = ancestor.parent;
        }

        let extra_exclude_hit = extra_excludes.matches(&full_path, is_dir);
        let extra_include_hit = extra_includes.matches(&full_path, is_dir);
        (any_parent_ignores || extra_exclude_hit) && !extra_include_hit
    }

    /// Breadth-first from root; returns nodes with `isDirty` set, clearing
    /// `isDirty`/`hasDirtyDescendant` on every node visited. Descent into
    /// a subtree is skipped once `hasDirtyDescendant` is false, per spec.
    pub fn take_dirty_nodes(&mut self) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.root);

        while let Some(id) = queue.pop_front() {
            let (is_dirty, has_dirty_descendant, children) = {
                let node = self.node(id);
                (
                    node.is_dirty,
                    node.has_dirty_descendant,
                    node.children.iter().map(|(_, c)| *c).collect::<Vec<_>>(),
                )
            };
            if is_dirty {
                result.push(id);
            }
            {
                let node = self.node_mut(id);
                node.is_dirty = false;
                node.has_dirty_descendant = false;
            }
            if has_dirty_descendant {
                queue.extend(children);
            }
        }
        result
    }

    /// Unconditional walk (debugging, ignore-rule invalidation).
    pub fn visit_all(&self, mut f: impl FnMut(NodeId, &Node)) {
        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        while let Some(id) = queue.pop_front() {
            let node = self.node(id);
            f(id, node);
            queue.extend(node.children.iter().map(|(_, c)| *c));
        }
    }

    pub fn set_awaiting_data(&mut self, node_id: NodeId, awaiting: bool) {
        self.node_mut(node_id).awaiting_data = awaiting;
    }
}

impl Default for UpdateTree {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> Result<(), SyncError> {
    if path.is_empty() {
        return Ok(());
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(SyncError::Malformed {
            path: path.to_string(),
            reason: "path must not have a leading or trailing slash".to_string(),
        });
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(SyncError::Malformed {
            path: path.to_string(),
            reason: "path must not contain empty segments or `..`".to_string(),
        });
    }
    if path.len() > 4096 {
        return Err(SyncError::Malformed {
            path: path.to_string(),
            reason: "path exceeds length bound".to_string(),
        });
    }
    Ok(())
}
