//! Server (§4.7): accepts connections, holds at most one running `Session`
//! per mount key, and answers the administrative backlog query.
//!
//! Generalizes the teacher's `MountTable` — a `HashMap` keyed by canonical
//! root path that refuses a second mount of the same directory — to a table
//! keyed by `mount_key` instead of path, where a second connect for a key
//! already in use evicts the first rather than erroring: a peer losing its
//! network and reconnecting is the common case here, not a mistake to
//! reject.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::fsaccess::LocalFileAccess;
use crate::proto::{UpdateStream, DEFAULT_MAX_FRAME_LENGTH};
use crate::session::{exchange_handshake, Session, SessionHandle};
use crate::watcher::NotifyFileWatcher;

/// One mount this server is willing to run a session for, keyed by its
/// `mount_key`. Holds the `Config` template used to build a fresh
/// `Session` each time a peer connects for that key.
struct KnownMount {
    config: Config,
}

struct RunningSession {
    join: std::thread::JoinHandle<Result<()>>,
    handle: SessionHandle,
}

/// Holds every mount this server answers for, plus whichever session is
/// currently running against each. A mount with no running session simply
/// has no entry in `running`.
pub struct Server {
    known: HashMap<String, KnownMount>,
    running: Mutex<HashMap<String, RunningSession>>,
}

impl Server {
    /// Build a server that accepts connections for exactly the mount keys
    /// present in `configs`, one `Config` per key.
    pub fn new(configs: Vec<Config>) -> Self {
        let known = configs
            .into_iter()
            .map(|config| (config.mount_key.clone(), KnownMount { config }))
            .collect();
        Self {
            known,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Accept connections on `listen_addr` until the process is killed.
    /// Each accepted connection runs its handshake inline (so a malformed
    /// or unknown peer never blocks the accept loop past the handshake
    /// itself) before being handed off to its own `Session` thread.
    pub async fn serve(&self, listen_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        tracing::info!(%listen_addr, "server listening");

        loop {
            let (socket, peer_addr) = listener.accept().await.context("accepting connection")?;
            tracing::debug!(%peer_addr, "accepted connection");
            if let Err(e) = self.accept_one(socket).await {
                tracing::warn!(%peer_addr, "connection setup failed: {e:#}");
            }
        }
    }

    /// Handshake a single accepted connection, match it against a known
    /// mount key, evict any session already running for that key, and
    /// start a new one in its place.
    async fn accept_one(&self, socket: TcpStream) -> Result<()> {
        // The handshake needs *some* Config to send back (mount_key,
        // remote_root); none of our known mounts is privileged over the
        // others for this, so any one works until we've seen the peer's
        // key and picked the real match.
        let probe_config = self
            .known
            .values()
            .next()
            .map(|m| m.config.clone())
            .context("server has no configured mounts")?;

        let mut stream = UpdateStream::new(socket, DEFAULT_MAX_FRAME_LENGTH);
        let peer = exchange_handshake(&mut stream, &probe_config).await?;

        let Some(known) = self.known.get(&peer.mount_key) else {
            anyhow::bail!("peer requested unknown mount key {:?}", peer.mount_key);
        };

        self.evict(&peer.mount_key);

        let config = known.config.clone();
        let watcher = NotifyFileWatcher::new(&config.mount_root);
        // `evict` above already stopped and joined any session we were
        // previously running for this key, releasing its lock, so this
        // acquisition only fails against a genuinely unrelated holder.
        let access = LocalFileAccess::locked(&config.mount_root)
            .with_context(|| format!("mount root {:?} already locked", config.mount_root))?;
        let session = Session::from_handshaked(stream, peer.clone(), config, watcher, access);
        let (join, handle) = session.spawn();

        self.running
            .lock()
            .expect("session table poisoned")
            .insert(peer.mount_key.clone(), RunningSession { join, handle });
        Ok(())
    }

    /// Stop and join whatever session is currently running for `mount_key`,
    /// if any (§4.7: "a second connect attempt for the same key evicts the
    /// previous").
    fn evict(&self, mount_key: &str) {
        let previous = self
            .running
            .lock()
            .expect("session table poisoned")
            .remove(mount_key);
        if let Some(previous) = previous {
            tracing::info!(mount_key, "evicting existing session for reconnect");
            previous.handle.request_stop();
            if let Err(e) = previous.join.join() {
                tracing::warn!(mount_key, "evicted session thread panicked: {e:?}");
            }
        }
    }

    /// Current `(incoming, saveToRemote)` backlog for a running mount, or
    /// `None` if nothing is currently connected for that key (§4.7 admin
    /// query).
    pub fn backlog_sizes(&self, mount_key: &str) -> Option<(usize, usize)> {
        self.running
            .lock()
            .expect("session table poisoned")
            .get(mount_key)
            .map(|running| running.handle.backlog_sizes())
    }

    /// Mount keys with a session currently running.
    pub fn active_mount_keys(&self) -> Vec<String> {
        self.running
            .lock()
            .expect("session table poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_has_no_running_sessions() {
        let server = Server::new(vec![Config::default()]);
        assert!(server.active_mount_keys().is_empty());
        assert_eq!(server.backlog_sizes("default"), None);
    }
}
