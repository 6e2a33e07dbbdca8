//! Session (§4.6): handshake, seed exchange, and the steady-state worker
//! topology wired around one connection to a peer.
//!
//! Grounded on the teacher's `cli::serve::run`, which wires a
//! `tokio::runtime::Runtime`, spawns the watcher on a plain OS thread, and
//! drives an async server loop on top — generalized here to two
//! cooperating sides instead of one server answering read-only queries.
//! The four queues from `queue` are distributed one receiver per worker at
//! construction time (each is a single-consumer channel); only the
//! `Queues`-returned senders are cloned across threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc as tokio_mpsc;

use crate::config::Config;
use crate::fsaccess::FileAccess;
use crate::proto::{
    is_keepalive, is_seed_complete, make_keepalive, make_seed_complete, Handshake, UpdateStream,
    DEFAULT_MAX_FRAME_LENGTH,
};
use crate::queue::{IncomingEvent, OutgoingFrame, Origin, Queues};
use crate::rules::PathRules;
use crate::save_local::{Committed, SaveToLocal};
use crate::save_remote::SaveToRemote;
use crate::sync_logic::SyncLogic;
use crate::tree::{NodeType, Update};
use crate::watcher::FileWatcher;

/// How often the sync worker re-checks the tree for dirty nodes even when
/// `incomingQueue` is quiet (§4.3: "a diff tick... batched every tick, at
/// most every 100ms").
const DIFF_TICK: Duration = Duration::from_millis(100);

/// Bounded wait workers use between polls of the stop flag, so shutdown
/// (§5 cancellation) never waits longer than this to notice.
const STOP_POLL: Duration = Duration::from_millis(200);

/// Keep-alive cadence (§5 timeouts: "send a probe every 20 seconds").
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// How long a silent peer is tolerated before the connection is considered
/// dead (§5: "disconnect if no response within 5 seconds" of a probe).
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(25);

/// Shared backlog counters a running session exposes to its `SessionHandle`
/// (§4.7 admin query: `incomingQueue` and `saveToRemote` sizes).
#[derive(Clone, Default)]
struct BacklogCounters {
    incoming: Arc<AtomicUsize>,
    save_to_remote: Arc<AtomicUsize>,
}

/// A cancellable, queryable reference to a session running on its own
/// thread (`Session::spawn`). Dropping this does not stop the session —
/// call `request_stop` explicitly, then join the thread handle returned
/// alongside it.
pub struct SessionHandle {
    stop: Arc<AtomicBool>,
    backlog: BacklogCounters,
}

impl SessionHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// `(incomingQueue backlog, saveToRemote backlog)` — the two queues
    /// §4.7's admin query reports.
    pub fn backlog_sizes(&self) -> (usize, usize) {
        (
            self.backlog.incoming.load(Ordering::Relaxed),
            self.backlog.save_to_remote.load(Ordering::Relaxed),
        )
    }
}

/// Exchange handshakes over an already-connected transport (§4.6 step 1)
/// and return what the peer sent. Split out of `Session` so `server` can
/// learn a connecting peer's `mount_key` — needed to key its session
/// table and evict a stale session on reconnect — before committing to
/// running a full session against it.
pub async fn exchange_handshake<T: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut UpdateStream<T>,
    config: &Config,
) -> Result<Handshake> {
    stream
        .send_handshake(&Handshake {
            mount_key: config.mount_key.clone(),
            remote_root: config.remote_root.clone(),
            compression_requested: false,
        })
        .await
        .context("sending handshake")?;
    let peer = stream.recv_handshake().await.context("receiving handshake")?;
    stream.set_compression(false);
    Ok(peer)
}

/// Everything needed to run one side of a mirrored mount against a
/// connected peer. `run` drives the session to completion (stream closed,
/// transport error, or external stop).
pub struct Session<T, W, A> {
    stream: UpdateStream<T>,
    peer: Handshake,
    config: Config,
    watcher: W,
    access: A,
}

impl<T, W, A> Session<T, W, A>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: FileWatcher + 'static,
    A: FileAccess + Clone + 'static,
{
    /// Build a session over a transport that has not yet exchanged
    /// handshakes — the common client-side path (`cli::mirror`), where
    /// nothing needs to inspect the peer's identity before running.
    pub async fn connect(transport: T, config: Config, watcher: W, access: A) -> Result<Self> {
        let mut stream = UpdateStream::new(transport, DEFAULT_MAX_FRAME_LENGTH);
        let peer = exchange_handshake(&mut stream, &config).await?;
        Ok(Self::from_handshaked(stream, peer, config, watcher, access))
    }

    /// Build a session over a transport whose handshake has already been
    /// exchanged by the caller (`server`, which needs the peer's
    /// `mount_key` before it can decide whether to evict an existing
    /// session).
    pub fn from_handshaked(
        stream: UpdateStream<T>,
        peer: Handshake,
        config: Config,
        watcher: W,
        access: A,
    ) -> Self {
        Self {
            stream,
            peer,
            config,
            watcher,
            access,
        }
    }

    /// Run the session to completion on a dedicated Tokio runtime, the
    /// same shape as the teacher's `cli::serve::run` (build a runtime,
    /// `block_on` the async server). Returns once the transport closes or
    /// a fatal error tears everything down. For the single-mount CLI path
    /// (`cli::mirror`), where nothing else needs to observe or cancel the
    /// session from outside.
    pub fn run(self) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let backlog = BacklogCounters::default();
        let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
        rt.block_on(self.run_async(stop, backlog))
    }

    /// Run on a dedicated OS thread, returning immediately with a join
    /// handle and a `SessionHandle` the caller can use to request
    /// cancellation or read queue backlog sizes (§4.7: the server's
    /// per-mount admin query). Used by `server`, which needs to keep
    /// running while sessions come and go underneath it.
    pub fn spawn(self) -> (std::thread::JoinHandle<Result<()>>, SessionHandle)
    where
        T: Send,
        W: Send,
        A: Send,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let backlog = BacklogCounters::default();
        let handle = SessionHandle {
            stop: stop.clone(),
            backlog: backlog.clone(),
        };
        let join = std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            rt.block_on(self.run_async(stop, backlog))
        });
        (join, handle)
    }

    async fn run_async(self, stop: Arc<AtomicBool>, backlog: BacklogCounters) -> Result<()> {
        let Session {
            mut stream,
            peer,
            config,
            mut watcher,
            access,
        } = self;

        tracing::info!(
            mount_key = %config.mount_key,
            peer_mount_key = %peer.mount_key,
            peer_remote_root = %peer.remote_root,
            "session handshake complete"
        );

        let extra_includes =
            PathRules::compile(&config.includes.join("\n")).context("compiling include rules")?;
        let extra_excludes =
            PathRules::compile(&config.excludes.join("\n")).context("compiling exclude rules")?;
        let logic = SyncLogic::new(extra_includes, extra_excludes, config.debug_prefixes.clone());

        let queues = Queues::new();
        let (incoming_tx, incoming_rx, save_to_local_tx, save_to_local_rx, save_to_remote_tx, save_to_remote_rx, outgoing_tx, outgoing_rx) =
            queues.into_parts();

        let (committed_tx, committed_rx) = std_mpsc::channel::<Committed>();

        // One-time initial scan (§6 FileWatcher: "Snapshot of the mount
        // root"), run off the async executor since it does blocking I/O.
        let (mut watcher, scan) = tokio::task::spawn_blocking(move || -> Result<_> {
            watcher.on_start()?;
            let scan = watcher.perform_initial_scan()?;
            Ok((watcher, scan))
        })
        .await
        .context("initial scan task panicked")??;

        // §4.6 step 2: stream our own seed to the peer — metadata only,
        // real file bodies follow later via body-request (§6).
        for update in &scan {
            stream
                .send_update(&seed_shadow(update))
                .await
                .context("streaming local seed")?;
        }
        stream
            .send_update(&make_seed_complete(crate::tree::current_millis()))
            .await
            .context("sending seed-complete marker")?;

        // Feed our own scan into the tree exactly like any other
        // local-origin event, through the same `incomingQueue` steady
        // state uses — seeding is not a distinct code path on this side.
        for update in scan {
            if incoming_tx
                .put(IncomingEvent { update, origin: Origin::Local })
                .is_err()
            {
                anyhow::bail!("incoming queue closed before session started");
            }
        }

        // --- spawn workers ---

        let watcher_stop = stop.clone();
        let watcher_incoming = incoming_tx.clone();
        let watcher_handle = std::thread::spawn(move || {
            while !watcher_stop.load(Ordering::Relaxed) {
                match watcher.run_one_loop(&watcher_incoming) {
                    Ok(Some(wait)) => std::thread::sleep(wait.min(STOP_POLL)),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("file watcher error: {e:#}"),
                }
            }
            let _ = watcher.on_stop();
        });

        let sync_stop = stop.clone();
        let sync_backlog = backlog.clone();
        let sync_handle = std::thread::spawn(move || {
            run_sync_worker(
                logic,
                incoming_rx,
                committed_rx,
                save_to_local_tx,
                save_to_remote_tx,
                &sync_stop,
                &sync_backlog,
            )
        });

        let save_local_stop = stop.clone();
        let save_local_access = access.clone();
        let save_local_handle = std::thread::spawn(move || {
            let saver = SaveToLocal::new(save_local_access);
            let committed_tx = committed_tx;
            if let Err(e) = saver.run_with_stop(&save_to_local_rx, &save_local_stop, |c| {
                let _ = committed_tx.send(c);
            }) {
                tracing::error!("saveToLocal worker stopped on fatal error: {e:#}");
            }
        });

        let save_remote_stop = stop.clone();
        let outgoing_sender = outgoing_tx.clone();
        let save_remote_handle = std::thread::spawn(move || {
            let saver = SaveToRemote::new(access);
            saver.run_with_stop(&save_to_remote_rx, &outgoing_sender, &save_remote_stop);
        });

        // Bridge the synchronous `outgoingQueue` onto an async channel the
        // write task can `.await` on (§5: the async boundary is only the
        // transport itself).
        let (bridge_tx, mut bridge_rx) = tokio_mpsc::unbounded_channel::<OutgoingFrame>();
        let bridge_stop = stop.clone();
        let bridge_handle = std::thread::spawn(move || {
            while !bridge_stop.load(Ordering::Relaxed) {
                if let Some(frame) = outgoing_rx.take_timeout(STOP_POLL) {
                    if bridge_tx.send(frame).is_err() {
                        break;
                    }
                }
            }
        });

        let result = async {
            let mut keepalive_ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut silence = tokio::time::interval(Duration::from_secs(1));
            let mut since_last_frame = Duration::ZERO;

            loop {
                tokio::select! {
                    _ = keepalive_ticker.tick() => {
                        stream.send_update(&make_keepalive()).await.context("sending keepalive probe")?;
                    }
                    _ = silence.tick() => {
                        since_last_frame += Duration::from_secs(1);
                        if since_last_frame > KEEPALIVE_TIMEOUT {
                            anyhow::bail!("peer silent for {since_last_frame:?}, disconnecting");
                        }
                    }
                    sent = bridge_rx.recv() => {
                        match sent {
                            Some(frame) => stream.send_update(&frame.update).await.context("writing outgoing frame")?,
                            None => break,
                        }
                    }
                    received = stream.recv_update() => {
                        since_last_frame = Duration::ZERO;
                        match received? {
                            None => break,
                            Some(update) if is_keepalive(&update) => {
                                tracing::trace!("received keepalive probe");
                            }
                            Some(update) if is_seed_complete(&update) => {
                                tracing::debug!("peer finished streaming its seed");
                            }
                            Some(update) => {
                                let tx = incoming_tx.clone();
                                tokio::task::block_in_place(|| {
                                    let _ = tx.put(IncomingEvent { update, origin: Origin::Remote });
                                });
                            }
                        }
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop.store(true, Ordering::Relaxed);
        for handle in [watcher_handle, sync_handle, save_local_handle, save_remote_handle, bridge_handle] {
            let _ = handle.join();
        }

        result
    }
}

/// Turn a real scan entry into the metadata-only shadow a seed streams
/// over the wire (§4.6: "the seed omits data and instead sets data =
/// initialSyncMarker as a placeholder").
fn seed_shadow(update: &Update) -> Update {
    let mut shadow = update.clone();
    shadow.local = false;
    if shadow.kind() == NodeType::File && !shadow.delete {
        shadow.data = Some(crate::proto::INITIAL_SYNC_MARKER.to_vec());
    }
    shadow
}

/// Owns the `UpdateTree` exclusively (§5): drains `incomingQueue`, folds in
/// commit notifications, and runs a diff pass on a fixed tick regardless of
/// whether anything arrived — §4.3's "at most every 100ms" cadence also
/// covers the initial reconciliation, since every seeded entry becomes a
/// dirty node the first time it is added.
fn run_sync_worker(
    mut logic: SyncLogic,
    incoming_rx: crate::queue::QueueReceiver<IncomingEvent>,
    committed_rx: std_mpsc::Receiver<Committed>,
    save_to_local_tx: crate::queue::QueueSender<Update>,
    save_to_remote_tx: crate::queue::QueueSender<Update>,
    stop: &AtomicBool,
    backlog: &BacklogCounters,
) {
    while !stop.load(Ordering::Relaxed) {
        backlog.incoming.store(incoming_rx.len(), Ordering::Relaxed);
        backlog
            .save_to_remote
            .store(save_to_remote_tx.len(), Ordering::Relaxed);

        let mut to_remote_from_events = Vec::new();

        if let Some(event) = incoming_rx.take_timeout(DIFF_TICK) {
            logic.handle_incoming(event, &mut to_remote_from_events);
        }
        while let Ok(committed) = committed_rx.try_recv() {
            logic.note_committed(committed);
        }

        for update in to_remote_from_events {
            if save_to_remote_tx.put(update).is_err() {
                return;
            }
        }

        let (to_local, to_remote) = logic.diff_pass();
        for update in to_local {
            if save_to_local_tx.put(update).is_err() {
                return;
            }
        }
        for update in to_remote {
            if save_to_remote_tx.put(update).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, mod_time: i64, data: &[u8]) -> Update {
        Update {
            path: path.to_string(),
            mod_time,
            is_directory: false,
            symlink_target: String::new(),
            is_executable: false,
            delete: false,
            data: Some(data.to_vec()),
            ignore_string: String::new(),
            local: true,
        }
    }

    #[test]
    fn seed_shadow_replaces_file_body_with_sentinel() {
        let update = file("big.bin", 5000, b"real contents");
        let shadow = seed_shadow(&update);
        assert_eq!(shadow.data.as_deref(), Some(crate::proto::INITIAL_SYNC_MARKER));
        assert!(!shadow.local);
    }

    #[test]
    fn seed_shadow_leaves_directories_untouched() {
        let mut dir = file("src", 5000, b"");
        dir.is_directory = true;
        dir.data = None;
        let shadow = seed_shadow(&dir);
        assert!(shadow.data.is_none());
    }

    #[test]
    fn seed_shadow_leaves_deletes_untouched() {
        let mut deletion = file("gone.txt", 5000, b"");
        deletion.delete = true;
        deletion.data = None;
        let shadow = seed_shadow(&deletion);
        assert!(shadow.data.is_none());
    }

    /// A file seed shares the sentinel-body shape of a body-request
    /// (§6), but carries the real mod_time from the scan, so it must
    /// never be classified as one on the receiving end.
    #[test]
    fn seed_shadow_is_not_mistaken_for_a_body_request() {
        let update = file("big.bin", 5000, b"real contents");
        let shadow = seed_shadow(&update);
        assert!(!crate::proto::is_body_request(&shadow));
    }
}
