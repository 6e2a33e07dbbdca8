//! Queues (§2, §5): the four bounded FIFO channels wiring FileWatcher,
//! SyncLogic, SaveToLocal, SaveToRemote and the transport together.
//!
//! Built on `std::sync::mpsc::sync_channel`, not `tokio::sync::mpsc`: every
//! queue here is drained by a worker doing blocking filesystem syscalls
//! (§5, "suspension points... confined to queue put/take, filesystem
//! syscalls, network I/O"), the same shape as the teacher's
//! `cli::serve::run`, which spawns its watcher on a plain
//! `std::thread::spawn` rather than a tokio task. The async transport side
//! (`proto`, `session`) bridges into this with `tokio::task::spawn_blocking`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use crate::tree::Update;

/// Default capacity for `incomingQueue` (§5): large enough that a burst of
/// filesystem events from an initial scan never blocks the watcher.
pub const DEFAULT_INCOMING_CAPACITY: usize = 1_000_000;

/// Default capacity for the three output-side queues — smaller, since a
/// full one means a genuinely slow disk or network, and backpressure
/// should reach the source quickly.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 10_000;

/// Which side an `incomingQueue` event originated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One entry on `incomingQueue`: an Update plus where it came from.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub update: Update,
    pub origin: Origin,
}

/// A framed Update ready to leave over the wire, after `SaveToRemote` has
/// attached any file body it needed to read from disk.
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    pub update: Update,
}

/// The producing half of a bounded queue, shared by whichever workers
/// feed it (FileWatcher and the transport's receive worker both hold a
/// clone of `incoming`'s sender). Tracks a live count alongside the
/// channel, since `std::sync::mpsc` exposes no `len()` and the admin
/// query in §4.7 needs backlog sizes without draining anything.
pub struct QueueSender<T> {
    tx: SyncSender<T>,
    len: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            len: self.len.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Blocks the calling thread until there is room (§5: "producers
    /// block on put when full — this provides natural backpressure").
    /// Fails only once the receiving worker has been dropped (shutdown).
    pub fn put(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.0)?;
        self.len.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Current backlog, shared with the matching `QueueReceiver` via the
    /// same counter — readable from either end.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }
}

pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    len: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Blocks until an item is available or the channel is closed.
    pub fn take(&self) -> Option<T> {
        let item = self.rx.recv().ok()?;
        self.len.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    /// Bounded wait, used by workers that also need to notice a stop
    /// signal between items (§5 cancellation: "finishes its current loop
    /// iteration then exits").
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                Some(item)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }
}

fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let len = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            len: len.clone(),
        },
        QueueReceiver { rx, len },
    )
}

/// Owns the sending and receiving halves of all four queues for one side
/// of a session. Construction wires exactly the topology in §2's data-flow
/// diagram; nothing else touches these channels directly.
pub struct Queues {
    incoming_tx: QueueSender<IncomingEvent>,
    incoming_rx: QueueReceiver<IncomingEvent>,
    save_to_local_tx: QueueSender<Update>,
    save_to_local_rx: QueueReceiver<Update>,
    save_to_remote_tx: QueueSender<Update>,
    save_to_remote_rx: QueueReceiver<Update>,
    outgoing_tx: QueueSender<OutgoingFrame>,
    outgoing_rx: QueueReceiver<OutgoingFrame>,
}

impl Queues {
    pub fn new() -> Self {
        Self::with_capacities(
            DEFAULT_INCOMING_CAPACITY,
            DEFAULT_OUTPUT_CAPACITY,
            DEFAULT_OUTPUT_CAPACITY,
            DEFAULT_OUTPUT_CAPACITY,
        )
    }

    pub fn with_capacities(
        incoming: usize,
        save_to_local: usize,
        save_to_remote: usize,
        outgoing: usize,
    ) -> Self {
        let (incoming_tx, incoming_rx) = bounded(incoming);
        let (save_to_local_tx, save_to_local_rx) = bounded(save_to_local);
        let (save_to_remote_tx, save_to_remote_rx) = bounded(save_to_remote);
        let (outgoing_tx, outgoing_rx) = bounded(outgoing);
        Self {
            incoming_tx,
            incoming_rx,
            save_to_local_tx,
            save_to_local_rx,
            save_to_remote_tx,
            save_to_remote_rx,
            outgoing_tx,
            outgoing_rx,
        }
    }

    pub fn incoming_sender(&self) -> QueueSender<IncomingEvent> {
        self.incoming_tx.clone()
    }

    pub fn incoming_receiver(&self) -> &QueueReceiver<IncomingEvent> {
        &self.incoming_rx
    }

    pub fn save_to_local_sender(&self) -> QueueSender<Update> {
        self.save_to_local_tx.clone()
    }

    pub fn save_to_local_receiver(&self) -> &QueueReceiver<Update> {
        &self.save_to_local_rx
    }

    pub fn save_to_remote_sender(&self) -> QueueSender<Update> {
        self.save_to_remote_tx.clone()
    }

    pub fn save_to_remote_receiver(&self) -> &QueueReceiver<Update> {
        &self.save_to_remote_rx
    }

    pub fn outgoing_sender(&self) -> QueueSender<OutgoingFrame> {
        self.outgoing_tx.clone()
    }

    pub fn outgoing_receiver(&self) -> &QueueReceiver<OutgoingFrame> {
        &self.outgoing_rx
    }

    /// Current backlog on the two queues the admin query in §4.7 reports:
    /// `(incoming, saveToRemote)`.
    pub fn backlog_sizes(&self) -> (usize, usize) {
        (self.incoming_rx.len(), self.save_to_remote_rx.len())
    }

    /// Consume `self` and hand back every sender/receiver by value.
    ///
    /// `std::sync::mpsc::Receiver` (and so `QueueReceiver`) is `Send` but
    /// not `Sync`, so a shared `&Queues` cannot be handed to more than one
    /// OS thread — each receiver must be owned outright by the single
    /// worker thread that drains it (`session` distributes these at
    /// construction time: one receiver per worker, senders cloned freely
    /// wherever something produces onto that queue).
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        QueueSender<IncomingEvent>,
        QueueReceiver<IncomingEvent>,
        QueueSender<Update>,
        QueueReceiver<Update>,
        QueueSender<Update>,
        QueueReceiver<Update>,
        QueueSender<OutgoingFrame>,
        QueueReceiver<OutgoingFrame>,
    ) {
        (
            self.incoming_tx,
            self.incoming_rx,
            self.save_to_local_tx,
            self.save_to_local_rx,
            self.save_to_remote_tx,
            self.save_to_remote_rx,
            self.outgoing_tx,
            self.outgoing_rx,
        )
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}
