//! Event schema, listener traits, and the single-consumer queue.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use ember_core::amount::Amount;
use ember_core::error::BlockError;
use ember_core::types::{Block, Hash256, Transaction};

/// Why a transaction left the mempool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// Aged past the expiry cutoff.
    Expiry,
    /// Evicted to bring memory usage under the limit.
    SizeLimit,
    /// Removed while reorganising the chain.
    Reorg,
    /// A conflicting transaction spent one of its inputs.
    Conflict,
    /// Confirmed in a connected block.
    Block,
    /// Replaced by another transaction.
    Replaced,
}

/// A queued notification.
///
/// Transactions and blocks are reference-counted: the queue shares them
/// with the pool entry and any outstanding block templates.
#[derive(Clone, Debug)]
pub enum Notification {
    TransactionAdded {
        tx: Arc<Transaction>,
        fee: Amount,
        vsize: u64,
        valid_for_estimation: bool,
    },
    TransactionRemoved {
        tx: Arc<Transaction>,
        reason: RemovalReason,
    },
    MempoolUpdatedForBlockConnect {
        removed_in_block: Vec<Arc<Transaction>>,
        removed_conflicted: Vec<Arc<Transaction>>,
    },
    BlockConnected {
        block: Arc<Block>,
        height: u64,
    },
    BlockDisconnected {
        block: Arc<Block>,
    },
    UpdatedTip {
        new_tip: Hash256,
        fork_point: Hash256,
        initial_download: bool,
    },
    NewPowValidBlock {
        height: u64,
        block: Arc<Block>,
    },
    BlockChecked {
        block_hash: Hash256,
        result: Result<(), BlockError>,
    },
}

/// Callbacks about transactions entering and leaving the mempool.
///
/// All methods default to no-ops so listeners implement only what they
/// need. Called on the queue's background thread, never under a core lock.
pub trait MempoolListener: Send + Sync {
    fn transaction_added(
        &self,
        _tx: &Arc<Transaction>,
        _fee: Amount,
        _vsize: u64,
        _valid_for_estimation: bool,
    ) {
    }

    /// Fires for expiry, size limiting, reorg, and replacement removals.
    /// Transactions leaving because a block confirmed or conflicted them
    /// are reported through
    /// [`mempool_updated_for_block_connect`](Self::mempool_updated_for_block_connect)
    /// instead.
    fn transaction_removed(&self, _tx: &Arc<Transaction>, _reason: RemovalReason) {}

    /// Delivered strictly before the matching
    /// [`ChainListener::block_connected`] for dual listeners.
    fn mempool_updated_for_block_connect(
        &self,
        _removed_in_block: &[Arc<Transaction>],
        _removed_conflicted: &[Arc<Transaction>],
    ) {
    }
}

/// Callbacks about block connection and disconnection.
///
/// The ordering of [`block_disconnected`](Self::block_disconnected) and
/// reorg-reason [`MempoolListener::transaction_removed`] events is
/// deliberately unspecified; listeners that need totality must order by
/// block height themselves.
pub trait ChainListener: Send + Sync {
    fn block_connected(&self, _block: &Arc<Block>, _height: u64) {}
    fn block_disconnected(&self, _block: &Arc<Block>) {}
    fn updated_tip(&self, _new_tip: Hash256, _fork_point: Hash256, _initial_download: bool) {}
    fn new_pow_valid_block(&self, _height: u64, _block: &Arc<Block>) {}
    fn block_checked(&self, _block_hash: Hash256, _result: &Result<(), BlockError>) {}
}

enum QueueItem {
    Event(Notification),
    Barrier(mpsc::SyncSender<()>),
    Stop,
}

type Listeners<T> = Arc<RwLock<Vec<Arc<T>>>>;

/// Single-consumer notification queue.
///
/// `enqueue` is cheap and safe to call while holding core locks; dispatch
/// happens on a dedicated background thread in strict FIFO order. Events
/// are never coalesced or reordered.
pub struct NotificationQueue {
    sender: mpsc::Sender<QueueItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
    mempool_listeners: Listeners<dyn MempoolListener>,
    chain_listeners: Listeners<dyn ChainListener>,
}

impl NotificationQueue {
    /// Create the queue and start its background worker.
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<QueueItem>();
        let mempool_listeners: Listeners<dyn MempoolListener> =
            Arc::new(RwLock::new(Vec::new()));
        let chain_listeners: Listeners<dyn ChainListener> = Arc::new(RwLock::new(Vec::new()));

        let worker_mempool = Arc::clone(&mempool_listeners);
        let worker_chain = Arc::clone(&chain_listeners);
        let worker = std::thread::Builder::new()
            .name("ember-notify".into())
            .spawn(move || {
                while let Ok(item) = receiver.recv() {
                    match item {
                        QueueItem::Event(event) => {
                            dispatch(&worker_mempool, &worker_chain, &event)
                        }
                        QueueItem::Barrier(done) => {
                            // All earlier callbacks have completed by now.
                            let _ = done.send(());
                        }
                        QueueItem::Stop => break,
                    }
                }
            })
            .expect("spawn notification worker");

        Arc::new(Self {
            sender,
            worker: Mutex::new(Some(worker)),
            mempool_listeners,
            chain_listeners,
        })
    }

    /// Register a mempool listener.
    pub fn register_mempool_listener(&self, listener: Arc<dyn MempoolListener>) {
        self.mempool_listeners.write().push(listener);
    }

    /// Register a chain listener.
    pub fn register_chain_listener(&self, listener: Arc<dyn ChainListener>) {
        self.chain_listeners.write().push(listener);
    }

    /// Append an event to the queue. Never blocks on listeners.
    pub fn enqueue(&self, event: Notification) {
        // A send failure means the worker already stopped during shutdown;
        // late events are dropped by contract.
        let _ = self.sender.send(QueueItem::Event(event));
    }

    /// Block until every previously enqueued callback has completed.
    ///
    /// Callers must not hold `chain_lock` or `pool_lock`: a listener
    /// waiting on either would deadlock against this barrier.
    pub fn sync(&self) {
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(0);
        if self.sender.send(QueueItem::Barrier(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Drain outstanding events and stop the worker. Idempotent.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(QueueItem::Stop);
            let _ = handle.join();
            debug!("notification worker stopped");
        }
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(
    mempool_listeners: &Listeners<dyn MempoolListener>,
    chain_listeners: &Listeners<dyn ChainListener>,
    event: &Notification,
) {
    match event {
        Notification::TransactionAdded { tx, fee, vsize, valid_for_estimation } => {
            for l in mempool_listeners.read().iter() {
                l.transaction_added(tx, *fee, *vsize, *valid_for_estimation);
            }
        }
        Notification::TransactionRemoved { tx, reason } => {
            for l in mempool_listeners.read().iter() {
                l.transaction_removed(tx, *reason);
            }
        }
        Notification::MempoolUpdatedForBlockConnect { removed_in_block, removed_conflicted } => {
            for l in mempool_listeners.read().iter() {
                l.mempool_updated_for_block_connect(removed_in_block, removed_conflicted);
            }
        }
        Notification::BlockConnected { block, height } => {
            for l in chain_listeners.read().iter() {
                l.block_connected(block, *height);
            }
        }
        Notification::BlockDisconnected { block } => {
            for l in chain_listeners.read().iter() {
                l.block_disconnected(block);
            }
        }
        Notification::UpdatedTip { new_tip, fork_point, initial_download } => {
            for l in chain_listeners.read().iter() {
                l.updated_tip(*new_tip, *fork_point, *initial_download);
            }
        }
        Notification::NewPowValidBlock { height, block } => {
            for l in chain_listeners.read().iter() {
                l.new_pow_valid_block(*height, block);
            }
        }
        Notification::BlockChecked { block_hash, result } => {
            for l in chain_listeners.read().iter() {
                l.block_checked(*block_hash, result);
            }
        }
    }
}
