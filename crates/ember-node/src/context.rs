//! The two named locks and block connect/disconnect orchestration.
//!
//! Lock order is `chain_lock` then `pool_lock`, everywhere. Operations
//! that need both acquire them in that order and hold both for their full
//! duration; nothing here suspends while holding either. Listener
//! callbacks are enqueued under the locks and dispatched by the
//! notification worker after release.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use ember_core::error::EmberError;
use ember_core::types::{Block, Hash256, Transaction, TxId};
use ember_events::{Notification, NotificationQueue, ShutdownFlag};
use ember_mempool::Mempool;
use ember_miner::{BlockAssembler, BlockTemplate, TipInfo};

use crate::config::NodeConfig;

/// Chain-tip bookkeeping guarded by `chain_lock`.
///
/// Header validation, proof of work, and persistent storage are external
/// collaborators; the core only needs what template assembly consumes.
#[derive(Clone, Debug)]
pub struct ChainView {
    pub height: u64,
    pub tip_hash: Hash256,
    pub median_time_past: u64,
    pub time: u64,
    pub next_bits: u32,
    pub default_version: u32,
}

impl ChainView {
    fn tip_info(&self) -> TipInfo {
        TipInfo {
            height: self.height,
            hash: self.tip_hash,
            median_time_past: self.median_time_past,
            time: self.time,
            next_bits: self.next_bits,
            default_version: self.default_version,
        }
    }
}

/// Process-wide core state: chain view, mempool, assembler, events.
///
/// One instance per process in production (tests build their own), with
/// explicit construction and [`shutdown`](Core::shutdown) phases.
pub struct Core {
    chain: Mutex<ChainView>,
    pool: Mutex<Mempool>,
    assembler: BlockAssembler,
    events: Arc<NotificationQueue>,
    shutdown: ShutdownFlag,
}

impl Core {
    /// Wire up the core around an initial chain view.
    pub fn new(config: NodeConfig, chain: ChainView) -> Self {
        let events = NotificationQueue::new();
        let shutdown = ShutdownFlag::new();

        let mut pool = Mempool::new(config.mempool.clone(), Arc::clone(&events));
        pool.set_shutdown_flag(shutdown.clone());

        let mut assembler = BlockAssembler::new(config.assembler.clone());
        assembler.set_shutdown_flag(shutdown.clone());

        Self {
            chain: Mutex::new(chain),
            pool: Mutex::new(pool),
            assembler,
            events,
            shutdown,
        }
    }

    pub fn events(&self) -> &Arc<NotificationQueue> {
        &self.events
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Run a closure under `pool_lock` alone.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut Mempool) -> R) -> R {
        f(&mut self.pool.lock())
    }

    /// Run a closure under `chain_lock` alone.
    pub fn with_chain<R>(&self, f: impl FnOnce(&mut ChainView) -> R) -> R {
        f(&mut self.chain.lock())
    }

    /// Assemble a block template, holding both locks for the duration.
    pub fn create_block_template(
        &self,
        coinbase_pubkey_hash: Hash256,
        include_witness: bool,
    ) -> Result<BlockTemplate, EmberError> {
        let chain = self.chain.lock();
        let pool = self.pool.lock();
        let template = self.assembler.create_block_template(
            &chain.tip_info(),
            &pool,
            coinbase_pubkey_hash,
            include_witness,
        )?;
        Ok(template)
    }

    /// Connect a validated block: advance the tip, drain the pool of
    /// confirmed and conflicted transactions, and notify listeners.
    ///
    /// The mempool-update event is enqueued (inside `remove_for_block`)
    /// strictly before the block-connected event, so dual listeners see
    /// the documented interleaving.
    pub fn connect_block(
        &self,
        block: &Block,
        new_tip: ChainView,
    ) -> Result<(Vec<Arc<Transaction>>, Vec<Arc<Transaction>>), EmberError> {
        let mut chain = self.chain.lock();
        let mut pool = self.pool.lock();

        let height = new_tip.height;
        let (removed, conflicts) = pool.remove_for_block(&block.transactions, height)?;
        *chain = new_tip;

        self.events.enqueue(Notification::BlockConnected {
            block: Arc::new(block.clone()),
            height,
        });
        info!(height, removed = removed.len(), conflicts = conflicts.len(), "connected block");
        Ok((removed, conflicts))
    }

    /// Disconnect the tip block during a reorg.
    ///
    /// The caller has already re-validated and re-added the disconnected
    /// block's transactions it wants back (`reinserted`, in block order);
    /// this repairs the pool graph around them, rewinds the chain view,
    /// and notifies listeners. The block-disconnected event and any
    /// reorg-reason removal events are deliberately unordered relative to
    /// each other.
    pub fn disconnect_block(&self, block: &Block, reinserted: &[TxId], new_tip: ChainView) {
        let mut chain = self.chain.lock();
        let mut pool = self.pool.lock();

        pool.update_from_block_disconnect(reinserted);
        let height = new_tip.height;
        *chain = new_tip;

        self.events.enqueue(Notification::BlockDisconnected { block: Arc::new(block.clone()) });
        info!(height, reinserted = reinserted.len(), "disconnected block");
    }

    /// Announce the post-reorg (or post-connect) best tip.
    pub fn notify_updated_tip(&self, new_tip: Hash256, fork_point: Hash256, initial_download: bool) {
        self.events.enqueue(Notification::UpdatedTip { new_tip, fork_point, initial_download });
    }

    /// Block until all previously enqueued notifications have been
    /// delivered. Must be called without holding either core lock.
    pub fn sync_queue(&self) {
        self.events.sync();
    }

    /// Request shutdown: long-running loops abort at their next check,
    /// queued notifications drain, the worker stops.
    pub fn shutdown(&self) {
        self.shutdown.request();
        self.events.sync();
        self.events.shutdown();
    }
}
