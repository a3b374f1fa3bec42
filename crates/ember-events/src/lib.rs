//! # ember-events
//! Notification fan-out for mempool and chain events.
//!
//! Producers enqueue [`Notification`]s while holding core locks; a single
//! background worker drains the queue in FIFO order and dispatches to
//! registered listeners. Listeners therefore never run under a core lock,
//! and a dual mempool/chain listener observes the documented interleaving:
//! the mempool-update event for a block connect is delivered strictly
//! before the matching block-connected event, while block-disconnect and
//! reorg-removal events carry no mutual ordering guarantee.

mod notifications;
mod shutdown;

pub use notifications::{
    ChainListener, MempoolListener, Notification, NotificationQueue, RemovalReason,
};
pub use shutdown::ShutdownFlag;
