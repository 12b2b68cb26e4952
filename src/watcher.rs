//! Background timeout watcher
//!
//! A task that periodically scans the pool and enforces two orthogonal time
//! bounds:
//!
//! - **Lease timeout**: a session held longer than its lease bound is marked
//!   dirty and its borrower warned about (optionally interrupted). After
//!   repeated violations the session is *evicted*: deducted from the pool so
//!   fresh sessions can be created even though the borrower never returned.
//!   Without eviction a hanging borrower would pin the pool at its ceiling
//!   and starve new work.
//! - **Idle timeout**: sessions idle longer than the bound are pruned from
//!   the cold tail of the idle queue, down to the pool's minimum size.
//!
//! There can be different reasons for a lease timeout: the borrowing code
//! never released the session (a programming error), the database is busy
//! and a statement is slow, or the borrowing task is hanging on I/O. In
//! testing, set a low `max_lease` to catch the first two; in production set
//! it high and consider `interrupt` to unstick hanging borrowers, plus an
//! `evict_threshold` so an unreleased session cannot lock up the pool.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entry::{Borrower, PooledEntry};
use crate::error::{Error, Result};
use crate::idle::Steal;
use crate::pool::PoolInner;

/// Watcher configuration. All bounds are disabled by a zero value.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Maximum time a session can be leased. Default 2 minutes.
    ///
    /// An expired session is marked dirty but still counts as open; only
    /// eviction (see [`evict_threshold`](Self::evict_threshold)) makes room
    /// in a full pool for a replacement.
    pub max_lease: Duration,
    /// Maximum time a session can sit idle. Default 1 minute.
    pub max_idle: Duration,
    /// How often the watcher scans for expired leases and idle sessions.
    /// Default 1 second.
    pub scan_interval: Duration,
    /// Number of consecutive lease expiries after which a session is
    /// considered lost and evicted. Default 3; zero never evicts; 1 evicts
    /// on the first expiry.
    pub evict_threshold: u32,
    /// Cancel the borrower's token when its lease expires. The cancellation
    /// is advisory: it wakes the borrower from cooperative waits, nothing
    /// more. Use with care. Default false.
    pub interrupt: bool,
    /// Close the raw session of an evicted entry. Default false: the session
    /// is left for the borrower, whose eventual release closes it.
    pub close_evicted: bool,
    /// Close the raw session of an evicted entry only when the borrowing
    /// task has terminated. Default false.
    pub close_evicted_when_terminated: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_lease: Duration::from_secs(120),
            max_idle: Duration::from_secs(60),
            scan_interval: Duration::from_secs(1),
            evict_threshold: 3,
            interrupt: false,
            close_evicted: false,
            close_evicted_when_terminated: false,
        }
    }
}

impl WatcherConfig {
    /// Set the maximum lease time (zero disables lease timeouts)
    pub fn with_max_lease(mut self, max_lease: Duration) -> Self {
        self.max_lease = max_lease;
        self
    }

    /// Set the maximum idle time (zero disables idle timeouts)
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the scan interval
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Set the eviction threshold (zero disables eviction)
    pub fn with_evict_threshold(mut self, evict_threshold: u32) -> Self {
        self.evict_threshold = evict_threshold;
        self
    }

    /// Enable/disable borrower interruption on lease expiry
    pub fn with_interrupt(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Enable/disable closing the session of an evicted entry
    pub fn with_close_evicted(mut self, close_evicted: bool) -> Self {
        self.close_evicted = close_evicted;
        self
    }

    /// Enable/disable closing an evicted session only once its borrower
    /// has terminated
    pub fn with_close_evicted_when_terminated(mut self, only_when_terminated: bool) -> Self {
        self.close_evicted_when_terminated = only_when_terminated;
        self
    }

    /// Whether an evicted session's raw session should be closed.
    fn should_close_evicted(&self, borrower_terminated: bool) -> bool {
        (self.close_evicted && !self.close_evicted_when_terminated)
            || (self.close_evicted_when_terminated && borrower_terminated)
    }
}

/// Counters maintained by the watcher, readable through the pool's stats.
#[derive(Debug, Default)]
pub(crate) struct WatcherStats {
    expired: AtomicU64,
    idled: AtomicU64,
    evicted: AtomicU64,
}

impl WatcherStats {
    fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn record_idled(&self) {
        self.idled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired_total(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub(crate) fn idled_total(&self) -> u64 {
        self.idled.load(Ordering::Relaxed)
    }

    pub(crate) fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Handle to the running watcher task.
pub(crate) struct WatcherHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal the watcher to stop and wait for it to finish.
    pub(crate) async fn stop_and_join(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|err| Error::watcher(format!("watcher task failed: {err}")))
    }
}

/// Start the watcher for a pool. The watcher holds only a weak reference:
/// it dies with the pool.
pub(crate) fn spawn(pool: &Arc<PoolInner>) -> WatcherHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let config = pool.watcher_config().clone();
    let stats = Arc::clone(&pool.watcher_stats);
    let task = tokio::spawn(run(Arc::downgrade(pool), config, stats, stop_rx));
    WatcherHandle { stop_tx, task }
}

async fn run(
    pool: Weak<PoolInner>,
    config: WatcherConfig,
    stats: Arc<WatcherStats>,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!("session pool watcher started");
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        let cycle = async {
            scan_leases(&pool, &config, &stats).await;
            scan_idle(&pool, &config, &stats).await;
        };
        let outcome = AssertUnwindSafe(cycle).catch_unwind().await;
        drop(pool);
        if outcome.is_err() {
            error!("session pool watcher no longer operational due to unexpected error");
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.scan_interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    let (expired, idled, evicted) = (
        stats.expired_total(),
        stats.idled_total(),
        stats.evicted_total(),
    );
    if expired > 0 || idled > 0 || evicted > 0 {
        info!(expired, idled, evicted, "session pool watcher stopped");
    } else {
        debug!("session pool watcher stopped");
    }
}

/// Check every leased entry against its lease bound.
async fn scan_leases(pool: &Arc<PoolInner>, config: &WatcherConfig, stats: &WatcherStats) {
    let entries: Vec<_> = pool.registry.iter().map(|e| Arc::clone(e.value())).collect();
    for entry in entries {
        if !entry.is_leased() {
            continue;
        }
        let max_lease = entry.max_lease();
        if max_lease.is_zero() {
            continue;
        }
        if entry.wait_elapsed() < max_lease {
            continue;
        }
        let Some(borrower) = entry.borrower() else {
            continue;
        };
        // The entry may have been returned between the deadline check and
        // the borrower capture; act only on a still-active lease.
        if !entry.is_leased() {
            continue;
        }
        entry.mark_dirty();
        let expired_count = entry.bump_expired();
        let mut interrupted = false;
        let mut evict = false;
        if borrower.is_terminated() {
            evict = true;
        } else if config.interrupt {
            borrower.interrupt();
            interrupted = true;
        }
        if config.evict_threshold > 0 && (evict || expired_count >= config.evict_threshold) {
            evict_entry(
                pool,
                config,
                stats,
                &entry,
                &borrower,
                expired_count,
                evict,
                interrupted,
            )
            .await;
            continue;
        }
        stats.record_expired();
        // Restart the wait clock so the next warning fires one full lease
        // period from now, not on every scan.
        entry.reset_wait_start();
        warn!(
            session = %entry.session().describe(),
            borrower = %borrower,
            max_lease_ms = max_lease.as_millis() as u64,
            interrupted,
            "lease time expired for pooled session"
        );
    }
}

/// Remove a leased-but-apparently-lost entry from the pool.
///
/// The session itself is closed only when the configuration says so;
/// otherwise it is left for the borrower, whose eventual release will log
/// the "not in the pool" warning and close it through the factory.
#[allow(clippy::too_many_arguments)]
async fn evict_entry(
    pool: &Arc<PoolInner>,
    config: &WatcherConfig,
    stats: &WatcherStats,
    entry: &Arc<PooledEntry>,
    borrower: &Borrower,
    expired_count: u32,
    borrower_terminated: bool,
    borrower_interrupted: bool,
) {
    if !pool.deduct_evicted(entry) {
        return;
    }
    stats.record_evicted();
    let close_session = config.should_close_evicted(borrower_terminated);
    warn!(
        session = %entry.session().describe(),
        borrower = %borrower,
        expired_count,
        terminated = borrower_terminated,
        interrupted = borrower_interrupted,
        closing = close_session,
        "evicting session from pool after lease expiry"
    );
    if close_session {
        if let Some(factory) = pool.current_factory() {
            factory.close_with_rollback(entry.session(), true).await;
        }
    }
}

/// Prune sessions that have idled past the bound, oldest first, down to the
/// pool's minimum size.
///
/// Relies on LIFO insertion on release: the entry at the tail of the idle
/// queue is the one idle the longest.
async fn scan_idle(pool: &Arc<PoolInner>, config: &WatcherConfig, stats: &WatcherStats) {
    if config.max_idle.is_zero() || pool.open_count() <= pool.min_size() {
        return;
    }
    let Some(factory) = pool.current_factory() else {
        return;
    };
    let mut candidate = pool.idle.peek_oldest();
    while let Some(entry) = candidate {
        if entry.wait_elapsed() < config.max_idle {
            break;
        }
        match pool.idle.steal_oldest(&entry).await {
            // A sudden busy moment: every idle session got leased, so no
            // idle timeouts this cycle.
            Steal::Busy => return,
            Steal::Raced(reason) => {
                warn!(reason, "idle prune aborted");
                return;
            }
            Steal::Stolen => {}
        }
        pool.remove_entry(&factory, &entry).await;
        stats.record_idled();
        info!(
            session = %entry.session().describe(),
            factory = %factory.describe(),
            "removed idle session from pool"
        );
        candidate = if pool.open_count() > pool.min_size() {
            pool.idle.peek_oldest()
        } else {
            None
        };
    }
}
