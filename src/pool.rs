//! The session pool
//!
//! Retains a bounded set of live database sessions and lends them to
//! concurrent callers. Callers acquire a [`SessionLease`], use the session
//! exclusively, and release it back. Sessions are validated before being
//! lent out; a session marked dirty is discarded on its next release or
//! acquire. A background [watcher](crate::watcher) enforces lease and idle
//! time bounds.
//!
//! # Example
//!
//! ```rust,ignore
//! use leasepool::prelude::*;
//!
//! let pool = Pool::with_factory(
//!     PoolConfig::default().with_min_size(2).with_max_size(10),
//!     Arc::new(PgSessionFactory::new("postgres://localhost/db")),
//! );
//! pool.open(true).await?;
//!
//! let lease = pool.acquire().await?;
//! // ... use the session ...
//! pool.release(lease).await;
//! ```

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::entry::{Borrower, PooledEntry, SessionId};
use crate::error::{Error, Result};
use crate::idle::{IdleQueue, PROBE_WAIT};
use crate::session::{Session, SessionFactory};
use crate::watcher::{self, WatcherConfig, WatcherHandle, WatcherStats};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of sessions kept in the pool. Default 1.
    pub min_size: usize,
    /// Maximum number of sessions in the pool. Default 10.
    pub max_size: usize,
    /// Maximum time an acquire may wait for a session. Default 50 s.
    pub acquire_timeout: Duration,
    /// Time-bound enforcement performed by the background watcher.
    pub watcher: WatcherConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(50),
            watcher: WatcherConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Set the minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the watcher configuration
    pub fn with_watcher(mut self, watcher: WatcherConfig) -> Self {
        self.watcher = watcher;
        self
    }
}

/// Point-in-time snapshot of the pool's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total sessions opened since the pool was created
    pub created_total: u64,
    /// Total sessions closed by the pool
    pub closed_total: u64,
    /// Sessions discarded because validation failed
    pub invalid_total: u64,
    /// Successful acquires
    pub acquisitions: u64,
    /// Total wall time spent waiting in acquire, in milliseconds
    pub total_wait_ms: u64,
    /// Longest single acquire wait, in milliseconds
    pub max_wait_ms: u64,
    /// Lease-expiry warnings emitted by the watcher
    pub expired_total: u64,
    /// Idle sessions pruned by the watcher
    pub idled_total: u64,
    /// Sessions evicted by the watcher
    pub evicted_total: u64,
}

impl PoolStats {
    /// Average acquire wait in milliseconds
    pub fn avg_wait_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.acquisitions as f64
        }
    }
}

/// Atomic counters updated on the acquire/release hot path
#[derive(Debug, Default)]
pub(crate) struct AtomicPoolStats {
    created_total: AtomicU64,
    closed_total: AtomicU64,
    invalid_total: AtomicU64,
    acquisitions: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
}

impl AtomicPoolStats {
    pub(crate) fn record_created(&self) {
        self.created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.closed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid(&self) {
        self.invalid_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquisition(&self, waited: Duration) {
        let wait_ms = waited.as_millis() as u64;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(wait_ms, Ordering::Relaxed);
    }

    pub(crate) fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    fn snapshot(&self, watcher: &WatcherStats) -> PoolStats {
        PoolStats {
            created_total: self.created_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            invalid_total: self.invalid_total.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            max_wait_ms: self.max_wait_ms.load(Ordering::Relaxed),
            expired_total: watcher.expired_total(),
            idled_total: watcher.idled_total(),
            evicted_total: watcher.evicted_total(),
        }
    }
}

/// A session borrowed from the pool.
///
/// The lease owns the raw session for its scope of work (deref to
/// [`Session`]) and carries the borrower's cancellation token: the watcher
/// cancels the token when an expired lease's holder should be woken, so
/// long-running holders are expected to select against
/// [`cancelled`](SessionLease::cancelled) in their waits.
///
/// Return the lease with [`Pool::release`]. Dropping it unreleased spawns a
/// return to the pool as a safety net.
pub struct SessionLease {
    id: SessionId,
    session: Option<Arc<dyn Session>>,
    cancel: CancellationToken,
    pool: Weak<PoolInner>,
}

impl SessionLease {
    /// Identity of the leased session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The raw session
    pub fn session(&self) -> &dyn Session {
        self.session
            .as_ref()
            .expect("session already released")
            .as_ref()
    }

    /// The borrower's cancellation token
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves when the watcher interrupts this borrower
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Register the holder task's abort handle so the watcher can tell a
    /// hanging borrower from one that has terminated.
    pub fn attach_abort_handle(&self, handle: tokio::task::AbortHandle) {
        if let Some(inner) = self.pool.upgrade() {
            if let Some(entry) = inner.registry.get(&self.id) {
                entry.attach_abort(handle);
            }
        }
    }

    fn take_session(&mut self) -> Option<Arc<dyn Session>> {
        self.session.take()
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("id", &self.id).finish()
    }
}

impl std::ops::Deref for SessionLease {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(inner) = self.pool.upgrade() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let id = self.id;
                    handle.spawn(async move {
                        PoolInner::release_raw(&inner, id, session).await;
                    });
                }
            }
        }
    }
}

/// Handle to a session pool. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    /// Runtime-adjustable copy of `config.min_size`; lowering it lets the
    /// watcher prune further.
    min_size: AtomicUsize,
    factory: parking_lot::RwLock<Option<Arc<dyn SessionFactory>>>,
    /// All live sessions, keyed by identity.
    pub(crate) registry: DashMap<SessionId, Arc<PooledEntry>>,
    pub(crate) idle: IdleQueue,
    /// Authoritative size bound, kept in step with the registry.
    open_count: AtomicUsize,
    /// Serializes growth so sessions are opened one at a time.
    growth: tokio::sync::Mutex<()>,
    close_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    session_seq: AtomicU64,
    lease_seq: AtomicU64,
    pub(crate) stats: AtomicPoolStats,
    pub(crate) watcher_stats: Arc<WatcherStats>,
    watcher: parking_lot::Mutex<Option<WatcherHandle>>,
}

impl Pool {
    /// Create a pool with the given configuration. A factory must be set
    /// before [`open`](Pool::open).
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                min_size: AtomicUsize::new(config.min_size),
                config,
                factory: parking_lot::RwLock::new(None),
                registry: DashMap::new(),
                idle: IdleQueue::new(),
                open_count: AtomicUsize::new(0),
                growth: tokio::sync::Mutex::new(()),
                close_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                session_seq: AtomicU64::new(0),
                lease_seq: AtomicU64::new(0),
                stats: AtomicPoolStats::default(),
                watcher_stats: Arc::new(WatcherStats::default()),
                watcher: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Create a pool with a factory already set.
    pub fn with_factory(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let pool = Self::new(config);
        pool.set_factory(factory);
        pool
    }

    /// Set the session factory. Takes effect for subsequent opens/acquires.
    pub fn set_factory(&self, factory: Arc<dyn SessionFactory>) {
        *self.inner.factory.write() = Some(factory);
    }

    /// The configured session factory, if any.
    pub fn factory(&self) -> Option<Arc<dyn SessionFactory>> {
        self.inner.factory.read().clone()
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open the pool: create the minimum number of sessions and start the
    /// watcher when any time bound is configured.
    ///
    /// With `fail_fast`, a warmup failure tears down every session created
    /// so far and surfaces the error; otherwise the failure is logged and
    /// the pool opens with fewer than `min_size` sessions.
    pub async fn open(&self, fail_fast: bool) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let factory = self.inner.factory_or_missing()?;

        let mut warmed = 0;
        let mut failure = None;
        while warmed < self.inner.min_size() {
            match self.acquire().await {
                Ok(lease) => {
                    self.release(lease).await;
                    warmed += 1;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            if fail_fast {
                error!(
                    factory = %factory.describe(),
                    error = %err,
                    "failed to open session pool"
                );
                self.inner.idle.drain();
                let entries: Vec<_> =
                    self.inner.registry.iter().map(|e| Arc::clone(e.value())).collect();
                for entry in entries {
                    self.inner.remove_entry(&factory, &entry).await;
                }
                return Err(err);
            }
            error!(
                factory = %factory.describe(),
                acquired = warmed,
                wanted = self.inner.min_size(),
                error = %err,
                "could not initialize minimum number of sessions for pool"
            );
        }

        let cfg = &self.inner.config.watcher;
        if !cfg.max_lease.is_zero() || !cfg.max_idle.is_zero() {
            let handle = watcher::spawn(&self.inner);
            *self.inner.watcher.lock() = Some(handle);
        }
        Ok(())
    }

    /// Acquire a session within the configured acquire timeout, with the
    /// configured maximum lease time.
    pub async fn acquire(&self) -> Result<SessionLease> {
        self.acquire_with(
            self.inner.config.acquire_timeout,
            self.inner.config.watcher.max_lease,
        )
        .await
    }

    /// Acquire a session within `acquire_timeout`, with the configured
    /// maximum lease time.
    pub async fn acquire_timeout(&self, acquire_timeout: Duration) -> Result<SessionLease> {
        self.acquire_with(acquire_timeout, self.inner.config.watcher.max_lease)
            .await
    }

    /// Acquire a session within `acquire_timeout`, leased for at most
    /// `max_lease` (zero disables the lease bound for this lease).
    pub async fn acquire_with(
        &self,
        acquire_timeout: Duration,
        max_lease: Duration,
    ) -> Result<SessionLease> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        let factory = inner.factory_or_missing()?;
        let start = Instant::now();

        // Warmup fast path: below the minimum size, grow without touching
        // the idle queue.
        if inner.open_count() < inner.min_size() {
            if let Some(lease) = inner.grow(&factory, max_lease).await? {
                inner.stats.record_acquisition(start.elapsed());
                return Ok(lease);
            }
        }

        loop {
            let mut retry = false;
            // Brief probe first so a burst can reuse a session released
            // moments ago before paying for a new one.
            let mut entry = inner.idle.take(PROBE_WAIT).await?;
            if entry.is_none() && inner.open_count() < inner.config.max_size {
                if let Some(lease) = inner.grow(&factory, max_lease).await? {
                    inner.stats.record_acquisition(start.elapsed());
                    return Ok(lease);
                }
            }
            if entry.is_none() {
                let remaining = acquire_timeout.saturating_sub(start.elapsed());
                entry = inner.idle.take(remaining).await?;
            }
            if let Some(entry) = entry {
                if !entry.is_dirty() {
                    if let Err(err) = factory.validate(entry.session()).await {
                        info!(
                            session = %entry.session().describe(),
                            error = %err,
                            "session from pool is invalid"
                        );
                        entry.mark_dirty();
                        inner.stats.record_invalid();
                    }
                }
                if entry.is_dirty() {
                    inner.remove_entry(&factory, &entry).await;
                    retry = true;
                } else {
                    let lease = inner.lend(&entry, max_lease);
                    inner.stats.record_acquisition(start.elapsed());
                    return Ok(lease);
                }
            }
            if !retry && start.elapsed() >= acquire_timeout {
                return Err(Error::acquire_timeout(acquire_timeout));
            }
        }
    }

    /// Release a session back into the pool so another caller may use it.
    ///
    /// Releasing a lease whose session was already taken is a no-op.
    pub async fn release(&self, mut lease: SessionLease) {
        let id = lease.id();
        if let Some(session) = lease.take_session() {
            PoolInner::release_raw(&self.inner, id, session).await;
        }
    }

    /// Mark the leased session as dirty: it will be removed from the pool
    /// and closed on its next release or acquire.
    ///
    /// Returns false when the session is no longer part of this pool.
    pub fn mark_dirty(&self, lease: &SessionLease) -> bool {
        match self.inner.registry.get(&lease.id()) {
            Some(entry) => {
                entry.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Mark every session as dirty so each is closed and replaced as it
    /// passes through release or acquire. Concurrent use continues normally.
    pub fn flush(&self) {
        for entry in self.inner.registry.iter() {
            entry.value().mark_dirty();
        }
    }

    /// Close the pool: stop the watcher and close every session. Terminal
    /// and idempotent; subsequent acquires fail with
    /// [`Closed`](crate::ErrorKind::Closed).
    pub async fn close(&self) {
        let inner = &self.inner;
        let _guard = inner.close_lock.lock().await;
        inner.closed.store(true, Ordering::Release);

        self.stop_watcher().await;

        // Wake parked acquirers; they fail with an interruption.
        inner.idle.shut_down();
        inner.idle.drain();

        let factory = inner.factory.read().clone();
        let ids: Vec<SessionId> = inner.registry.iter().map(|e| *e.key()).collect();
        let mut closed = 0usize;
        if let Some(factory) = factory {
            for id in ids {
                // Claim each entry before closing it so a racing release
                // cannot deduct the same session twice.
                let Some((_, entry)) = inner.registry.remove(&id) else {
                    continue;
                };
                factory.close(entry.session()).await;
                inner.open_count.fetch_sub(1, Ordering::AcqRel);
                inner.stats.record_closed();
                closed += 1;
            }
            info!(
                factory = %factory.describe(),
                closed,
                created_total = inner.stats.created_total(),
                "closed session pool"
            );
        }
    }

    /// Number of sessions in the pool.
    pub fn open_count(&self) -> usize {
        self.inner.open_count()
    }

    /// Number of sessions ready to be acquired.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.available()
    }

    /// Number of sessions currently leased out.
    pub fn used_count(&self) -> usize {
        self.inner
            .open_count()
            .saturating_sub(self.inner.idle.available())
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot(&self.inner.watcher_stats)
    }

    /// One-line human-readable summary of the pool state.
    pub fn status(&self) -> String {
        let stats = self.stats();
        let factory = self
            .factory()
            .map(|f| f.describe())
            .unwrap_or_else(|| "<no factory>".into());
        format!(
            "pool for {factory}: open={} idle={} used={} created={} invalid={} \
             expired={} idled={} evicted={}",
            self.open_count(),
            self.idle_count(),
            self.used_count(),
            stats.created_total,
            stats.invalid_total,
            stats.expired_total,
            stats.idled_total,
            stats.evicted_total,
        )
    }

    /// Lower (or raise) the minimum pool size at runtime. The watcher prunes
    /// idle sessions down to this bound.
    pub fn set_min_size(&self, min_size: usize) {
        self.inner.min_size.store(min_size, Ordering::Release);
    }

    /// Stop the background watcher without closing the pool. Lease and idle
    /// time bounds are no longer enforced afterwards.
    pub async fn stop_watcher(&self) {
        let watcher = self.inner.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(err) = handle.stop_and_join().await {
                error!(error = %err, "watcher did not stop cleanly");
            }
        }
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl PoolInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn min_size(&self) -> usize {
        self.min_size.load(Ordering::Acquire)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn watcher_config(&self) -> &WatcherConfig {
        &self.config.watcher
    }

    pub(crate) fn current_factory(&self) -> Option<Arc<dyn SessionFactory>> {
        self.factory.read().clone()
    }

    fn factory_or_missing(&self) -> Result<Arc<dyn SessionFactory>> {
        self.factory.read().clone().ok_or(Error::FactoryMissing)
    }

    /// Open a new session under the growth lock and lend it directly.
    ///
    /// Sessions are created one at a time: concurrent growers serialize here
    /// instead of storming the database during a burst.
    async fn grow(
        self: &Arc<Self>,
        factory: &Arc<dyn SessionFactory>,
        max_lease: Duration,
    ) -> Result<Option<SessionLease>> {
        let _guard = self.growth.lock().await;
        if self.open_count() >= self.config.max_size {
            return Ok(None);
        }
        let session = factory.open().await?;
        let id = SessionId::new(self.session_seq.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(PooledEntry::new(id, session));
        let lease = self.lend(&entry, max_lease);
        self.registry.insert(id, entry);
        self.open_count.fetch_add(1, Ordering::AcqRel);
        self.stats.record_created();
        debug!(
            session = %lease.session().describe(),
            factory = %factory.describe(),
            open = self.open_count(),
            "created pooled session"
        );
        Ok(Some(lease))
    }

    /// Transition an entry to leased and build the caller's lease.
    fn lend(self: &Arc<Self>, entry: &Arc<PooledEntry>, max_lease: Duration) -> SessionLease {
        let cancel = CancellationToken::new();
        let seq = self.lease_seq.fetch_add(1, Ordering::Relaxed) + 1;
        entry.mark_leased(Borrower::capture(seq, cancel.clone()), max_lease);
        SessionLease {
            id: entry.id(),
            session: Some(entry.session_arc()),
            cancel,
            pool: Arc::downgrade(self),
        }
    }

    /// Return a raw session to the pool by identity.
    pub(crate) async fn release_raw(self: &Arc<Self>, id: SessionId, session: Arc<dyn Session>) {
        let Some(factory) = self.current_factory() else {
            return;
        };
        let entry = self.registry.get(&id).map(|e| Arc::clone(e.value()));
        match entry {
            None => {
                // Commonly the aftermath of an eviction: the entry was
                // already deducted from the pool, so close without touching
                // the open count.
                warn!(
                    session = %session.describe(),
                    "cannot release a session that is not in the pool"
                );
                factory.close(session.as_ref()).await;
            }
            Some(entry) => {
                if !entry.is_leased() {
                    warn!(
                        session = %session.describe(),
                        "session is already released"
                    );
                    return;
                }
                entry.mark_released();
                if entry.is_dirty() {
                    self.remove_entry(&factory, &entry).await;
                } else {
                    self.idle.return_entry(entry);
                }
            }
        }
    }

    /// Remove an entry from the registry and close its session.
    pub(crate) async fn remove_entry(
        &self,
        factory: &Arc<dyn SessionFactory>,
        entry: &Arc<PooledEntry>,
    ) {
        entry.mark_dirty();
        if self.registry.remove(&entry.id()).is_none() {
            return;
        }
        factory.close(entry.session()).await;
        self.open_count.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
        debug!(
            session = %entry.session().describe(),
            factory = %factory.describe(),
            open = self.open_count(),
            "closed pooled session"
        );
    }

    /// Deduct an evicted entry from the pool without closing its session.
    pub(crate) fn deduct_evicted(&self, entry: &Arc<PooledEntry>) -> bool {
        if self.registry.remove(&entry.id()).is_none() {
            return false;
        }
        self.open_count.fetch_sub(1, Ordering::AcqRel);
        true
    }
}
