//! Per-session pool metadata
//!
//! One [`PooledEntry`] exists per live session. Borrowers (acquire/release)
//! and the watcher both touch an entry concurrently; every field the watcher
//! reads is atomic so it can scan without locks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::session::Session;

/// Identity of a pooled session, assigned by the pool at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the task currently holding a leased session.
///
/// Stands in for the original's thread handle: the cancellation token is the
/// portable interrupt, the abort handle (when the holder attached one) the
/// portable liveness probe, and the task id plus acquire time the provenance
/// logged in place of a stack snapshot.
#[derive(Clone)]
pub(crate) struct Borrower {
    seq: u64,
    task: Option<tokio::task::Id>,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
    acquired_at: Instant,
}

impl Borrower {
    /// Capture the current task as the borrower of a lease.
    pub(crate) fn capture(seq: u64, cancel: CancellationToken) -> Self {
        Self {
            seq,
            task: tokio::task::try_id(),
            cancel,
            abort: None,
            acquired_at: Instant::now(),
        }
    }

    /// Cancel the borrower's token, waking it from any cooperative wait.
    pub(crate) fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Whether the borrowing task has ended while still holding the lease.
    ///
    /// Only known when the holder attached its abort handle; without one the
    /// borrower is assumed alive.
    pub(crate) fn is_terminated(&self) -> bool {
        self.abort.as_ref().map(AbortHandle::is_finished).unwrap_or(false)
    }

    pub(crate) fn set_abort(&mut self, handle: AbortHandle) {
        self.abort = Some(handle);
    }
}

impl fmt::Display for Borrower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task {
            Some(task) => write!(f, "task {task} (lease {})", self.seq)?,
            None => write!(f, "untracked task (lease {})", self.seq)?,
        }
        write!(f, ", held for {} ms", self.acquired_at.elapsed().as_millis())
    }
}

/// Pool metadata for one live session.
pub(crate) struct PooledEntry {
    id: SessionId,
    session: Arc<dyn Session>,
    created: Instant,
    /// Start of the current lease or idle period, as millis since `created`.
    wait_start_ms: AtomicU64,
    max_lease_ms: AtomicU64,
    leased: AtomicBool,
    dirty: AtomicBool,
    /// Consecutive lease-deadline violations seen by the watcher.
    expired_count: AtomicU32,
    borrower: Mutex<Option<Borrower>>,
}

impl PooledEntry {
    pub(crate) fn new(id: SessionId, session: Arc<dyn Session>) -> Self {
        Self {
            id,
            session,
            created: Instant::now(),
            wait_start_ms: AtomicU64::new(0),
            max_lease_ms: AtomicU64::new(0),
            leased: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            expired_count: AtomicU32::new(0),
            borrower: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub(crate) fn session_arc(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }

    /// Transition to leased: record the borrower, store the lease bound and
    /// restart the wait clock.
    pub(crate) fn mark_leased(&self, borrower: Borrower, max_lease: Duration) {
        self.max_lease_ms
            .store(max_lease.as_millis() as u64, Ordering::Release);
        trace!(session = %self.session.describe(), borrower = %borrower, "leasing session");
        *self.borrower.lock() = Some(borrower);
        self.leased.store(true, Ordering::Release);
        self.reset_wait_start();
    }

    /// Transition to released: clear the borrower and restart the wait clock
    /// (which now measures idle time).
    pub(crate) fn mark_released(&self) {
        if let Some(borrower) = self.borrower.lock().take() {
            trace!(session = %self.session.describe(), borrower = %borrower, "released session");
        }
        self.leased.store(false, Ordering::Release);
        self.reset_wait_start();
    }

    /// Mark the session as not reusable. Idempotent; once set it stays set.
    pub(crate) fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            debug!(session = %self.session.describe(), "marked session as dirty");
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn max_lease(&self) -> Duration {
        Duration::from_millis(self.max_lease_ms.load(Ordering::Acquire))
    }

    /// Time spent in the current lease or idle period.
    pub(crate) fn wait_elapsed(&self) -> Duration {
        let start = Duration::from_millis(self.wait_start_ms.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(start)
    }

    /// Restart the wait clock. The watcher uses this after a lease-expiry
    /// warning so the next warning fires one full lease period later.
    pub(crate) fn reset_wait_start(&self) {
        self.wait_start_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Release);
    }

    /// Record one more lease-deadline violation; returns the new count.
    pub(crate) fn bump_expired(&self) -> u32 {
        self.expired_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Snapshot the current borrower, if any.
    pub(crate) fn borrower(&self) -> Option<Borrower> {
        self.borrower.lock().clone()
    }

    /// Attach the holder task's abort handle for termination detection.
    pub(crate) fn attach_abort(&self, handle: AbortHandle) {
        if let Some(borrower) = self.borrower.lock().as_mut() {
            borrower.set_abort(handle);
        }
    }
}
