//! Shared in-memory session factory for pool integration tests.
//!
//! Deterministic stand-in for a real driver: every open hands out a fresh
//! serial-numbered session, and knobs allow injecting open and validation
//! failures to drive the pool's recovery paths.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use leasepool::error::{Error, Result};
use leasepool::session::{Session, SessionFactory};

/// An in-memory session with observable close/rollback state.
pub struct MemSession {
    serial: u64,
    closed: AtomicBool,
    rolled_back: AtomicBool,
}

impl MemSession {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn was_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

impl Session for MemSession {
    fn describe(&self) -> String {
        format!("mem-session-{}", self.serial)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Factory producing [`MemSession`]s, with failure injection.
pub struct MemFactory {
    opened: AtomicU64,
    close_calls: AtomicU64,
    /// Fail every open once this many sessions exist (-1 = unlimited).
    open_limit: AtomicI64,
    /// Number of upcoming opens to fail.
    fail_opens: AtomicU32,
    /// Number of upcoming validations to fail.
    fail_validations: AtomicU32,
    /// Every session ever opened, for post-hoc assertions.
    sessions: Mutex<Vec<Arc<MemSession>>>,
}

impl MemFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: AtomicU64::new(0),
            close_calls: AtomicU64::new(0),
            open_limit: AtomicI64::new(-1),
            fail_opens: AtomicU32::new(0),
            fail_validations: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Sessions opened so far.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Total close invocations (a double close counts twice).
    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Sessions currently closed.
    pub fn closed_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| s.is_closed()).count()
    }

    /// The `idx`-th session ever opened.
    pub fn session(&self, idx: usize) -> Arc<MemSession> {
        Arc::clone(&self.sessions.lock()[idx])
    }

    /// Fail the next `n` opens.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Fail every open after `limit` sessions have been handed out.
    pub fn limit_opens(&self, limit: i64) {
        self.open_limit.store(limit, Ordering::SeqCst);
    }

    /// Fail the next `n` validations.
    pub fn fail_next_validations(&self, n: u32) {
        self.fail_validations.store(n, Ordering::SeqCst);
    }

    fn take_budget(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SessionFactory for MemFactory {
    async fn open(&self) -> Result<Arc<dyn Session>> {
        if Self::take_budget(&self.fail_opens) {
            return Err(Error::factory_open("injected open failure"));
        }
        let limit = self.open_limit.load(Ordering::SeqCst);
        if limit >= 0 && self.opened() >= limit as u64 {
            return Err(Error::factory_open("open limit reached"));
        }
        let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(MemSession {
            serial,
            closed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }

    async fn validate(&self, session: &dyn Session) -> Result<()> {
        if Self::take_budget(&self.fail_validations) {
            return Err(Error::session_invalid("injected validation failure"));
        }
        let mem = session
            .as_any()
            .downcast_ref::<MemSession>()
            .expect("factory only pools MemSessions");
        if mem.is_closed() {
            return Err(Error::session_invalid("session is closed"));
        }
        Ok(())
    }

    async fn close_with_rollback(&self, session: &dyn Session, rollback: bool) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(mem) = session.as_any().downcast_ref::<MemSession>() {
            if rollback && !mem.is_closed() {
                mem.rolled_back.store(true, Ordering::SeqCst);
            }
            mem.closed.store(true, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        "mem://pool-test".into()
    }
}
