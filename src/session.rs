//! Session and factory traits for leasepool
//!
//! The pool core is driver-agnostic: it brokers opaque [`Session`] handles
//! and delegates every driver-level operation (open, validate, close) to a
//! [`SessionFactory`]. Concrete factories for particular databases live
//! outside this crate.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;

/// An opened, per-client database context managed by the pool.
///
/// The core only needs identity and a log-friendly description from a
/// session. The actual query surface belongs to the concrete driver type;
/// callers recover it through [`Session::as_any`]:
///
/// ```rust,ignore
/// let lease = pool.acquire().await?;
/// let conn = lease
///     .as_any()
///     .downcast_ref::<PgSession>()
///     .expect("pool built from PgSessionFactory");
/// conn.execute("SELECT 1", &[]).await?;
/// ```
///
/// Methods take `&self`: one session is shared (never used concurrently, see
/// the pool's uniqueness guarantee) between the borrower holding it and the
/// pool bookkeeping that may still need to close it.
pub trait Session: Send + Sync + 'static {
    /// Short description of this session for log messages
    fn describe(&self) -> String;

    /// Downcast support for recovering the concrete driver session
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Factory for opening, validating and closing raw database sessions.
///
/// This is the single plug-in surface of the pool. Implementations should be
/// cheap to share (`Arc<dyn SessionFactory>`) and must keep
/// [`describe`](SessionFactory::describe) stable for the factory's lifetime:
/// the pool uses it to give log messages database context.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new session.
    ///
    /// Errors surface directly to the acquiring caller, except during
    /// `open(fail_fast = false)` warmup where they are logged and absorbed.
    async fn open(&self) -> Result<Arc<dyn Session>>;

    /// Validate a session before it is lent out.
    ///
    /// Must be cheap and bounded. Any error means "this session is bad";
    /// the pool discards the session and retries with another one.
    async fn validate(&self, session: &dyn Session) -> Result<()>;

    /// Close a session, attempting a rollback first when `rollback` is
    /// requested and the session is not in autocommit mode.
    ///
    /// Best effort: implementations log their own failures, the pool never
    /// sees them.
    async fn close_with_rollback(&self, session: &dyn Session, rollback: bool);

    /// Close a session without requesting a rollback.
    async fn close(&self, session: &dyn Session) {
        self.close_with_rollback(session, false).await;
    }

    /// Stable identity of this factory (e.g. the database URL) used in log
    /// messages and as a hash key.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSession;

    impl Session for StubSession {
        fn describe(&self) -> String {
            "stub".into()
        }

        fn as_any(&self) -> &(dyn Any + Send + Sync) {
            self
        }
    }

    struct StubFactory {
        rollback_requested: AtomicBool,
    }

    #[async_trait]
    impl SessionFactory for StubFactory {
        async fn open(&self) -> Result<Arc<dyn Session>> {
            Ok(Arc::new(StubSession))
        }

        async fn validate(&self, _session: &dyn Session) -> Result<()> {
            Err(Error::session_invalid("always bad"))
        }

        async fn close_with_rollback(&self, _session: &dyn Session, rollback: bool) {
            self.rollback_requested.store(rollback, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "stub://mem".into()
        }
    }

    #[tokio::test]
    async fn test_close_default_skips_rollback() {
        let factory = StubFactory {
            rollback_requested: AtomicBool::new(true),
        };
        let session = factory.open().await.unwrap();
        factory.close(&*session).await;
        assert!(!factory.rollback_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_session_downcast() {
        let factory = StubFactory {
            rollback_requested: AtomicBool::new(false),
        };
        let session = factory.open().await.unwrap();
        assert!(session.as_any().downcast_ref::<StubSession>().is_some());
        assert_eq!(session.describe(), "stub");
    }
}
