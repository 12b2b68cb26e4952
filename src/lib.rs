//! # leasepool
//!
//! An async, general-purpose database connection pool: a broker that
//! amortizes the cost of opening database sessions by retaining a bounded
//! set of live sessions and lending them to concurrent callers.
//!
//! ## Features
//!
//! - **Fair acquisition**: blocked acquirers are served oldest-first by a
//!   fair permit counter; idle sessions are reused newest-first (LIFO) so
//!   hot sessions stay hot.
//! - **Validation on lend**: sessions are validated before being handed
//!   out; a bad session is discarded and the acquire retries transparently.
//! - **Lease watching**: a background watcher warns about sessions held past
//!   their lease bound, can interrupt the borrower, and after repeated
//!   violations evicts the session so a stalled borrower cannot starve the
//!   pool.
//! - **Idle pruning**: sessions idle past their bound are closed from the
//!   cold tail of the queue, down to the pool's minimum size.
//! - **Pluggable drivers**: the pool consumes a small
//!   [`SessionFactory`](session::SessionFactory) contract (open, validate,
//!   close); concrete database factories live outside the core.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use leasepool::prelude::*;
//!
//! let pool = Pool::with_factory(
//!     PoolConfig::default()
//!         .with_min_size(2)
//!         .with_max_size(10)
//!         .with_watcher(WatcherConfig::default().with_max_lease(Duration::from_secs(30))),
//!     Arc::new(MyFactory::new("postgres://localhost/db")),
//! );
//! pool.open(true).await?;
//!
//! let lease = pool.acquire().await?;
//! let conn = lease.as_any().downcast_ref::<MySession>().unwrap();
//! // ... run statements ...
//! pool.release(lease).await;
//!
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod entry;
pub mod error;
mod idle;
pub mod pool;
pub mod session;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::entry::SessionId;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::pool::{Pool, PoolConfig, PoolStats, SessionLease};
    pub use crate::session::{Session, SessionFactory};
    pub use crate::watcher::WatcherConfig;
}

pub use error::{Error, ErrorKind, Result};
pub use pool::{Pool, PoolConfig, PoolStats, SessionLease};
pub use session::{Session, SessionFactory};
pub use watcher::WatcherConfig;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_prelude_imports() {
        let config = PoolConfig::default()
            .with_max_size(3)
            .with_watcher(WatcherConfig::default().with_max_lease(Duration::from_secs(1)));
        let _pool = Pool::new(config);
        let _stats = PoolStats::default();
    }

    #[test]
    fn test_error_types() {
        let err = Error::acquire_timeout(Duration::from_secs(1));
        assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
        assert!(err.is_retriable());
    }
}
