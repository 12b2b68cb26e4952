//! Error types for leasepool
//!
//! The pool distinguishes caller mistakes (acquiring from a closed pool,
//! opening without a factory) from transient conditions a caller may retry
//! (acquire timeout, a factory that could not open a session).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for leasepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Flat classification of pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Pool was closed; closed is terminal
    Closed,
    /// No session factory configured
    FactoryMissing,
    /// Acquire deadline elapsed without obtaining a session (retriable)
    AcquireTimeout,
    /// A waiting acquirer was woken because the pool shut down
    AcquireInterrupted,
    /// Session failed validation; consumed by the acquire retry loop
    SessionInvalid,
    /// The factory could not open a new session (retriable)
    FactoryOpen,
    /// Unexpected failure inside the watcher task; logged, never returned
    Watcher,
}

impl ErrorKind {
    /// Whether errors of this kind are generally worth retrying
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout | Self::SessionInvalid | Self::FactoryOpen
        )
    }
}

/// Main error type for leasepool
#[derive(Error, Debug)]
pub enum Error {
    /// Operation on a pool that has been closed
    #[error("pool is closed")]
    Closed,

    /// The pool was opened or used without a session factory
    #[error("a session factory is required")]
    FactoryMissing,

    /// No session could be acquired within the deadline
    #[error("failed to acquire a session from the pool within {waited_ms} ms")]
    AcquireTimeout {
        /// Wall time spent waiting, in milliseconds
        waited_ms: u64,
    },

    /// The acquire wait was interrupted by pool shutdown
    #[error("interrupted while waiting to acquire a session")]
    AcquireInterrupted,

    /// A pooled session failed validation
    #[error("session is invalid: {message}")]
    SessionInvalid {
        /// What the validation check reported
        message: String,
    },

    /// The factory failed to open a new session
    #[error("factory could not open a session: {message}")]
    FactoryOpen {
        /// What the factory reported
        message: String,
        /// Underlying driver error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The background watcher died unexpectedly
    #[error("watcher error: {message}")]
    Watcher {
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::Closed,
            Self::FactoryMissing => ErrorKind::FactoryMissing,
            Self::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            Self::AcquireInterrupted => ErrorKind::AcquireInterrupted,
            Self::SessionInvalid { .. } => ErrorKind::SessionInvalid,
            Self::FactoryOpen { .. } => ErrorKind::FactoryOpen,
            Self::Watcher { .. } => ErrorKind::Watcher,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Create an acquire-timeout error from the elapsed wait
    pub fn acquire_timeout(waited: Duration) -> Self {
        Self::AcquireTimeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a session-invalid error
    pub fn session_invalid(message: impl Into<String>) -> Self {
        Self::SessionInvalid {
            message: message.into(),
        }
    }

    /// Create a factory-open error
    pub fn factory_open(message: impl Into<String>) -> Self {
        Self::FactoryOpen {
            message: message.into(),
            source: None,
        }
    }

    /// Create a factory-open error with the underlying driver error
    pub fn factory_open_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::FactoryOpen {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a watcher error
    pub fn watcher(message: impl Into<String>) -> Self {
        Self::Watcher {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::FactoryMissing => write!(f, "factory_missing"),
            Self::AcquireTimeout => write!(f, "acquire_timeout"),
            Self::AcquireInterrupted => write!(f, "acquire_interrupted"),
            Self::SessionInvalid => write!(f, "session_invalid"),
            Self::FactoryOpen => write!(f, "factory_open"),
            Self::Watcher => write!(f, "watcher"),
        }
    }
}
