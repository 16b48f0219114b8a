//! Error types for the circuit crate.
//!
//! Every fallible operation in this crate returns [`BreakerError`]. The
//! variants fall into four kinds:
//!
//! - **Rejection** ([`Open`](BreakerError::Open),
//!   [`Throttled`](BreakerError::Throttled)): the breaker refused to run the
//!   operation.
//! - **Timeout** ([`Timeout`](BreakerError::Timeout)): the operation ran but
//!   exceeded the breaker's deadline.
//! - **Execution** ([`Execution`](BreakerError::Execution)): the operation ran
//!   and failed with its own error.
//! - **Misuse** ([`NotInitialized`](BreakerError::NotInitialized),
//!   [`UnnamedBreaker`](BreakerError::UnnamedBreaker),
//!   [`UnknownState`](BreakerError::UnknownState)): the caller used the API
//!   incorrectly.
//!
//! The textual form of each variant is stable and prefixed with `circuit:`,
//! so log lines and error strings remain grep-able across versions.
//!
//! # Examples
//!
//! ```
//! use circuit::BreakerError;
//!
//! fn describe(err: &BreakerError) -> &'static str {
//!     match err {
//!         BreakerError::Open | BreakerError::Throttled => "rejected, back off",
//!         BreakerError::Timeout => "dependency is slow",
//!         BreakerError::Execution(_) => "dependency failed",
//!         _ => "caller bug",
//!     }
//! }
//!
//! assert_eq!(describe(&BreakerError::Open), "rejected, back off");
//! ```

use thiserror::Error;

/// Result type alias for breaker operations.
pub type Result<T> = std::result::Result<T, BreakerError>;

/// Errors surfaced by [`Breaker::run`](crate::Breaker::run) and
/// [`BreakerBox`](crate::BreakerBox) operations.
///
/// Callers discriminate with a typed match. Only execution errors carry a
/// payload; use [`anyhow::Error::downcast_ref`] to recover the concrete
/// operation error.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker has been shut down with [`close`](crate::Breaker::close)
    /// and can no longer gate work.
    #[error("circuit: breaker must be instantiated with Breaker::new")]
    NotInitialized,

    /// The operation did not complete within the breaker's `timeout`.
    ///
    /// The invocation's child cancellation token has been cancelled (unless
    /// the breaker was configured with `ignore_context`), and the failure has
    /// been recorded in the error tracker.
    #[error("circuit: breaker timed out")]
    Timeout,

    /// The breaker's state word held a value outside the known states.
    ///
    /// Unreachable through safe use of this crate; kept as the defensive arm
    /// of the fitness check.
    #[error("circuit: unknown state")]
    UnknownState,

    /// The breaker is [`Open`](crate::State::Open): every call is rejected
    /// without running the operation.
    #[error("circuit: the circuit breaker is open")]
    Open,

    /// The breaker is [`Throttled`](crate::State::Throttled) and this call
    /// lost the probabilistic draw. Retrying immediately may succeed; the
    /// pass rate rises as the backoff progresses.
    #[error("circuit: breaker is throttled")]
    Throttled,

    /// A breaker registered in a [`BreakerBox`](crate::BreakerBox) must carry
    /// a non-empty name.
    #[error("circuit: breakers used in a breaker box must have a name")]
    UnnamedBreaker,

    /// The caller's cancellation token was already cancelled when the call
    /// reached the fitness check.
    #[error("circuit: context canceled")]
    Canceled,

    /// The wrapped operation (or a processor) failed with its own error.
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

impl BreakerError {
    /// True for the rejection variants, where the operation never ran.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open | Self::Throttled)
    }
}
