//! Processor chains for the run pipeline.
//!
//! Pre-processors run before the fitness check and may replace the
//! cancellation token and/or the operation itself; a pre-processor error
//! aborts the invocation (the operation never runs) and is recorded as a
//! failure. Post-processors run after the operation settles and may rewrite
//! the outcome in either direction; the result of the last post-processor
//! decides whether the failure is recorded.
//!
//! # Examples
//!
//! A pre-processor that swaps in a stub operation, and a post-processor that
//! masks a specific failure:
//!
//! ```
//! use std::sync::Arc;
//!
//! use circuit::{BreakerError, BreakerOptions, PostProcessor, PreProcessor, Runner};
//!
//! let stub: PreProcessor<&'static str> = Arc::new(|ctx, _runner| {
//!     let replacement: Runner<&'static str> = Box::new(|_| Box::pin(async { Ok("stubbed") }));
//!     Ok((ctx, replacement))
//! });
//!
//! let mask_timeouts: PostProcessor<&'static str> = Arc::new(|_ctx, outcome| match outcome {
//!     Err(BreakerError::Timeout) => Ok("timed out, serving fallback"),
//!     other => other,
//! });
//!
//! let opts = BreakerOptions {
//!     pre_processors: vec![stub],
//!     post_processors: vec![mask_timeouts],
//!     ..BreakerOptions::default()
//! };
//! # let _ = opts;
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// The boxed form of a wrapped operation.
///
/// [`Breaker::run`](crate::Breaker::run) boxes the caller's closure into this
/// shape before the pre-processor chain runs, so processors can hand back a
/// different operation entirely.
pub type Runner<T> = Box<dyn FnOnce(CancellationToken) -> RunnerFuture<T> + Send>;

/// The future produced by a [`Runner`].
pub type RunnerFuture<T> = BoxFuture<'static, std::result::Result<T, anyhow::Error>>;

/// A hook that runs before the fitness check.
///
/// Receives the invocation's cancellation token and the (possibly already
/// substituted) runner; returns replacements for both, or an error that
/// aborts the invocation.
pub type PreProcessor<T> =
    Arc<dyn Fn(CancellationToken, Runner<T>) -> anyhow::Result<(CancellationToken, Runner<T>)> + Send + Sync>;

/// A hook that runs after the operation settles.
///
/// Receives the caller's cancellation token and the outcome so far; whatever
/// it returns becomes the outcome seen by the next post-processor and,
/// ultimately, the caller.
pub type PostProcessor<T> = Arc<dyn Fn(&CancellationToken, Result<T>) -> Result<T> + Send + Sync>;
