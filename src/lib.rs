//! Circuit: circuit breakers with sliding-window error tracking and
//! probabilistic backoff recovery.
//!
//! A [`Breaker`] wraps fallible, potentially slow operations — HTTP calls,
//! RPC stubs, database queries — and suppresses traffic to a failing
//! dependency while allowing controlled recovery. A [`BreakerBox`] manages
//! many named breakers and multiplexes their state-change events onto a
//! single observer channel.
//!
//! # How it works
//!
//! ```text
//!                 ┌────────────────────────────────────────────────┐
//!                 │                 Breaker<T>                     │
//!  run(ctx, op) ──►  pre-processors → fitness gate → timed exec    │
//!                 │                        │             │         │
//!                 │                  reads state    post-processors│
//!                 │                        │             │         │
//!                 │   ┌──────────────┐     │       failure? incr   │
//!                 │   │  calculator  │◄────┘             │         │
//!                 │   │ (baud ticks) │             ┌─────▼──────┐  │
//!                 │   └──────┬───────┘             │ErrorTracker│  │
//!                 │          └── transitions ─────►│ (window)   │  │
//!                 │                                └────────────┘  │
//!                 └────────────────────────────────────────────────┘
//! ```
//!
//! Failures are recorded into a sliding time window. Every `baud_rate` a
//! background calculator compares the windowed error count against the
//! breaker's threshold:
//!
//! - **Closed → Open** when errors exceed the threshold. An optional
//!   `lockout` then forces the breaker open for a fixed interval.
//! - **Open → Throttled** once the lockout has elapsed and the error count
//!   has decayed back to the threshold.
//! - **Throttled → Closed** after a full backoff: the block probability is
//!   re-drawn from an [`Interpolation`] curve across 100 ticks, letting an
//!   increasing fraction of calls through.
//! - **Throttled → Open** when errors spike again during recovery.
//!
//! # Quick start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use circuit::{Breaker, BreakerError, BreakerOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker: Breaker<String> = Breaker::new(BreakerOptions {
//!     name: Some("billing-api".to_owned()),
//!     timeout: Some(Duration::from_secs(1)),
//!     threshold: Some(10),
//!     lockout: Duration::from_secs(5),
//!     ..BreakerOptions::default()
//! });
//!
//! let result = breaker
//!     .run(&CancellationToken::new(), |ctx| async move {
//!         // The child token is cancelled on timeout; long operations
//!         // should watch it and wind down.
//!         let _ = ctx;
//!         Ok("invoice-42".to_owned())
//!     })
//!     .await;
//!
//! match result {
//!     Ok(invoice) => println!("billed: {invoice}"),
//!     Err(BreakerError::Open | BreakerError::Throttled) => {
//!         println!("billing is degraded, serving from queue")
//!     }
//!     Err(err) => eprintln!("billing failed: {err}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Watching a fleet of breakers
//!
//! ```rust
//! use circuit::{BreakerBox, BreakerOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let boxed: BreakerBox<()> = BreakerBox::new();
//! let mut changes = boxed.state_change().expect("first take");
//!
//! for name in ["users-db", "search", "mailer"] {
//!     boxed.create(BreakerOptions {
//!         name: Some(name.to_owned()),
//!         ..BreakerOptions::default()
//!     })?;
//! }
//!
//! tokio::spawn(async move {
//!     while let Some(change) = changes.recv().await {
//!         tracing::info!(breaker = %change.name, state = %change.state, "state change");
//!     }
//! });
//! # Ok(())
//! # }
//! ```
//!
//! # Module organization
//!
//! - [`breaker`]: the breaker itself — options, state machine, run pipeline
//! - [`breaker_box`]: named registry with a multiplexed state-change stream
//! - [`interpolation`]: backoff curves
//! - [`processors`]: pre-/post-processor hook types
//! - [`state`]: state enum and timestamped snapshots
//! - [`error`]: the error taxonomy
//!
//! # Concurrency notes
//!
//! All handles are cheap to clone and safe to share across tasks. Status
//! reads (`state`, `size`, `snapshot`) are lock-free; transitions are
//! serialized internally. Background tasks hold only weak references, so
//! dropping the last handle to a breaker stops its workers; `close()` stops
//! them eagerly. The library never installs a tracing subscriber or touches
//! the caller's cancellation tokens — only derived child tokens are
//! cancelled.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod breaker;
pub mod breaker_box;
pub mod error;
pub mod interpolation;
pub mod processors;
pub mod state;

mod tracker;

pub use breaker::{
    Breaker, BreakerOptions, DEFAULT_BACKOFF, DEFAULT_BAUD_RATE, DEFAULT_THRESHOLD,
    DEFAULT_TIMEOUT, DEFAULT_WINDOW,
};
pub use breaker_box::BreakerBox;
pub use error::{BreakerError, Result};
pub use interpolation::Interpolation;
pub use processors::{PostProcessor, PreProcessor, Runner, RunnerFuture};
pub use state::{BreakerState, State};
