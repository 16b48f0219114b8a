//! The circuit breaker: state machine, error density, backoff throttling.
//!
//! A [`Breaker`] wraps fallible, potentially slow operations and suppresses
//! traffic to a failing dependency while allowing controlled recovery.
//!
//! # States
//!
//! - **Closed**: normal operation, calls flow through
//! - **Open**: too many recent failures, every call is rejected
//! - **Throttled**: recovering, a decaying fraction of calls is rejected
//!
//! # State transitions
//!
//! ```text
//! Closed ───[errors > threshold]──────────► Open ◄──[errors > threshold]──┐
//!    ▲                                       │                            │
//!    │                                       │ [lockout elapsed,          │
//!    │                                       │  errors ≤ threshold]       │
//!    │                                       ▼                            │
//!    └──[backoff completed, 100 ticks]── Throttled ───────────────────────┘
//! ```
//!
//! No other transition is permitted; in particular a breaker never jumps
//! from Closed to Throttled or from Open straight to Closed.
//!
//! Failures are counted by a sliding-window error tracker, and a
//! background calculator re-evaluates the state every `baud_rate`. While
//! throttled, the block probability follows the configured
//! [`Interpolation`] curve across 100 ticks of `backoff / 100` each.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//!
//! use circuit::{Breaker, BreakerError, BreakerOptions, State};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker: Breaker<String> = Breaker::new(BreakerOptions {
//!     name: Some("catalog-api".to_owned()),
//!     timeout: Some(Duration::from_secs(1)),
//!     lockout: Duration::from_secs(5),
//!     ..BreakerOptions::default()
//! });
//!
//! let result = breaker
//!     .run(&CancellationToken::new(), |_ctx| async {
//!         Ok::<_, anyhow::Error>("response".to_owned())
//!     })
//!     .await;
//!
//! match result {
//!     Ok(body) => println!("got: {body}"),
//!     Err(BreakerError::Open) => println!("dependency is down, not calling"),
//!     Err(BreakerError::Throttled) => println!("recovering, try again"),
//!     Err(err) => println!("failed: {err}"),
//! }
//!
//! assert_eq!(breaker.state(), State::Closed);
//! # Ok(())
//! # }
//! ```

use std::{
    future::Future,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BreakerError, Result},
    interpolation::Interpolation,
    processors::{PostProcessor, PreProcessor, Runner},
    state::{BreakerState, State, end_of, now_nanos, time_from_nanos},
    tracker::ErrorTracker,
};

/// Default maximum duration a single invocation may run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default period of the background state re-evaluation tick.
pub const DEFAULT_BAUD_RATE: Duration = Duration::from_millis(250);
/// Default duration of the throttled recovery phase.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);
/// Default sliding window of the error tracker.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);
/// Default number of windowed errors above which the breaker opens.
pub const DEFAULT_THRESHOLD: u32 = 5;

const MINIMUM_BAUD_RATE: Duration = Duration::from_millis(10);
const MINIMUM_BACKOFF: Duration = Duration::from_secs(1);
const MINIMUM_WINDOW: Duration = Duration::from_secs(5);
const MINIMUM_THRESHOLD: u32 = 1;

const STATE_CLOSED: u32 = State::Closed as u32;
const STATE_THROTTLED: u32 = State::Throttled as u32;
const STATE_OPEN: u32 = State::Open as u32;

/// Capacity of the per-breaker state-change channel.
const STATE_CHANGE_CAPACITY: usize = 5;
/// A backoff period is divided into this many interpolation ticks.
const BACKOFF_TICKS: u32 = 100;

/// Configuration for a [`Breaker`].
///
/// Every field is optional in the sense that its zero configuration is
/// usable: unset durations and counts take the documented defaults, and
/// explicit values are clamped up to their floors.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use circuit::BreakerOptions;
///
/// // A breaker for a flaky upstream: open fast, stay locked for 10s,
/// // recover over 30s.
/// let opts: BreakerOptions<()> = BreakerOptions {
///     name: Some("flaky-upstream".to_owned()),
///     threshold: Some(2),
///     lockout: Duration::from_secs(10),
///     backoff: Some(Duration::from_secs(30)),
///     ..BreakerOptions::default()
/// };
/// # let _ = opts;
/// ```
pub struct BreakerOptions<T> {
    /// Breaker name. When absent (or empty) a unique `breaker-{uuid}` name
    /// is synthesized.
    pub name: Option<String>,

    /// Maximum duration a single [`run`](Breaker::run) invocation may
    /// execute before timing out. Default 3 seconds.
    pub timeout: Option<Duration>,

    /// Period of the background error re-calculation tick. Default 250 ms,
    /// floor 10 ms.
    pub baud_rate: Option<Duration>,

    /// Duration of the throttled recovery phase. Default 1 minute, floor
    /// 1 second.
    pub backoff: Option<Duration>,

    /// Length of time checked for error density. Default 10 minutes, floor
    /// 5 seconds.
    pub window: Option<Duration>,

    /// Number of windowed errors that must be exceeded (strictly) before the
    /// breaker opens. Default 5, floor 1.
    pub threshold: Option<u32>,

    /// Length of time the breaker is forced open before it may throttle.
    /// Zero (the default) means no lockout: the breaker throttles as soon as
    /// its error count decays to the threshold.
    ///
    /// While open, all requests are rejected and no new errors are recorded.
    pub lockout: Duration,

    /// When true, transitioning into Open empties the error tracker, so the
    /// lockout alone decides when recovery may begin.
    pub opening_resets_errors: bool,

    /// When true, a timeout or failure does not cancel the operation's child
    /// cancellation token.
    pub ignore_context: bool,

    /// The curve that maps backoff progress to block probability.
    /// Default [`Interpolation::Linear`].
    pub interpolation: Interpolation,

    /// Hooks applied, in order, before the fitness check. See
    /// [`processors`](crate::processors).
    pub pre_processors: Vec<PreProcessor<T>>,

    /// Hooks applied, in order, to the outcome. See
    /// [`processors`](crate::processors).
    pub post_processors: Vec<PostProcessor<T>>,
}

impl<T> Default for BreakerOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            timeout: None,
            baud_rate: None,
            backoff: None,
            window: None,
            threshold: None,
            lockout: Duration::ZERO,
            opening_resets_errors: false,
            ignore_context: false,
            interpolation: Interpolation::default(),
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
        }
    }
}

impl<T> std::fmt::Debug for BreakerOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerOptions")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("baud_rate", &self.baud_rate)
            .field("backoff", &self.backoff)
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("lockout", &self.lockout)
            .field("opening_resets_errors", &self.opening_resets_errors)
            .field("ignore_context", &self.ignore_context)
            .field("interpolation", &self.interpolation)
            .field("pre_processors", &self.pre_processors.len())
            .field("post_processors", &self.post_processors.len())
            .finish()
    }
}

/// Background timer tasks owned by the current state. Guarded by the
/// transition mutex.
#[derive(Debug, Default)]
struct Timers {
    lockout: Option<JoinHandle<()>>,
    backoff: Option<JoinHandle<()>>,
}

struct Core<T> {
    name: String,
    timeout: Duration,
    baud_rate: Duration,
    backoff: Duration,
    window: Duration,
    lockout: Duration,
    threshold: u32,
    opening_resets_errors: bool,
    ignore_context: bool,
    interpolation: Interpolation,
    pre_processors: Vec<PreProcessor<T>>,
    post_processors: Vec<PostProcessor<T>>,

    state: AtomicU32,
    throttle_chance: AtomicU32,
    lock_created: AtomicI64,
    throttle_created: AtomicI64,
    closed_since: AtomicI64,
    live: AtomicBool,

    /// Serializes full state transitions and owns the timer handles. Never
    /// held across a blocking send, an await point or user code.
    transition: Mutex<Timers>,
    tracker: ErrorTracker,
    events: mpsc::Sender<BreakerState>,
    events_rx: Mutex<Option<mpsc::Receiver<BreakerState>>>,
    calc_task: Mutex<Option<JoinHandle<()>>>,
}

/// A three-state circuit breaker with probabilistic backoff recovery.
///
/// Cloning a `Breaker` is cheap and yields another handle to the same
/// underlying breaker; this is how a breaker is shared between callers and a
/// [`BreakerBox`](crate::BreakerBox).
///
/// Background work (the calculator, the error tracker, lockout and backoff
/// timers) runs on tokio tasks that hold only weak references, so dropping
/// the last handle stops all of them. [`close`](Breaker::close) stops them
/// eagerly.
pub struct Breaker<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for Breaker<T> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

impl<T> std::fmt::Debug for Breaker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker")
            .field("name", &self.core.name)
            .field("state", &self.core.current_state())
            .field("size", &self.core.tracker.size())
            .finish()
    }
}

impl<T: Send + 'static> Breaker<T> {
    /// Creates a new breaker from the supplied options and starts its
    /// background calculator.
    ///
    /// The breaker starts Closed and immediately publishes its initial
    /// Closed snapshot on the state-change channel.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, which is required for the
    /// breaker's background tasks.
    #[must_use]
    pub fn new(opts: BreakerOptions<T>) -> Self {
        let name = match opts.name {
            Some(name) if !name.is_empty() => name,
            _ => format!("breaker-{}", Uuid::new_v4()),
        };
        // Defaults apply to unset fields first; floors then clamp explicit
        // values upward.
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let baud_rate = opts.baud_rate.unwrap_or(DEFAULT_BAUD_RATE).max(MINIMUM_BAUD_RATE);
        let backoff = opts.backoff.unwrap_or(DEFAULT_BACKOFF).max(MINIMUM_BACKOFF);
        let window = opts.window.unwrap_or(DEFAULT_WINDOW).max(MINIMUM_WINDOW);
        let threshold = opts.threshold.unwrap_or(DEFAULT_THRESHOLD).max(MINIMUM_THRESHOLD);

        let (events, events_rx) = mpsc::channel(STATE_CHANGE_CAPACITY);

        let core = Arc::new(Core {
            name,
            timeout,
            baud_rate,
            backoff,
            window,
            lockout: opts.lockout,
            threshold,
            opening_resets_errors: opts.opening_resets_errors,
            ignore_context: opts.ignore_context,
            interpolation: opts.interpolation,
            pre_processors: opts.pre_processors,
            post_processors: opts.post_processors,
            state: AtomicU32::new(STATE_CLOSED),
            throttle_chance: AtomicU32::new(0),
            lock_created: AtomicI64::new(0),
            throttle_created: AtomicI64::new(0),
            closed_since: AtomicI64::new(now_nanos()),
            live: AtomicBool::new(true),
            transition: Mutex::new(Timers::default()),
            tracker: ErrorTracker::new(window),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            calc_task: Mutex::new(None),
        });

        let calc = tokio::spawn(calc_loop(Arc::downgrade(&core)));
        *core.calc_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(calc);

        debug!(
            breaker = %core.name,
            timeout = ?core.timeout,
            baud_rate = ?core.baud_rate,
            window = ?core.window,
            backoff = ?core.backoff,
            lockout = ?core.lockout,
            threshold = core.threshold,
            "circuit breaker created"
        );

        let _ = core.events.try_send(core.snapshot());

        Self { core }
    }

    /// Executes `op` through the breaker.
    ///
    /// The operation receives a child [`CancellationToken`] derived from
    /// `ctx`; a timeout or failure cancels the child (unless the breaker was
    /// configured with `ignore_context`), while `ctx` itself is never
    /// cancelled by the breaker.
    ///
    /// Pipeline, in order: pre-processors (may substitute token and
    /// operation), fitness check, timed execution on its own task,
    /// post-processors, outcome recording.
    ///
    /// # Errors
    ///
    /// - [`BreakerError::NotInitialized`] after [`close`](Breaker::close)
    /// - [`BreakerError::Canceled`] when `ctx` is already cancelled
    /// - [`BreakerError::Open`] / [`BreakerError::Throttled`] rejections
    /// - [`BreakerError::Timeout`] when `op` outlives the breaker's timeout
    /// - [`BreakerError::Execution`] when `op` or a processor fails
    ///
    /// # Examples
    ///
    /// ```rust
    /// use circuit::{Breaker, BreakerOptions};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let breaker: Breaker<u64> = Breaker::new(BreakerOptions::default());
    ///
    /// let answer = breaker
    ///     .run(&CancellationToken::new(), |_ctx| async { Ok(42) })
    ///     .await?;
    ///
    /// assert_eq!(answer, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<F, Fut>(&self, ctx: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, anyhow::Error>> + Send + 'static,
    {
        let core = &self.core;
        if !core.live.load(Ordering::Acquire) {
            return Err(BreakerError::NotInitialized);
        }

        let mut ctx = ctx.clone();
        let mut runner: Runner<T> = Box::new(move |token| Box::pin(op(token)));
        for pre in &core.pre_processors {
            match pre(ctx, runner) {
                Ok((next_ctx, next_runner)) => {
                    ctx = next_ctx;
                    runner = next_runner;
                }
                Err(err) => {
                    core.tracker.incr();
                    return Err(BreakerError::Execution(err));
                }
            }
        }

        core.check_fitness(&ctx)?;

        let child = ctx.child_token();
        let mut task = tokio::spawn(runner(child.clone()));

        let mut outcome: Result<T> = tokio::select! {
            _ = time::sleep(core.timeout) => {
                // The operation keeps running on its own task; it is expected
                // to observe the cancelled child token and wind down.
                if !core.ignore_context {
                    child.cancel();
                }
                Err(BreakerError::Timeout)
            }
            joined = &mut task => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    if !core.ignore_context {
                        child.cancel();
                    }
                    Err(BreakerError::Execution(err))
                }
                Err(join_err) => {
                    if !core.ignore_context {
                        child.cancel();
                    }
                    Err(BreakerError::Execution(anyhow::Error::new(join_err)))
                }
            }
        };

        for post in &core.post_processors {
            outcome = post(&ctx, outcome);
        }

        // The outcome after the post chain decides whether this invocation
        // counts against the error window. Successes never decrement.
        if outcome.is_err() {
            core.tracker.incr();
        }
        outcome
    }

    /// The current state. Lock-free.
    #[must_use]
    pub fn state(&self) -> State {
        self.core.current_state()
    }

    /// The number of errors in the current tracking window. Wait-free.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.core.tracker.size()
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// A snapshot of the breaker's state with the timestamps relevant to it.
    #[must_use]
    pub fn snapshot(&self) -> BreakerState {
        self.core.snapshot()
    }

    /// Takes the state-change receiver.
    ///
    /// The breaker publishes a [`BreakerState`] snapshot for every state
    /// change (and one for its initial Closed state) on a bounded channel;
    /// when nobody holds the receiver, or the holder lags more than the
    /// channel's capacity, events are dropped rather than blocking a
    /// transition.
    ///
    /// There is a single receiver. The first call takes it; later calls
    /// return `None`. A [`BreakerBox`](crate::BreakerBox) takes it when the
    /// breaker is created through the box.
    #[must_use]
    pub fn state_change(&self) -> Option<mpsc::Receiver<BreakerState>> {
        self.core.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Shuts the breaker down: stops the calculator, the error tracker and
    /// any running lockout/backoff timers.
    ///
    /// Subsequent [`run`](Breaker::run) calls fail with
    /// [`BreakerError::NotInitialized`]; status reads keep returning the
    /// last observed values. Idempotent.
    pub fn close(&self) {
        if !self.core.live.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.core.calc_task.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            handle.abort();
        }
        let mut timers = self.core.transition.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.lockout.take() {
            handle.abort();
        }
        if let Some(handle) = timers.backoff.take() {
            handle.abort();
        }
        drop(timers);
        self.core.tracker.close();
        info!(breaker = %self.core.name, "circuit breaker shut down");
    }

    /// Drives a state transition directly, bypassing the calculator.
    #[cfg(test)]
    pub(crate) fn force_state(&self, to: State) {
        Core::change_state_to(&self.core, to as u32);
    }

    /// True when both handles refer to the same underlying breaker.
    #[cfg(test)]
    pub(crate) fn shares_core(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

async fn calc_loop<T>(core: Weak<Core<T>>)
where
    T: Send + 'static,
{
    let Some(strong) = core.upgrade() else { return };
    let period = strong.baud_rate;
    drop(strong);

    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(core) = core.upgrade() else { return };
        Core::calc(&core);
    }
}

impl<T> Core<T> {
    #[allow(
        clippy::unreachable,
        reason = "the state word is only ever written from State values"
    )]
    fn current_state(&self) -> State {
        match State::from_raw(self.state.load(Ordering::Acquire)) {
            Some(state) => state,
            None => unreachable!("invalid circuit state"),
        }
    }

    /// A breaker counts as locked only while a lockout is configured and its
    /// stamp has not been cleared by the unlock timer.
    fn locked(&self) -> bool {
        !self.lockout.is_zero() && self.lock_created.load(Ordering::Acquire) != 0
    }

    /// Decides whether a call may proceed given the caller's token and the
    /// breaker's state.
    fn check_fitness(&self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(BreakerError::Canceled);
        }
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => Err(BreakerError::Open),
            STATE_THROTTLED => self.apply_throttle(),
            STATE_CLOSED => Ok(()),
            _ => Err(BreakerError::UnknownState),
        }
    }

    fn apply_throttle(&self) -> Result<()> {
        let chance = self.throttle_chance.load(Ordering::Acquire);
        let draw = rand::thread_rng().gen_range(0..100u32);
        if draw < chance {
            debug!(breaker = %self.name, chance, draw, "call throttled");
            return Err(BreakerError::Throttled);
        }
        Ok(())
    }

    fn set_closed(&self, closed: bool) {
        self.closed_since.store(if closed { now_nanos() } else { 0 }, Ordering::Release);
    }

    fn snapshot(&self) -> BreakerState {
        let state = self.current_state();
        let mut snap = BreakerState::bare(&self.name, state);
        match state {
            State::Closed => {
                snap.closed_since = time_from_nanos(self.closed_since.load(Ordering::Acquire));
            }
            State::Throttled => {
                if let Some(since) =
                    time_from_nanos(self.throttle_created.load(Ordering::Acquire))
                {
                    snap.throttled = Some(since);
                    snap.backoff_ends = end_of(since, self.backoff);
                }
            }
            State::Open => {
                if let Some(since) = time_from_nanos(self.lock_created.load(Ordering::Acquire)) {
                    snap.opened = Some(since);
                    if !self.lockout.is_zero() {
                        snap.lockout_ends = end_of(since, self.lockout);
                    }
                }
            }
        }
        snap
    }
}

/// The permitted transition matrix. Everything else, including
/// self-transitions, is a no-op.
fn transition_permitted(from: u32, to: u32) -> bool {
    matches!(
        (from, to),
        (STATE_CLOSED, STATE_OPEN)
            | (STATE_THROTTLED, STATE_OPEN)
            | (STATE_OPEN, STATE_THROTTLED)
            | (STATE_THROTTLED, STATE_CLOSED)
    )
}

impl<T: Send + 'static> Core<T> {
    /// Re-evaluates the state against the error window. Runs every baud
    /// tick.
    fn calc(core: &Arc<Self>) {
        match core.state.load(Ordering::Acquire) {
            STATE_CLOSED | STATE_THROTTLED => {
                if core.tracker.size() > core.threshold {
                    Self::change_state_to(core, STATE_OPEN);
                }
            }
            STATE_OPEN => {
                if core.locked() {
                    return;
                }
                // Error density needs to decay a bit more.
                if core.tracker.size() > core.threshold {
                    return;
                }
                Self::change_state_to(core, STATE_THROTTLED);
            }
            _ => {}
        }
    }

    fn change_state_to(core: &Arc<Self>, to: u32) {
        let mut timers = core.transition.lock().unwrap_or_else(|e| e.into_inner());
        let from = core.state.load(Ordering::Acquire);
        if from == to {
            return;
        }
        if !transition_permitted(from, to) {
            debug!(breaker = %core.name, from, to, "refusing impermissible state transition");
            return;
        }
        core.state.store(to, Ordering::Release);

        // Exit actions run before entry actions.
        match from {
            STATE_OPEN => Self::set_locked(core, &mut timers, false),
            STATE_THROTTLED => Self::set_throttled(core, &mut timers, false),
            STATE_CLOSED => core.set_closed(false),
            _ => {}
        }
        match to {
            STATE_OPEN => {
                Self::set_locked(core, &mut timers, true);
                core.tracker.reset(core.opening_resets_errors);
                warn!(breaker = %core.name, "circuit breaker opened");
            }
            STATE_THROTTLED => {
                Self::set_throttled(core, &mut timers, true);
                info!(breaker = %core.name, "circuit breaker throttled, backing off");
            }
            STATE_CLOSED => {
                core.set_closed(true);
                info!(breaker = %core.name, "circuit breaker closed, normal operation resumed");
            }
            _ => {}
        }

        // Non-blocking offer; a missing or lagging listener loses the event.
        let _ = core.events.try_send(core.snapshot());
    }

    fn set_locked(core: &Arc<Self>, timers: &mut Timers, locked: bool) {
        if !locked {
            core.lock_created.store(0, Ordering::Release);
            if let Some(handle) = timers.lockout.take() {
                handle.abort();
            }
            return;
        }

        let stamp = now_nanos();
        core.lock_created.store(stamp, Ordering::Release);
        if core.lockout.is_zero() {
            return;
        }

        let weak = Arc::downgrade(core);
        let lockout = core.lockout;
        timers.lockout = Some(tokio::spawn(async move {
            time::sleep(lockout).await;
            let Some(core) = weak.upgrade() else { return };
            // Only release our own lock; a newer lock is owned by its own
            // timer.
            if core
                .lock_created
                .compare_exchange(stamp, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(breaker = %core.name, "lockout released");
            }
        }));
    }

    fn set_throttled(core: &Arc<Self>, timers: &mut Timers, throttled: bool) {
        if !throttled {
            core.throttle_created.store(0, Ordering::Release);
            core.throttle_chance.store(0, Ordering::Release);
            if let Some(handle) = timers.backoff.take() {
                handle.abort();
            }
            return;
        }

        core.throttle_created.store(now_nanos(), Ordering::Release);
        core.throttle_chance.store(100, Ordering::Release);

        let weak = Arc::downgrade(core);
        let period = core.backoff / BACKOFF_TICKS;
        timers.backoff = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            for tick in 1..=BACKOFF_TICKS {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else { return };
                // The backoff may have been cancelled between the tick and
                // this point; never resurrect a throttle chance after exit.
                if core.state.load(Ordering::Acquire) != STATE_THROTTLED {
                    return;
                }
                core.throttle_chance
                    .store(core.interpolation.chance(tick), Ordering::Release);
                if tick == BACKOFF_TICKS {
                    // The backoff completed without the breaker reopening.
                    Self::change_state_to(&core, STATE_CLOSED);
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32 as TestCounter;

    use tokio::time::sleep;

    use super::*;

    fn settle() -> Duration {
        Duration::from_millis(30)
    }

    #[tokio::test]
    async fn test_defaults() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        let core = &breaker.core;

        assert!(core.name.starts_with("breaker-"));
        assert_eq!(core.timeout, DEFAULT_TIMEOUT);
        assert_eq!(core.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(core.backoff, DEFAULT_BACKOFF);
        assert_eq!(core.window, DEFAULT_WINDOW);
        assert_eq!(core.threshold, DEFAULT_THRESHOLD);
        assert_eq!(core.lockout, Duration::ZERO);
        assert!(matches!(core.interpolation, Interpolation::Linear));

        assert_eq!(breaker.state(), State::Closed);
        assert_ne!(core.closed_since.load(Ordering::Acquire), 0);
        assert_eq!(core.lock_created.load(Ordering::Acquire), 0);
        assert_eq!(core.throttle_created.load(Ordering::Acquire), 0);
        assert_eq!(core.throttle_chance.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_floors_clamp_illegal_options() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            baud_rate: Some(Duration::from_millis(1)),
            backoff: Some(Duration::from_millis(1)),
            window: Some(Duration::from_millis(1)),
            threshold: Some(0),
            ..BreakerOptions::default()
        });
        let core = &breaker.core;

        assert_eq!(core.baud_rate, MINIMUM_BAUD_RATE);
        assert_eq!(core.backoff, MINIMUM_BACKOFF);
        assert_eq!(core.window, MINIMUM_WINDOW);
        assert_eq!(core.threshold, MINIMUM_THRESHOLD);
    }

    #[tokio::test]
    async fn test_empty_name_is_replaced() {
        let breaker: Breaker<()> =
            Breaker::new(BreakerOptions { name: Some(String::new()), ..BreakerOptions::default() });
        assert!(breaker.name().starts_with("breaker-"));
    }

    #[tokio::test]
    async fn test_lock_releases_after_lockout() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });
        let core = Arc::clone(&breaker.core);

        {
            let mut timers = core.transition.lock().unwrap();
            Core::set_locked(&core, &mut timers, true);
        }
        assert!(core.locked());

        sleep(Duration::from_millis(1100)).await;
        assert!(!core.locked());
        assert_eq!(core.lock_created.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_manual_unlock() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });
        let core = Arc::clone(&breaker.core);

        let mut timers = core.transition.lock().unwrap();
        Core::set_locked(&core, &mut timers, true);
        assert!(core.locked());
        Core::set_locked(&core, &mut timers, false);
        assert!(!core.locked());
    }

    #[tokio::test]
    async fn test_stale_unlock_timer_spares_newer_lock() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });
        let core = Arc::clone(&breaker.core);

        {
            let mut timers = core.transition.lock().unwrap();
            Core::set_locked(&core, &mut timers, true);
        }
        sleep(Duration::from_millis(500)).await;
        // Re-lock midway; the first timer is aborted, and even a leaked stale
        // timer could not clear the new stamp.
        {
            let mut timers = core.transition.lock().unwrap();
            Core::set_locked(&core, &mut timers, false);
            Core::set_locked(&core, &mut timers, true);
        }
        sleep(Duration::from_millis(700)).await;
        assert!(core.locked(), "the newer lock must survive the older timer's deadline");

        sleep(Duration::from_millis(500)).await;
        assert!(!core.locked());
    }

    #[tokio::test]
    async fn test_backoff_completion_closes_breaker() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            backoff: Some(MINIMUM_BACKOFF),
            ..BreakerOptions::default()
        });

        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);
        assert_eq!(breaker.state(), State::Throttled);
        assert_ne!(breaker.core.throttle_created.load(Ordering::Acquire), 0);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.core.throttle_created.load(Ordering::Acquire), 0);
        assert_eq!(breaker.core.throttle_chance.load(Ordering::Acquire), 0);
        assert_ne!(breaker.core.closed_since.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_backoff_consults_curve_exactly_100_times() {
        let calls = Arc::new(TestCounter::new(0));
        let counter = Arc::clone(&calls);
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            backoff: Some(MINIMUM_BACKOFF),
            interpolation: Interpolation::Custom(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                0
            })),
            ..BreakerOptions::default()
        });

        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);
        sleep(Duration::from_millis(1500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_reopening_cancels_backoff_midway() {
        let calls = Arc::new(TestCounter::new(0));
        let counter = Arc::clone(&calls);
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(2),
            backoff: Some(MINIMUM_BACKOFF),
            interpolation: Interpolation::Custom(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                0
            })),
            ..BreakerOptions::default()
        });

        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);
        sleep(Duration::from_millis(500)).await;
        breaker.force_state(State::Open);
        sleep(Duration::from_millis(700)).await;

        let observed = calls.load(Ordering::SeqCst);
        assert!(observed < 100, "the backoff should have been cancelled midway, ran {observed}");
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.core.throttle_chance.load(Ordering::Acquire), 0);
        assert_eq!(breaker.core.throttle_created.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_transition_closed_to_open_timestamps() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);

        let core = &breaker.core;
        assert_eq!(core.closed_since.load(Ordering::Acquire), 0);
        assert_eq!(core.throttle_created.load(Ordering::Acquire), 0);
        assert_ne!(core.lock_created.load(Ordering::Acquire), 0);
        assert!(core.locked());
    }

    #[tokio::test]
    async fn test_transition_open_to_throttled_clears_lock() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);

        let core = &breaker.core;
        assert_eq!(core.closed_since.load(Ordering::Acquire), 0);
        assert_ne!(core.throttle_created.load(Ordering::Acquire), 0);
        assert_eq!(core.lock_created.load(Ordering::Acquire), 0);
        assert!(!core.locked());
    }

    #[tokio::test]
    async fn test_forbidden_transitions_are_refused() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            ..BreakerOptions::default()
        });

        // Closed may not throttle directly.
        breaker.force_state(State::Throttled);
        assert_eq!(breaker.state(), State::Closed);
        assert_ne!(breaker.core.closed_since.load(Ordering::Acquire), 0);

        // Open may not close directly.
        breaker.force_state(State::Open);
        breaker.force_state(State::Closed);
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_self_transition_is_noop() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        let before = breaker.core.closed_since.load(Ordering::Acquire);
        breaker.force_state(State::Closed);
        assert_eq!(breaker.core.closed_since.load(Ordering::Acquire), before);
    }

    #[tokio::test]
    async fn test_state_change_stream_records_transitions() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(1),
            backoff: Some(MINIMUM_BACKOFF),
            ..BreakerOptions::default()
        });
        let mut events = breaker.state_change().expect("first take must succeed");
        assert!(breaker.state_change().is_none());

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let collector = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                sink.lock().unwrap().push(event.to_string());
            }
        });

        breaker.force_state(State::Open);
        sleep(Duration::from_millis(1500)).await;
        breaker.force_state(State::Open);
        sleep(Duration::from_millis(2500)).await;
        collector.abort();

        let seen = states.lock().unwrap().clone();
        assert_eq!(seen, ["closed", "open", "throttled", "open", "throttled", "closed"]);
    }

    #[tokio::test]
    async fn test_error_burst_opens_then_throttles() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            threshold: Some(0),
            lockout: Duration::from_secs(1),
            backoff: Some(MINIMUM_BACKOFF),
            opening_resets_errors: true,
            ..BreakerOptions::default()
        });

        breaker.core.tracker.incr();
        breaker.core.tracker.incr();
        sleep(DEFAULT_BAUD_RATE + Duration::from_millis(50)).await;

        assert_eq!(breaker.state(), State::Open);
        assert!(breaker.snapshot().opened.is_some());
        assert_eq!(breaker.size(), 0, "opening must reset the tracker");

        sleep(Duration::from_millis(1400)).await;
        assert_eq!(breaker.state(), State::Throttled);
    }

    #[tokio::test]
    async fn test_throttled_breaker_reopens_on_errors() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            threshold: Some(0),
            lockout: Duration::from_secs(5),
            backoff: Some(MINIMUM_BACKOFF),
            ..BreakerOptions::default()
        });

        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);

        breaker.core.tracker.incr();
        breaker.core.tracker.incr();
        sleep(DEFAULT_BAUD_RATE + Duration::from_millis(50)).await;

        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_apply_throttle_certain_rejection() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        breaker.core.throttle_chance.store(100, Ordering::Release);
        for _ in 0..50 {
            assert!(breaker.core.apply_throttle().is_err());
        }
    }

    #[tokio::test]
    async fn test_apply_throttle_certain_pass() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        breaker.core.throttle_chance.store(0, Ordering::Release);
        for _ in 0..50 {
            assert!(breaker.core.apply_throttle().is_ok());
        }
    }

    #[tokio::test]
    async fn test_throttle_rejection_rate_tracks_chance() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        breaker.core.throttle_chance.store(50, Ordering::Release);

        let trials = 2000usize;
        let rejected =
            (0..trials).filter(|_| breaker.core.apply_throttle().is_err()).count();

        // Expect roughly half; the band is far wider than the binomial
        // spread so the test stays deterministic in practice.
        assert!(
            (700..=1300).contains(&rejected),
            "rejected {rejected} of {trials} at 50% chance"
        );
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let breaker: Breaker<&'static str> = Breaker::new(BreakerOptions::default());
        let value = breaker
            .run(&CancellationToken::new(), |_ctx| async { Ok("hello") })
            .await
            .unwrap();
        assert_eq!(value, "hello");
        assert_eq!(breaker.size(), 0);
    }

    #[tokio::test]
    async fn test_run_failure_is_recorded() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        let result = breaker
            .run(&CancellationToken::new(), |_ctx| async {
                Err(anyhow::anyhow!("something happened"))
            })
            .await;

        match result {
            Err(BreakerError::Execution(err)) => assert_eq!(err.to_string(), "something happened"),
            other => panic!("expected Execution error, got {other:?}"),
        }
        sleep(settle()).await;
        assert_eq!(breaker.size(), 1);
    }

    #[tokio::test]
    async fn test_run_times_out_and_cancels_child() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            timeout: Some(Duration::from_millis(10)),
            ..BreakerOptions::default()
        });

        let observed = Arc::new(TestCounter::new(0));
        let sink = Arc::clone(&observed);
        let result = breaker
            .run(&CancellationToken::new(), move |ctx| async move {
                sleep(Duration::from_millis(40)).await;
                sink.store(if ctx.is_cancelled() { 1 } else { 2 }, Ordering::SeqCst);
                Ok(true)
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout)));
        sleep(Duration::from_millis(80)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 1, "child token should be cancelled");
        assert_eq!(breaker.size(), 1);
    }

    #[tokio::test]
    async fn test_run_timeout_with_ignore_context() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            timeout: Some(Duration::from_millis(10)),
            ignore_context: true,
            ..BreakerOptions::default()
        });

        let observed = Arc::new(TestCounter::new(0));
        let sink = Arc::clone(&observed);
        let result = breaker
            .run(&CancellationToken::new(), move |ctx| async move {
                sleep(Duration::from_millis(40)).await;
                sink.store(if ctx.is_cancelled() { 1 } else { 2 }, Ordering::SeqCst);
                Ok(true)
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout)));
        sleep(Duration::from_millis(80)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 2, "child token should stay uncancelled");
        assert_eq!(breaker.size(), 1);
    }

    #[tokio::test]
    async fn test_run_rejected_while_open() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(2),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);

        let result = breaker.run(&CancellationToken::new(), |_ctx| async { Ok(true) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));

        // Rejections are not failures of the dependency.
        sleep(settle()).await;
        assert_eq!(breaker.size(), 0);
    }

    #[tokio::test]
    async fn test_run_rejected_while_throttled() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(2),
            interpolation: Interpolation::Custom(Arc::new(|_| 100)),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);

        let result = breaker.run(&CancellationToken::new(), |_ctx| async { Ok(true) }).await;
        assert!(matches!(result, Err(BreakerError::Throttled)));
        sleep(settle()).await;
        assert_eq!(breaker.size(), 0);
    }

    #[tokio::test]
    async fn test_run_rejects_cancelled_context() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions::default());
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = breaker.run(&ctx, |_ctx| async { Ok(true) }).await;
        assert!(matches!(result, Err(BreakerError::Canceled)));
    }

    #[tokio::test]
    async fn test_run_after_close_fails() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions::default());
        breaker.close();
        breaker.close(); // idempotent

        let result = breaker.run(&CancellationToken::new(), |_ctx| async { Ok(true) }).await;
        assert!(matches!(result, Err(BreakerError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_pre_processor_blocks_run() {
        let ran = Arc::new(TestCounter::new(0));
        let sink = Arc::clone(&ran);
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            pre_processors: vec![Arc::new(|_ctx, _runner| {
                Err(anyhow::anyhow!("you shall not pass"))
            })],
            ..BreakerOptions::default()
        });

        let result = breaker
            .run(&CancellationToken::new(), move |_ctx| async move {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            })
            .await;

        match result {
            Err(BreakerError::Execution(err)) => {
                assert_eq!(err.to_string(), "you shall not pass");
            }
            other => panic!("expected the pre-processor error, got {other:?}"),
        }
        sleep(settle()).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "the operation must not run");
        assert_eq!(breaker.size(), 1, "a blocked run still counts as a failure");
    }

    #[tokio::test]
    async fn test_pre_processor_replaces_runner() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            pre_processors: vec![Arc::new(|ctx, _runner| {
                let replacement: Runner<bool> = Box::new(|_| Box::pin(async { Ok(true) }));
                Ok((ctx, replacement))
            })],
            ..BreakerOptions::default()
        });

        let value = breaker
            .run(&CancellationToken::new(), |_ctx| async {
                Err(anyhow::anyhow!("i should be overridden"))
            })
            .await
            .unwrap();
        assert!(value);
        sleep(settle()).await;
        assert_eq!(breaker.size(), 0);
    }

    #[tokio::test]
    async fn test_post_processor_masks_failure() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            post_processors: vec![Arc::new(|_ctx, outcome| match outcome {
                Err(_) => Ok(true),
                ok => ok,
            })],
            ..BreakerOptions::default()
        });

        let value = breaker
            .run(&CancellationToken::new(), |_ctx| async {
                Err(anyhow::anyhow!("i should be overridden"))
            })
            .await
            .unwrap();
        assert!(value);
        sleep(settle()).await;
        assert_eq!(breaker.size(), 0, "a masked failure is not recorded");
    }

    #[tokio::test]
    async fn test_post_processor_injects_failure() {
        let breaker: Breaker<bool> = Breaker::new(BreakerOptions {
            post_processors: vec![Arc::new(|_ctx, _outcome| {
                Err(BreakerError::Execution(anyhow::anyhow!("you shall not pass")))
            })],
            ..BreakerOptions::default()
        });

        let result = breaker.run(&CancellationToken::new(), |_ctx| async { Ok(true) }).await;
        assert!(result.is_err());
        sleep(settle()).await;
        assert_eq!(breaker.size(), 1, "an injected failure is recorded");
    }

    #[tokio::test]
    async fn test_snapshot_closed() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            name: Some("foo".to_owned()),
            ..BreakerOptions::default()
        });
        let snap = breaker.snapshot();

        assert_eq!(snap.name, "foo");
        assert_eq!(snap.state, State::Closed);
        assert_eq!(snap.to_string(), "closed");
        assert!(snap.closed_since.is_some());
        assert!(snap.opened.is_none());
        assert!(snap.lockout_ends.is_none());
        assert!(snap.throttled.is_none());
        assert!(snap.backoff_ends.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_throttled() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            name: Some("foo".to_owned()),
            lockout: Duration::from_secs(2),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);
        breaker.force_state(State::Throttled);
        let snap = breaker.snapshot();

        assert_eq!(snap.state, State::Throttled);
        assert!(snap.closed_since.is_none());
        assert!(snap.opened.is_none());
        assert!(snap.lockout_ends.is_none());
        let since = snap.throttled.expect("throttled timestamp");
        let ends = snap.backoff_ends.expect("backoff end");
        assert_eq!(ends - since, chrono::TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn test_snapshot_open() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            name: Some("foo".to_owned()),
            lockout: Duration::from_secs(2),
            ..BreakerOptions::default()
        });
        breaker.force_state(State::Open);
        let snap = breaker.snapshot();

        assert_eq!(snap.state, State::Open);
        assert!(snap.closed_since.is_none());
        assert!(snap.throttled.is_none());
        assert!(snap.backoff_ends.is_none());
        let since = snap.opened.expect("opened timestamp");
        let ends = snap.lockout_ends.expect("lockout end");
        assert_eq!(ends - since, chrono::TimeDelta::seconds(2));
    }

    #[tokio::test]
    async fn test_snapshot_open_without_lockout() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        breaker.force_state(State::Open);
        let snap = breaker.snapshot();

        assert_eq!(snap.state, State::Open);
        assert!(snap.opened.is_some());
        assert!(snap.lockout_ends.is_none());
    }

    #[tokio::test]
    async fn test_size_reflects_tracked_errors() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions::default());
        assert_eq!(breaker.size(), 0);

        breaker.core.tracker.incr();
        breaker.core.tracker.incr();
        breaker.core.tracker.incr();
        sleep(settle()).await;
        assert_eq!(breaker.size(), 3);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let breaker: Breaker<()> = Breaker::new(BreakerOptions {
            lockout: Duration::from_secs(2),
            ..BreakerOptions::default()
        });
        let other = breaker.clone();
        assert!(breaker.shares_core(&other));

        breaker.force_state(State::Open);
        assert_eq!(other.state(), State::Open);
    }
}
