//! Named registry of breakers with a shared state-change stream.
//!
//! A [`BreakerBox`] keeps breakers addressable by name and funnels their
//! state-change events into one bounded observer channel, so a service can
//! watch every dependency's breaker from a single receiver.
//!
//! Each breaker created through the box gets a forwarder task that copies
//! its state-change stream into the box's funnel; the funnel offers each
//! event to the bounded output channel. Both offers are non-blocking — a
//! late or slow observer loses events, never stalls a breaker. Per-breaker
//! event order is preserved; ordering across breakers is not.
//!
//! Breakers registered with [`add_byo`](BreakerBox::add_byo) keep their own
//! state-change stream ("bring your own" observation).
//!
//! # Examples
//!
//! ```rust
//! use circuit::{BreakerBox, BreakerOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let boxed: BreakerBox<String> = BreakerBox::new();
//! let mut events = boxed.state_change().expect("first take");
//!
//! let orders = boxed.load_or_create(BreakerOptions {
//!     name: Some("orders-db".to_owned()),
//!     ..BreakerOptions::default()
//! })?;
//!
//! // Same name, same breaker; the options of a later call are ignored.
//! let again = boxed.load_or_create(BreakerOptions {
//!     name: Some("orders-db".to_owned()),
//!     threshold: Some(99),
//!     ..BreakerOptions::default()
//! })?;
//! assert_eq!(orders.name(), again.name());
//!
//! while let Some(change) = events.recv().await {
//!     println!("{} is now {}", change.name, change.state);
//! }
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    breaker::{Breaker, BreakerOptions},
    error::{BreakerError, Result},
    state::BreakerState,
};

/// Capacity of the box's observer channel and of the funnel feeding it.
const STATE_CHANGE_CAPACITY: usize = 5;

struct BoxInner<T> {
    breakers: RwLock<HashMap<String, Breaker<T>>>,
    funnel: mpsc::Sender<BreakerState>,
    output_rx: Mutex<Option<mpsc::Receiver<BreakerState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A concurrent registry of named breakers that multiplexes their
/// state-change events onto one bounded channel.
///
/// Cloning yields another handle to the same registry.
pub struct BreakerBox<T> {
    inner: Arc<BoxInner<T>>,
}

impl<T> Clone for BreakerBox<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for BreakerBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.breakers.read().map(|map| map.len()).unwrap_or(0);
        f.debug_struct("BreakerBox").field("breakers", &count).finish()
    }
}

impl<T: Send + 'static> BreakerBox<T> {
    /// Creates an empty box and starts its funnel task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (funnel, mut funnel_rx) = mpsc::channel::<BreakerState>(STATE_CHANGE_CAPACITY);
        let (output, output_rx) = mpsc::channel::<BreakerState>(STATE_CHANGE_CAPACITY);

        let funnel_task = tokio::spawn(async move {
            while let Some(event) = funnel_rx.recv().await {
                // Nobody listening, or the observer lags: drop, don't block.
                if output.try_send(event).is_err() {
                    debug!("dropped state-change event, observer not keeping up");
                }
            }
        });

        Self {
            inner: Arc::new(BoxInner {
                breakers: RwLock::new(HashMap::new()),
                funnel,
                output_rx: Mutex::new(Some(output_rx)),
                tasks: Mutex::new(vec![funnel_task]),
            }),
        }
    }

    /// Looks up a breaker by name.
    #[must_use]
    pub fn load(&self, name: &str) -> Option<Breaker<T>> {
        self.inner.breakers.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Creates a breaker from `opts`, registers it under its name and
    /// forwards its state changes into the box's stream.
    ///
    /// A breaker created under an already-registered name replaces the
    /// previous registration.
    ///
    /// # Errors
    ///
    /// [`BreakerError::UnnamedBreaker`] when `opts.name` is absent or empty.
    pub fn create(&self, opts: BreakerOptions<T>) -> Result<Breaker<T>> {
        if opts.name.as_deref().is_none_or(str::is_empty) {
            return Err(BreakerError::UnnamedBreaker);
        }

        let breaker = Breaker::new(opts);
        self.attach(&breaker);
        self.inner
            .breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(breaker.name().to_owned(), breaker.clone());
        Ok(breaker)
    }

    /// Returns the breaker registered under `opts.name`, creating it when
    /// absent. The options are ignored for an existing breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::UnnamedBreaker`] when `opts.name` is absent or empty.
    pub fn load_or_create(&self, opts: BreakerOptions<T>) -> Result<Breaker<T>> {
        match opts.name.as_deref() {
            Some(name) if !name.is_empty() => {
                if let Some(existing) = self.load(name) {
                    return Ok(existing);
                }
                self.create(opts)
            }
            _ => Err(BreakerError::UnnamedBreaker),
        }
    }

    /// Registers an externally created breaker without attaching the box's
    /// fan-in: the breaker keeps its own state-change stream.
    pub fn add_byo(&self, breaker: Breaker<T>) {
        self.inner
            .breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(breaker.name().to_owned(), breaker);
    }

    /// The names of all registered breakers, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Takes the box's state-change receiver.
    ///
    /// There is a single receiver: the first call takes it, later calls
    /// return `None`. The channel is bounded; events that arrive while the
    /// observer lags are dropped.
    #[must_use]
    pub fn state_change(&self) -> Option<mpsc::Receiver<BreakerState>> {
        self.inner.output_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Stops the box's forwarder and funnel tasks. Registered breakers are
    /// untouched; shut them down individually with
    /// [`Breaker::close`](crate::Breaker::close). Idempotent.
    pub fn close(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("breaker box shut down");
    }

    fn attach(&self, breaker: &Breaker<T>) {
        let Some(mut events) = breaker.state_change() else {
            // The receiver was already taken by an earlier observer.
            debug!(breaker = %breaker.name(), "state-change stream unavailable, not forwarding");
            return;
        };
        let funnel = self.inner.funnel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // Non-blocking offer; drop when the funnel is congested.
                let _ = funnel.try_send(event);
            }
        });
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(forwarder);
    }
}

impl<T: Send + 'static> Default for BreakerBox<T> {
    fn default() -> Self {
        Self::new()
    }
}
