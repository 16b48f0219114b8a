//! Backoff interpolation curves.
//!
//! While a breaker is throttled, its block probability is re-evaluated 100
//! times over the backoff period (once every `backoff / 100`). The
//! [`Interpolation`] curve maps the 1-based tick index to a probability in
//! `[0, 100]` that a given call is rejected at that point in the recovery.
//!
//! All built-in curves start at (or near) 100 and decay to 0, with different
//! shapes:
//!
//! - [`Linear`](Interpolation::Linear) — straight line, `100 - tick`.
//! - [`Logarithmic`](Interpolation::Logarithmic) — long plateau of blocking,
//!   then a steep drop at the end.
//! - [`Exponential`](Interpolation::Exponential) — rapid drop, then a long
//!   tail of mostly-passing traffic.
//! - [`EaseInOut`](Interpolation::EaseInOut) — S-curve, gentle at both ends.
//!
//! A user function can be supplied with [`Custom`](Interpolation::Custom).
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use circuit::Interpolation;
//!
//! assert_eq!(Interpolation::Linear.chance(1), 99);
//! assert_eq!(Interpolation::Linear.chance(100), 0);
//!
//! // A curve that blocks nothing after the first quarter of the backoff.
//! let cliff = Interpolation::Custom(Arc::new(|tick| if tick <= 25 { 100 } else { 0 }));
//! assert_eq!(cliff.chance(25), 100);
//! assert_eq!(cliff.chance(26), 0);
//! ```

use std::sync::Arc;

// The three fixed tables were generated with a bezier plotting tool and are
// consulted as curve[tick - 1].

#[rustfmt::skip]
const LOG_CURVE: [u32; 100] = [
    100, 99, 99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 98, 98, 98, 98, 98, 97, 97, 97,
    97, 96, 96, 96, 95, 95, 95, 94, 94, 93,
    93, 92, 92, 91, 91, 90, 89, 89, 88, 87,
    87, 86, 85, 84, 83, 82, 81, 80, 79, 78,
    77, 76, 75, 74, 72, 71, 70, 69, 67, 66,
    64, 63, 61, 59, 58, 56, 54, 52, 51, 49,
    47, 45, 43, 41, 38, 36, 34, 32, 29, 27,
    24, 22, 19, 17, 14, 11, 8, 5, 2, 0,
];

#[rustfmt::skip]
const EXP_CURVE: [u32; 100] = [
    100, 97, 94, 91, 88, 85, 82, 80, 77, 75,
    72, 70, 67, 65, 63, 61, 58, 56, 54, 52,
    50, 48, 47, 45, 43, 41, 40, 38, 36, 35,
    33, 32, 30, 29, 28, 27, 25, 24, 23, 22,
    21, 20, 19, 18, 17, 16, 15, 14, 13, 12,
    12, 11, 10, 10, 9, 8, 8, 7, 7, 6,
    6, 5, 5, 4, 4, 4, 3, 3, 3, 2,
    2, 2, 2, 1, 1, 1, 1, 1, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[rustfmt::skip]
const EASE_IN_OUT_CURVE: [u32; 100] = [
    100, 99, 99, 99, 99, 99, 98, 98, 98, 97,
    97, 96, 95, 95, 94, 93, 93, 92, 91, 90,
    89, 88, 87, 86, 85, 84, 82, 81, 80, 79,
    78, 76, 75, 74, 72, 71, 69, 68, 67, 65,
    64, 62, 61, 59, 58, 56, 55, 53, 52, 50,
    49, 47, 46, 44, 43, 41, 40, 38, 37, 35,
    34, 32, 31, 30, 28, 27, 25, 24, 23, 21,
    20, 19, 18, 17, 15, 14, 13, 12, 11, 10,
    9, 8, 7, 6, 6, 5, 4, 4, 3, 2,
    2, 1, 1, 1, 0, 0, 0, 0, 0, 0,
];

/// The probability curve consulted during a throttled backoff.
///
/// See the [module documentation](self) for the shapes of the built-ins.
#[derive(Clone, Default)]
pub enum Interpolation {
    /// Block probability directly proportional to the remaining backoff:
    /// `chance(tick) = 100 - tick`.
    #[default]
    Linear,
    /// Blocks most early requests, with the pass rate accelerating past the
    /// curve's midpoint.
    Logarithmic,
    /// Drops the block rate drastically at first, then slows.
    Exponential,
    /// Blocks most requests initially, passes at a steep rate through the
    /// middle, then levels off.
    EaseInOut,
    /// A user-supplied curve. The function receives the 1-based tick and
    /// must return a probability in `[0, 100]`; larger return values are
    /// treated as certain rejection.
    Custom(Arc<dyn Fn(u32) -> u32 + Send + Sync>),
}

impl Interpolation {
    /// The block probability for the given backoff tick.
    ///
    /// `tick` is 1-based and clamped to `[1, 100]` before lookup, so a
    /// malformed tick can never index out of bounds.
    #[must_use]
    pub fn chance(&self, tick: u32) -> u32 {
        let tick = tick.clamp(1, 100);
        match self {
            Self::Linear => 100 - tick,
            Self::Logarithmic => LOG_CURVE[tick as usize - 1],
            Self::Exponential => EXP_CURVE[tick as usize - 1],
            Self::EaseInOut => EASE_IN_OUT_CURVE[tick as usize - 1],
            Self::Custom(f) => f(tick),
        }
    }
}

impl std::fmt::Debug for Interpolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Linear => "Linear",
            Self::Logarithmic => "Logarithmic",
            Self::Exponential => "Exponential",
            Self::EaseInOut => "EaseInOut",
            Self::Custom(_) => "Custom(..)",
        };
        f.write_str(name)
    }
}
