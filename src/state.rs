//! Breaker state and snapshot types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The three operating states of a circuit breaker.
///
/// - **Closed**: normal pass-through.
/// - **Throttled**: probabilistic pass-through while recovering from an open
///   state; the block probability decays along the configured
///   [`Interpolation`](crate::Interpolation) curve.
/// - **Open**: every call is rejected and no new errors are recorded.
///
/// States serialize to (and display as) their lowercase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum State {
    /// Normal operation, calls flow through.
    Closed = 0,
    /// Recovery in progress, a decaying fraction of calls is rejected.
    Throttled = 1,
    /// All calls rejected.
    Open = 2,
}

impl State {
    /// Decodes the breaker's raw state word. `None` for values outside the
    /// known states.
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Closed),
            1 => Some(Self::Throttled),
            2 => Some(Self::Open),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Throttled => "throttled",
            Self::Open => "open",
        };
        f.write_str(name)
    }
}

/// A timestamped snapshot of a breaker's state.
///
/// Emitted on every state change through the breaker's (and box's)
/// state-change channel, and returned by
/// [`Breaker::snapshot`](crate::Breaker::snapshot). Exactly the timestamp
/// pair relevant to `state` is populated:
///
/// | `state` | populated |
/// |---|---|
/// | `closed` | `closed_since` |
/// | `throttled` | `throttled`, `backoff_ends` |
/// | `open` | `opened`, and `lockout_ends` when a lockout is configured |
///
/// Serialized timestamps use RFC 3339; absent fields are omitted:
///
/// ```json
/// {"name":"upstream","state":"throttled",
///  "throttled":"2025-06-01T12:00:00Z","backoff_ends":"2025-06-01T12:01:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerState {
    /// The breaker's name.
    pub name: String,
    /// The state at snapshot time.
    pub state: State,
    /// When the breaker last entered `Closed` (or was created).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_since: Option<DateTime<Utc>>,
    /// When the breaker last opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened: Option<DateTime<Utc>>,
    /// When the current lockout expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout_ends: Option<DateTime<Utc>>,
    /// When the breaker entered `Throttled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<DateTime<Utc>>,
    /// When the current backoff completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ends: Option<DateTime<Utc>>,
}

impl BreakerState {
    pub(crate) fn bare(name: &str, state: State) -> Self {
        Self {
            name: name.to_owned(),
            state,
            closed_since: None,
            opened: None,
            lockout_ends: None,
            throttled: None,
            backoff_ends: None,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.fmt(f)
    }
}

/// Current unix time in nanoseconds.
///
/// Saturates rather than failing on clocks outside the representable range
/// (years 1677..=2262).
pub(crate) fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts a unix-nano stamp back to a UTC timestamp. `None` for the zero
/// ("unset") stamp.
pub(crate) fn time_from_nanos(ns: i64) -> Option<DateTime<Utc>> {
    (ns != 0).then(|| DateTime::from_timestamp_nanos(ns))
}

/// The instant a period starting at `start` completes. `None` if the sum
/// overflows the representable time range.
pub(crate) fn end_of(start: DateTime<Utc>, period: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::TimeDelta::from_std(period)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
}
