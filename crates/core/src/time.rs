use chrono::{DateTime, Duration, Utc};

/// A simple clock abstraction for deterministic time in services and tests.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    Default,
    Fixed(DateTime<Utc>),
}

impl Clock {
    /// Returns a clock that uses the current system time.
    #[must_use]
    pub fn default_clock() -> Self {
        Self::Default
    }

    /// Returns a clock fixed at the given timestamp.
    #[must_use]
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::Fixed(at)
    }

    /// Returns the current time according to the clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::Default => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }

    /// Returns a copy of this clock moved forward by `secs` seconds.
    ///
    /// Request handlers are stateless, so tests simulate elapsed time by
    /// building a second service around the advanced clock. A real-time clock
    /// is returned unchanged.
    #[must_use]
    pub fn advanced_by_secs(self, secs: i64) -> Self {
        match self {
            Clock::Default => Clock::Default,
            Clock::Fixed(t) => Clock::Fixed(t + Duration::seconds(secs)),
        }
    }

    /// Whole seconds elapsed between `since` and now, never negative.
    #[must_use]
    pub fn seconds_since(&self, since: DateTime<Utc>) -> u64 {
        elapsed_secs(since, self.now())
    }
}

/// Whole seconds between two instants, clamped to zero when `to` precedes `from`.
#[must_use]
pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

/// Deterministic timestamp for tests and examples (2023-11-14T22:13:20Z).
pub const FIXED_TEST_TIMESTAMP: i64 = 1_700_000_000;

/// Returns a deterministic `DateTime<Utc>` for tests and doc examples.
///
/// # Panics
///
/// Panics if the fixed timestamp cannot be represented.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(FIXED_TEST_TIMESTAMP, 0)
        .expect("fixed timestamp should be valid")
}

/// Returns a `Clock` fixed at the deterministic test timestamp.
#[must_use]
pub fn fixed_clock() -> Clock {
    Clock::fixed(fixed_now())
}
