//! Monotonic time abstraction used by every wake-cycle component.
//!
//! Firmware wraps the Embassy instant, the emulator uses a virtual clock, and
//! tests use plain microsecond counters. Components only need ordering,
//! addition of a [`Duration`], and a saturating difference.

use core::{ops::Add, time::Duration};

/// Monotonic instant accepted by the scheduler, components, and telemetry.
pub trait CycleInstant: Copy + Ord + Add<Duration, Output = Self> {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Microsecond counter used by host tooling and tests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MicrosInstant(u64);

impl MicrosInstant {
    /// Instant at the start of the virtual timeline.
    pub const ZERO: Self = Self(0);

    /// Creates an instant from a raw microsecond count.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Creates an instant from a millisecond count.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    /// Returns the raw microsecond count.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns the whole milliseconds elapsed since [`MicrosInstant::ZERO`].
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000
    }
}

impl Add<Duration> for MicrosInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl CycleInstant for MicrosInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_saturates_at_the_end_of_the_timeline() {
        let near_end = MicrosInstant::from_micros(u64::MAX - 5);
        assert_eq!(near_end + Duration::from_secs(1), MicrosInstant::from_micros(u64::MAX));
    }

    #[test]
    fn duration_since_never_goes_negative() {
        let earlier = MicrosInstant::from_millis(10);
        let later = MicrosInstant::from_millis(25);

        assert_eq!(later.saturating_duration_since(earlier), Duration::from_millis(15));
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
    }
}
