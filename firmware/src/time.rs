#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Embassy-backed instant for the wake-cycle core.

use core::ops::Add;
use core::time::Duration;

use embassy_time::{Duration as EmbassyDuration, Instant};
use node_core::time::CycleInstant;

/// Monotonic instant from the Embassy time driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    /// Samples the time driver.
    #[cfg(target_os = "none")]
    #[must_use]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    #[must_use]
    pub const fn into_embassy(self) -> Instant {
        self.0
    }

    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.0.as_millis()
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(instant: Instant) -> Self {
        Self(instant)
    }
}

impl Add<Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        let sum = self
            .0
            .checked_add(EmbassyDuration::from_micros(micros))
            .unwrap_or(Instant::MAX);
        Self(sum)
    }
}

impl CycleInstant for FirmwareInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        let elapsed = self.0.saturating_duration_since(earlier.0);
        Duration::from_micros(elapsed.as_micros())
    }
}

/// Converts a core duration into an Embassy one, saturating on overflow.
#[must_use]
pub fn to_embassy(duration: Duration) -> EmbassyDuration {
    EmbassyDuration::from_micros(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}
