//! Status indicator states and blink presets.

use core::{fmt, time::Duration};

/// What the status LED should show.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StatusState {
    #[default]
    Off,
    On,
    SlowBlink,
    FastBlink,
}

/// On/off durations of one blink period.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlinkPattern {
    pub on: Duration,
    pub off: Duration,
}

impl BlinkPattern {
    pub const SLOW: Self = Self {
        on: Duration::from_millis(500),
        off: Duration::from_millis(1_000),
    };
    pub const FAST: Self = Self {
        on: Duration::from_millis(100),
        off: Duration::from_millis(200),
    };
}

impl StatusState {
    /// Blink timing, or `None` for the static states.
    #[must_use]
    pub const fn pattern(self) -> Option<BlinkPattern> {
        match self {
            StatusState::SlowBlink => Some(BlinkPattern::SLOW),
            StatusState::FastBlink => Some(BlinkPattern::FAST),
            StatusState::Off | StatusState::On => None,
        }
    }

    /// Level held by a static state.
    #[must_use]
    pub const fn steady_level(self) -> Option<bool> {
        match self {
            StatusState::Off => Some(false),
            StatusState::On => Some(true),
            StatusState::SlowBlink | StatusState::FastBlink => None,
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            StatusState::Off => 0,
            StatusState::On => 1,
            StatusState::SlowBlink => 2,
            StatusState::FastBlink => 3,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Self {
        match code {
            1 => StatusState::On,
            2 => StatusState::SlowBlink,
            3 => StatusState::FastBlink,
            _ => StatusState::Off,
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatusState::Off => "off",
            StatusState::On => "on",
            StatusState::SlowBlink => "slow-blink",
            StatusState::FastBlink => "fast-blink",
        })
    }
}

/// Handle to the status indicator, owned by whoever drives the cycle.
pub trait StatusIndicator {
    fn set_status(&mut self, state: StatusState);
}

impl<T> StatusIndicator for &mut T
where
    T: StatusIndicator,
{
    fn set_status(&mut self, state: StatusState) {
        (**self).set_status(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_survive_atomic_storage() {
        for state in [
            StatusState::Off,
            StatusState::On,
            StatusState::SlowBlink,
            StatusState::FastBlink,
        ] {
            assert_eq!(StatusState::from_raw(state.to_raw()), state);
        }
    }

    #[test]
    fn presets_match_the_indicator_timings() {
        assert_eq!(
            StatusState::FastBlink.pattern(),
            Some(BlinkPattern {
                on: Duration::from_millis(100),
                off: Duration::from_millis(200),
            })
        );
        assert_eq!(StatusState::On.pattern(), None);
        assert_eq!(StatusState::On.steady_level(), Some(true));
    }
}
