#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Status LED plumbing between the wake cycle and the blink task.
//!
//! The cycle owns a [`StatusHandle`]; every `set_status` stores the new state
//! in an atomic and wakes the blink task, which renders it on the LED.

use core::time::Duration;

use embassy_sync::signal::Signal;
use node_core::status::{StatusIndicator, StatusState};
use portable_atomic::{AtomicU8, Ordering};

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;

#[cfg(target_os = "none")]
type StatusMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type StatusMutex = NoopRawMutex;

/// State shared with the blink task.
pub struct StatusLed {
    state: AtomicU8,
    changed: Signal<StatusMutex, ()>,
}

impl StatusLed {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(StatusState::Off.to_raw()),
            changed: Signal::new(),
        }
    }

    pub fn current(&self) -> StatusState {
        StatusState::from_raw(self.state.load(Ordering::Relaxed))
    }

    /// Completes on the next state change.
    pub async fn changed(&self) {
        self.changed.wait().await;
    }

    fn store(&self, state: StatusState) {
        self.state.store(state.to_raw(), Ordering::Relaxed);
        self.changed.signal(());
    }
}

/// Owned handle passed into the wake cycle.
pub struct StatusHandle(&'static StatusLed);

impl StatusHandle {
    pub const fn new(led: &'static StatusLed) -> Self {
        Self(led)
    }
}

impl StatusIndicator for StatusHandle {
    fn set_status(&mut self, state: StatusState) {
        self.0.store(state);
    }
}

/// Next LED level and how long to hold it; `None` for steady states.
pub fn blink_step(state: StatusState, lit: bool) -> Option<(bool, Duration)> {
    let pattern = state.pattern()?;
    if lit {
        Some((false, pattern.off))
    } else {
        Some((true, pattern.on))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_updates_shared_state() {
        let led: &'static StatusLed = Box::leak(Box::new(StatusLed::new()));
        let mut handle = StatusHandle::new(led);
        assert_eq!(led.current(), StatusState::Off);
        assert!(!led.changed.signaled());

        handle.set_status(StatusState::SlowBlink);
        assert_eq!(led.current(), StatusState::SlowBlink);
        assert!(led.changed.signaled());
    }

    #[test]
    fn blink_alternates_with_preset_timing() {
        assert_eq!(
            blink_step(StatusState::FastBlink, false),
            Some((true, Duration::from_millis(100)))
        );
        assert_eq!(
            blink_step(StatusState::FastBlink, true),
            Some((false, Duration::from_millis(200)))
        );
        assert_eq!(
            blink_step(StatusState::SlowBlink, false),
            Some((true, Duration::from_millis(500)))
        );
        assert_eq!(blink_step(StatusState::On, false), None);
    }
}
