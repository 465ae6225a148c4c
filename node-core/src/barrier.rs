//! Rendezvous between the acquisition and transport completions.
//!
//! The barrier holds a small set of named bits. A waiter registers a target
//! mask and a bounded wait; it is released as soon as every target bit is set
//! or the deadline passes, whichever comes first, and observes the bits that
//! were set at that moment.

use core::{fmt, time::Duration};

use crate::scheduler::{Dispatch, SchedulerError, TimerHandle, TimerKey};
use crate::telemetry::{BarrierTelemetry, TelemetryEventKind, TelemetryPayload};
use crate::time::CycleInstant;

/// Set of barrier condition bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct BarrierBits(u8);

impl BarrierBits {
    pub const EMPTY: Self = Self(0);
    pub const ACQUISITION_DONE: Self = Self(1 << 0);
    pub const TRANSPORT_READY: Self = Self(1 << 1);
    pub const ALL: Self = Self(Self::ACQUISITION_DONE.0 | Self::TRANSPORT_READY.0);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BarrierBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        let mut separator = "{";
        for (bit, name) in [
            (Self::ACQUISITION_DONE, "acquisition_done"),
            (Self::TRANSPORT_READY, "transport_ready"),
        ] {
            if self.contains(bit) {
                write!(f, "{separator}{name}")?;
                separator = ",";
            }
        }
        f.write_str("}")
    }
}

/// Result of registering a wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierWait {
    /// The target mask was already satisfied.
    Released(BarrierBits),
    /// Release will arrive from [`CompletionBarrier::signal`] or the deadline.
    Pending,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierError {
    /// A wait is already registered.
    AlreadyWaiting,
    Scheduler(SchedulerError),
}

impl fmt::Display for BarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierError::AlreadyWaiting => f.write_str("barrier already has a waiter"),
            BarrierError::Scheduler(err) => write!(f, "deadline: {err}"),
        }
    }
}

impl From<SchedulerError> for BarrierError {
    fn from(err: SchedulerError) -> Self {
        BarrierError::Scheduler(err)
    }
}

#[derive(Copy, Clone, Debug)]
struct Waiter<I> {
    mask: BarrierBits,
    deadline: TimerHandle,
    since: I,
}

/// N-signal rendezvous with a bounded wait.
#[derive(Debug)]
pub struct CompletionBarrier<I> {
    bits: BarrierBits,
    waiter: Option<Waiter<I>>,
}

impl<I> CompletionBarrier<I>
where
    I: CycleInstant,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: BarrierBits::EMPTY,
            waiter: None,
        }
    }

    /// Bits currently set.
    #[must_use]
    pub const fn bits(&self) -> BarrierBits {
        self.bits
    }

    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiter.is_some()
    }

    /// Waits until every bit in `mask` is set or `timeout` elapses.
    pub fn wait(
        &mut self,
        mask: BarrierBits,
        timeout: Duration,
        cx: &mut Dispatch<'_, I>,
    ) -> Result<BarrierWait, BarrierError> {
        if self.waiter.is_some() {
            return Err(BarrierError::AlreadyWaiting);
        }
        if self.bits.contains(mask) {
            return Ok(BarrierWait::Released(self.release_satisfied(mask, None, cx)));
        }

        let deadline = cx.schedule_after(timeout, TimerKey::BarrierDeadline)?;
        self.waiter = Some(Waiter {
            mask,
            deadline,
            since: cx.now,
        });
        Ok(BarrierWait::Pending)
    }

    /// Sets `bit`. Returns the observed bits when this releases the waiter.
    pub fn signal(&mut self, bit: BarrierBits, cx: &mut Dispatch<'_, I>) -> Option<BarrierBits> {
        self.bits = self.bits.union(bit);
        let waiter = self.waiter?;
        if !self.bits.contains(waiter.mask) {
            return None;
        }

        self.waiter = None;
        cx.timers.cancel(waiter.deadline);
        Some(self.release_satisfied(waiter.mask, Some(waiter.since), cx))
    }

    /// Clears `bit` without waking anyone, e.g. when the link drops before release.
    pub fn retract(&mut self, bit: BarrierBits) {
        self.bits = self.bits.difference(bit);
    }

    /// Handles an expired [`TimerKey::BarrierDeadline`]. Bits are left as observed.
    pub fn on_deadline(
        &mut self,
        handle: TimerHandle,
        cx: &mut Dispatch<'_, I>,
    ) -> Option<BarrierBits> {
        let waiter = self.waiter.filter(|waiter| waiter.deadline == handle)?;
        self.waiter = None;

        let observed = self.bits;
        self.record(observed, true, Some(waiter.since), cx);
        Some(observed)
    }

    fn release_satisfied(
        &mut self,
        mask: BarrierBits,
        since: Option<I>,
        cx: &mut Dispatch<'_, I>,
    ) -> BarrierBits {
        let observed = self.bits;
        self.bits = self.bits.difference(mask);
        self.record(observed, false, since, cx);
        observed
    }

    fn record(
        &self,
        observed: BarrierBits,
        timed_out: bool,
        since: Option<I>,
        cx: &mut Dispatch<'_, I>,
    ) {
        let waited = since.map(|start| cx.now.saturating_duration_since(start));
        cx.telemetry.record(
            TelemetryEventKind::BarrierReleased,
            TelemetryPayload::Barrier(BarrierTelemetry::new(observed, timed_out, waited)),
            cx.now,
        );
    }
}

impl<I> Default for CompletionBarrier<I>
where
    I: CycleInstant,
{
    fn default() -> Self {
        Self::new()
    }
}
