//! Timer queue backing the cooperative wake-cycle dispatcher.
//!
//! Components never sleep or spin. Instead they register a keyed deadline
//! here and keep the returned [`TimerHandle`] as their cancel token. The
//! dispatcher (firmware executor loop or emulator clock) sleeps until
//! [`TimerQueue::next_deadline`] and routes each expired entry back to the
//! component that owns its key.

use core::{fmt, time::Duration};

use heapless::Vec;

use crate::acquisition::{MAX_SOURCES, SourceId};
use crate::telemetry::TelemetryRecorder;
use crate::time::CycleInstant;

/// One retry slot per source plus the acquisition, barrier, and flush deadlines.
pub const TIMER_SLOTS: usize = MAX_SOURCES + 3;

/// Timer queue sized for one wake cycle.
pub type Timers<I> = TimerQueue<I, TIMER_SLOTS>;

/// Cancel token for a scheduled timer. Handles are never reused within a queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerHandle(u32);

impl TimerHandle {
    /// Returns the raw sequence number, mostly useful for logs.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Identifies which component a timer belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimerKey {
    /// Retry of a failed measurement attempt.
    SourceRetry(SourceId),
    /// One-shot acquisition deadline armed by the aggregator.
    AcquisitionDeadline,
    /// Bounded wait on the completion barrier.
    BarrierDeadline,
    /// Bounded wait for the delivery queue to drain.
    FlushDeadline,
}

/// Timer that reached its deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExpiredTimer {
    pub handle: TimerHandle,
    pub key: TimerKey,
}

/// Errors reported by the timer queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerError {
    /// Every timer slot is occupied.
    Full,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Full => f.write_str("timer queue full"),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct TimerEntry<I> {
    handle: TimerHandle,
    deadline: I,
    key: TimerKey,
}

/// Bounded deadline queue for a single wake cycle.
#[derive(Clone, Debug)]
pub struct TimerQueue<I, const N: usize = TIMER_SLOTS> {
    entries: Vec<TimerEntry<I>, N>,
    next_handle: u32,
}

impl<I, const N: usize> TimerQueue<I, N>
where
    I: CycleInstant,
{
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 0,
        }
    }

    /// Schedules `key` to expire at `deadline`.
    pub fn schedule_at(
        &mut self,
        deadline: I,
        key: TimerKey,
    ) -> Result<TimerHandle, SchedulerError> {
        let handle = TimerHandle(self.next_handle);
        self.entries
            .push(TimerEntry {
                handle,
                deadline,
                key,
            })
            .map_err(|_| SchedulerError::Full)?;
        self.next_handle = self.next_handle.wrapping_add(1);
        Ok(handle)
    }

    /// Schedules `key` to expire `delay` after `now`.
    pub fn schedule_after(
        &mut self,
        now: I,
        delay: Duration,
        key: TimerKey,
    ) -> Result<TimerHandle, SchedulerError> {
        self.schedule_at(now + delay, key)
    }

    /// Cancels a pending timer. Returns `false` when it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.position(handle) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns `true` while `handle` is still waiting to expire.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.position(handle).is_some()
    }

    /// Returns the deadline registered for `handle`, if still pending.
    pub fn deadline_of(&self, handle: TimerHandle) -> Option<I> {
        self.position(handle).map(|index| self.entries[index].deadline)
    }

    /// Earliest pending deadline; the dispatcher sleeps until this instant.
    pub fn next_deadline(&self) -> Option<I> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Removes and returns the earliest timer whose deadline is at or before `now`.
    ///
    /// Timers sharing a deadline expire in the order they were scheduled.
    pub fn pop_expired(&mut self, now: I) -> Option<ExpiredTimer> {
        let (index, _) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)?;

        let entry = self.entries.remove(index);
        Some(ExpiredTimer {
            handle: entry.handle,
            key: entry.key,
        })
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every pending timer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, handle: TimerHandle) -> Option<usize> {
        self.entries.iter().position(|entry| entry.handle == handle)
    }
}

impl<I, const N: usize> Default for TimerQueue<I, N>
where
    I: CycleInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of the dispatcher handed to a component while it reacts to
/// an event: the current instant, the cycle's timers, and its telemetry ring.
pub struct Dispatch<'a, I>
where
    I: CycleInstant,
{
    pub now: I,
    pub timers: &'a mut Timers<I>,
    pub telemetry: &'a mut TelemetryRecorder<I>,
}

impl<'a, I> Dispatch<'a, I>
where
    I: CycleInstant,
{
    pub fn new(now: I, timers: &'a mut Timers<I>, telemetry: &'a mut TelemetryRecorder<I>) -> Self {
        Self {
            now,
            timers,
            telemetry,
        }
    }

    /// Schedules `key` relative to the dispatch instant.
    pub fn schedule_after(
        &mut self,
        delay: Duration,
        key: TimerKey,
    ) -> Result<TimerHandle, SchedulerError> {
        self.timers.schedule_after(self.now, delay, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MicrosInstant;

    fn ms(value: u64) -> MicrosInstant {
        MicrosInstant::from_millis(value)
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut timers = TimerQueue::<MicrosInstant, 4>::new();
        timers
            .schedule_at(ms(300), TimerKey::FlushDeadline)
            .expect("schedule flush");
        timers
            .schedule_at(ms(100), TimerKey::BarrierDeadline)
            .expect("schedule barrier");

        assert_eq!(timers.next_deadline(), Some(ms(100)));
        assert!(timers.pop_expired(ms(99)).is_none());

        let first = timers.pop_expired(ms(400)).expect("barrier expired");
        assert_eq!(first.key, TimerKey::BarrierDeadline);
        let second = timers.pop_expired(ms(400)).expect("flush expired");
        assert_eq!(second.key, TimerKey::FlushDeadline);
        assert!(timers.is_empty());
    }

    #[test]
    fn equal_deadlines_expire_in_schedule_order() {
        let mut timers = TimerQueue::<MicrosInstant, 4>::new();
        timers
            .schedule_at(ms(50), TimerKey::SourceRetry(SourceId::new(1)))
            .expect("schedule first");
        timers
            .schedule_at(ms(50), TimerKey::SourceRetry(SourceId::new(0)))
            .expect("schedule second");

        let first = timers.pop_expired(ms(50)).expect("first");
        assert_eq!(first.key, TimerKey::SourceRetry(SourceId::new(1)));
    }

    #[test]
    fn cancel_is_idempotent_and_never_hits_newer_timers() {
        let mut timers = TimerQueue::<MicrosInstant, 4>::new();
        let stale = timers
            .schedule_after(ms(0), Duration::from_millis(100), TimerKey::AcquisitionDeadline)
            .expect("schedule");

        assert!(timers.cancel(stale));
        assert!(!timers.cancel(stale));

        let fresh = timers
            .schedule_after(ms(0), Duration::from_millis(100), TimerKey::AcquisitionDeadline)
            .expect("reschedule");
        assert_ne!(stale, fresh);
        assert!(!timers.cancel(stale));
        assert!(timers.is_pending(fresh));
    }

    #[test]
    fn rejects_timers_beyond_capacity() {
        let mut timers = TimerQueue::<MicrosInstant, 1>::new();
        timers
            .schedule_at(ms(10), TimerKey::FlushDeadline)
            .expect("first slot");
        assert_eq!(
            timers.schedule_at(ms(20), TimerKey::BarrierDeadline),
            Err(SchedulerError::Full)
        );
    }
}
