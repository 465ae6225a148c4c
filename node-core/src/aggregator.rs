//! Fan-out/fan-in over a small fixed set of retrying sources.
//!
//! [`AcquisitionAggregator::start`] begins every enabled source together and
//! arms a one-shot deadline. Completion is handed back exactly once per start:
//! when every enabled slot holds a reading (`Ok`), when the deadline fires
//! first (`Timeout`), or when the owner calls [`AcquisitionAggregator::stop`]
//! (`Stopped`). Whatever slots were filled at that point travel with the
//! result.

use core::{fmt, mem, time::Duration};

use heapless::Vec;

use crate::acquisition::{MAX_SOURCES, Reading, RetryingSource, SensorDriver, SourceId};
use crate::scheduler::{Dispatch, ExpiredTimer, SchedulerError, TimerHandle, TimerKey};
use crate::telemetry::{AcquisitionTelemetry, TelemetryEventKind, TelemetryPayload};
use crate::time::CycleInstant;

/// Terminal status of one acquisition run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquisitionStatus {
    Ok,
    Timeout,
    Stopped,
}

impl AcquisitionStatus {
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            AcquisitionStatus::Ok => 0,
            AcquisitionStatus::Timeout => 1,
            AcquisitionStatus::Stopped => 2,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            0 => Some(AcquisitionStatus::Ok),
            1 => Some(AcquisitionStatus::Timeout),
            2 => Some(AcquisitionStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionStatus::Ok => "ok",
            AcquisitionStatus::Timeout => "timeout",
            AcquisitionStatus::Stopped => "stopped",
        })
    }
}

/// Per-source entry of an [`AcquisitionResult`].
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    /// Source is configured but not enabled this cycle.
    Absent,
    /// Source took part; `None` when it never produced a reading.
    Present(Option<Reading>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledSlot {
    pub label: &'static str,
    pub slot: Slot,
}

/// Snapshot handed out when an acquisition run completes.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionResult {
    slots: Vec<LabeledSlot, MAX_SOURCES>,
    status: AcquisitionStatus,
}

impl AcquisitionResult {
    #[must_use]
    pub const fn status(&self) -> AcquisitionStatus {
        self.status
    }

    #[must_use]
    pub fn slots(&self) -> &[LabeledSlot] {
        &self.slots
    }

    /// Filled slots with their labels, in source order.
    pub fn readings(&self) -> impl Iterator<Item = (&'static str, &Reading)> + '_ {
        self.slots.iter().filter_map(|entry| match &entry.slot {
            Slot::Present(Some(reading)) => Some((entry.label, reading)),
            _ => None,
        })
    }

    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.slot, Slot::Present(_)))
            .count()
    }

    #[must_use]
    pub fn filled_count(&self) -> usize {
        self.readings().count()
    }

    /// Complete once every enabled slot is filled or the run was cut short.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status != AcquisitionStatus::Ok || self.filled_count() == self.enabled_count()
    }
}

/// Errors reported by the aggregator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AggregatorError {
    /// `start` called while a run is still in progress.
    AlreadyRunning,
    /// More sources than [`MAX_SOURCES`].
    TooManySources,
    /// The deadline could not be armed.
    Scheduler(SchedulerError),
}

impl fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorError::AlreadyRunning => f.write_str("acquisition already running"),
            AggregatorError::TooManySources => f.write_str("source table full"),
            AggregatorError::Scheduler(err) => write!(f, "deadline: {err}"),
        }
    }
}

impl From<SchedulerError> for AggregatorError {
    fn from(err: SchedulerError) -> Self {
        AggregatorError::Scheduler(err)
    }
}

struct SourceEntry<D> {
    label: &'static str,
    enabled: bool,
    source: RetryingSource<D>,
    reading: Option<Reading>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase<I> {
    Idle,
    Running {
        started_at: I,
        deadline: Option<TimerHandle>,
    },
    Complete,
}

/// Drives a fixed set of [`RetryingSource`]s to a single completion.
pub struct AcquisitionAggregator<D, I> {
    entries: Vec<SourceEntry<D>, MAX_SOURCES>,
    retry_interval: Duration,
    phase: Phase<I>,
}

impl<D, I> AcquisitionAggregator<D, I>
where
    D: SensorDriver,
    I: CycleInstant,
{
    #[must_use]
    pub const fn new(retry_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            retry_interval,
            phase: Phase::Idle,
        }
    }

    /// Registers a sensor. Disabled sources report as [`Slot::Absent`].
    pub fn add_source(
        &mut self,
        label: &'static str,
        driver: D,
        enabled: bool,
    ) -> Result<SourceId, AggregatorError> {
        let index =
            u8::try_from(self.entries.len()).map_err(|_| AggregatorError::TooManySources)?;
        let id = SourceId::new(index);
        self.entries
            .push(SourceEntry {
                label,
                enabled,
                source: RetryingSource::new(id, driver, self.retry_interval),
                reading: None,
            })
            .map_err(|_| AggregatorError::TooManySources)?;
        Ok(id)
    }

    /// Interval every registered source waits between failed attempts.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.enabled).count()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// Resets every slot, starts all enabled sources, and arms the deadline.
    ///
    /// Returns the completed result when it is already available: zero
    /// enabled sources, or every source answering on its first attempt.
    pub fn start(
        &mut self,
        timeout: Duration,
        cx: &mut Dispatch<'_, I>,
    ) -> Result<Option<AcquisitionResult>, AggregatorError> {
        if self.is_running() {
            return Err(AggregatorError::AlreadyRunning);
        }

        self.phase = Phase::Running {
            started_at: cx.now,
            deadline: None,
        };
        for entry in &mut self.entries {
            entry.reading = None;
        }

        for entry in self.entries.iter_mut().filter(|entry| entry.enabled) {
            entry.reading = entry.source.begin(cx);
        }

        if self.all_filled() {
            return Ok(Some(self.complete(AcquisitionStatus::Ok, cx)));
        }

        let deadline = match cx.schedule_after(timeout, TimerKey::AcquisitionDeadline) {
            Ok(handle) => handle,
            Err(err) => {
                self.abandon_sources(cx);
                self.phase = Phase::Idle;
                return Err(err.into());
            }
        };
        if let Phase::Running { deadline: slot, .. } = &mut self.phase {
            *slot = Some(deadline);
        }
        Ok(None)
    }

    /// Routes an expired timer owned by the aggregator or one of its sources.
    pub fn on_timer(
        &mut self,
        expired: ExpiredTimer,
        cx: &mut Dispatch<'_, I>,
    ) -> Option<AcquisitionResult> {
        let Phase::Running { deadline, .. } = self.phase else {
            return None;
        };

        match expired.key {
            TimerKey::SourceRetry(id) => {
                let entry = self.entries.get_mut(id.index())?;
                let reading = entry.source.on_retry_timer(expired.handle, cx)?;
                entry.reading = Some(reading);
                self.all_filled()
                    .then(|| self.complete(AcquisitionStatus::Ok, cx))
            }
            TimerKey::AcquisitionDeadline if deadline == Some(expired.handle) => {
                Some(self.complete(AcquisitionStatus::Timeout, cx))
            }
            _ => None,
        }
    }

    /// Cuts a running acquisition short. No-op once completion has fired.
    pub fn stop(&mut self, cx: &mut Dispatch<'_, I>) -> Option<AcquisitionResult> {
        self.is_running()
            .then(|| self.complete(AcquisitionStatus::Stopped, cx))
    }

    /// Tears the aggregator down and hands the drivers back to the caller.
    pub fn into_drivers(self) -> impl Iterator<Item = D> {
        self.entries
            .into_iter()
            .map(|entry| entry.source.into_driver())
    }

    fn all_filled(&self) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .all(|entry| entry.reading.is_some())
    }

    fn abandon_sources(&mut self, cx: &mut Dispatch<'_, I>) {
        for entry in &mut self.entries {
            entry.source.abandon(cx.timers);
        }
    }

    fn complete(
        &mut self,
        status: AcquisitionStatus,
        cx: &mut Dispatch<'_, I>,
    ) -> AcquisitionResult {
        let started_at = match mem::replace(&mut self.phase, Phase::Complete) {
            Phase::Running {
                started_at,
                deadline,
            } => {
                if let Some(handle) = deadline {
                    cx.timers.cancel(handle);
                }
                Some(started_at)
            }
            _ => None,
        };
        self.abandon_sources(cx);

        let mut slots = Vec::new();
        for entry in &mut self.entries {
            let slot = if entry.enabled {
                Slot::Present(entry.reading.take())
            } else {
                Slot::Absent
            };
            // Both tables share MAX_SOURCES capacity.
            let _ = slots.push(LabeledSlot {
                label: entry.label,
                slot,
            });
        }

        let result = AcquisitionResult { slots, status };
        let elapsed = started_at.map(|start| cx.now.saturating_duration_since(start));
        cx.telemetry.record(
            TelemetryEventKind::AcquisitionFinished(status),
            TelemetryPayload::Acquisition(AcquisitionTelemetry::new(
                result.filled_count(),
                result.enabled_count(),
                elapsed,
            )),
            cx.now,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::DEFAULT_RETRY_INTERVAL;
    use crate::scheduler::Timers;
    use crate::telemetry::TelemetryRecorder;
    use crate::time::MicrosInstant;

    struct Scripted {
        failures: u8,
        value: f32,
    }

    impl SensorDriver for Scripted {
        type Error = ();

        fn read(&mut self) -> Result<Reading, ()> {
            if self.failures > 0 {
                self.failures -= 1;
                Err(())
            } else {
                Ok(Reading::new().with("value", self.value))
            }
        }
    }

    struct Harness {
        timers: Timers<MicrosInstant>,
        telemetry: TelemetryRecorder<MicrosInstant>,
        aggregator: AcquisitionAggregator<Scripted, MicrosInstant>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                timers: Timers::new(),
                telemetry: TelemetryRecorder::new(),
                aggregator: AcquisitionAggregator::new(DEFAULT_RETRY_INTERVAL),
            }
        }

        fn start(&mut self, timeout_ms: u64) -> Option<AcquisitionResult> {
            let mut cx = Dispatch::new(MicrosInstant::ZERO, &mut self.timers, &mut self.telemetry);
            self.aggregator
                .start(Duration::from_millis(timeout_ms), &mut cx)
                .expect("start")
        }

        fn run_until_complete(&mut self) -> Vec<AcquisitionResult, 4> {
            let mut completions = Vec::new();
            while let Some(now) = self.timers.next_deadline() {
                while let Some(expired) = self.timers.pop_expired(now) {
                    let mut cx = Dispatch::new(now, &mut self.timers, &mut self.telemetry);
                    if let Some(result) = self.aggregator.on_timer(expired, &mut cx) {
                        completions.push(result).expect("room");
                    }
                }
            }
            completions
        }
    }

    #[test]
    fn zero_enabled_sources_complete_immediately() {
        let mut harness = Harness::new();
        harness
            .aggregator
            .add_source("bme280", Scripted { failures: 0, value: 1.0 }, false)
            .expect("add");

        let result = harness.start(5_000).expect("immediate completion");
        assert_eq!(result.status(), AcquisitionStatus::Ok);
        assert_eq!(result.slots()[0].slot, Slot::Absent);
        assert_eq!(result.filled_count(), 0);
        assert!(harness.timers.is_empty());
    }

    #[test]
    fn completes_ok_once_every_source_reports() {
        let mut harness = Harness::new();
        harness
            .aggregator
            .add_source("a", Scripted { failures: 0, value: 1.0 }, true)
            .expect("add a");
        harness
            .aggregator
            .add_source("b", Scripted { failures: 3, value: 2.0 }, true)
            .expect("add b");

        assert!(harness.start(5_000).is_none());
        let completions = harness.run_until_complete();

        assert_eq!(completions.len(), 1);
        let result = &completions[0];
        assert_eq!(result.status(), AcquisitionStatus::Ok);
        assert_eq!(result.filled_count(), 2);
        assert!(harness.timers.is_empty());
    }

    #[test]
    fn deadline_reports_partial_result() {
        let mut harness = Harness::new();
        harness
            .aggregator
            .add_source("a", Scripted { failures: 0, value: 1.0 }, true)
            .expect("add a");
        harness
            .aggregator
            .add_source("b", Scripted { failures: u8::MAX, value: 2.0 }, true)
            .expect("add b");

        assert!(harness.start(1_000).is_none());
        let completions = harness.run_until_complete();

        assert_eq!(completions.len(), 1);
        let result = &completions[0];
        assert_eq!(result.status(), AcquisitionStatus::Timeout);
        assert_eq!(result.filled_count(), 1);
        assert_eq!(result.slots()[1].slot, Slot::Present(None));
        assert!(result.is_complete());
    }

    #[test]
    fn stop_fires_once_and_rejects_duplicates() {
        let mut harness = Harness::new();
        harness
            .aggregator
            .add_source("a", Scripted { failures: u8::MAX, value: 1.0 }, true)
            .expect("add");
        assert!(harness.start(5_000).is_none());

        let mut cx = Dispatch::new(
            MicrosInstant::from_millis(250),
            &mut harness.timers,
            &mut harness.telemetry,
        );
        let stopped = harness.aggregator.stop(&mut cx).expect("stopped result");
        assert_eq!(stopped.status(), AcquisitionStatus::Stopped);
        assert!(harness.aggregator.stop(&mut cx).is_none());
        assert!(harness.timers.is_empty());
    }

    #[test]
    fn start_while_running_is_rejected() {
        let mut harness = Harness::new();
        harness
            .aggregator
            .add_source("a", Scripted { failures: u8::MAX, value: 1.0 }, true)
            .expect("add");
        assert!(harness.start(5_000).is_none());

        let mut cx = Dispatch::new(
            MicrosInstant::ZERO,
            &mut harness.timers,
            &mut harness.telemetry,
        );
        assert_eq!(
            harness.aggregator.start(Duration::from_secs(1), &mut cx),
            Err(AggregatorError::AlreadyRunning)
        );
    }
}
