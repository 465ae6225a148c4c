//! Single-sensor acquisition with retry-until-success semantics.
//!
//! A [`RetryingSource`] performs one measurement attempt per [`RetryingSource::begin`].
//! Failed attempts are swallowed and a retry is scheduled on the cycle timer
//! queue after a fixed interval. The reading is handed back exactly once; the
//! owner stops further attempts with [`RetryingSource::abandon`].

use core::{fmt, time::Duration};

use heapless::Vec;

use crate::scheduler::{Dispatch, TimerHandle, TimerKey, Timers};
use crate::telemetry::{SourceTelemetry, TelemetryEventKind, TelemetryPayload};
use crate::time::CycleInstant;

/// Upper bound on sources owned by one aggregator.
pub const MAX_SOURCES: usize = 4;

/// Upper bound on named values carried by one reading.
pub const MAX_FIELDS: usize = 4;

/// Default spacing between failed attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Index of a source within its aggregator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceId(u8);

impl SourceId {
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source{}", self.0)
    }
}

/// Named measurement value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub value: f32,
}

/// One successful measurement: a short list of named values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reading {
    fields: Vec<Field, MAX_FIELDS>,
}

impl Reading {
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field, handing it back when the reading already holds
    /// [`MAX_FIELDS`].
    pub fn push(&mut self, name: &'static str, value: f32) -> Result<(), Field> {
        self.fields.push(Field { name, value })
    }

    /// Builder form of [`Reading::push`]. Overfilling is a driver bug and
    /// panics in debug builds.
    #[must_use]
    pub fn with(mut self, name: &'static str, value: f32) -> Self {
        let pushed = self.push(name, value);
        debug_assert!(pushed.is_ok(), "reading holds at most {MAX_FIELDS} fields");
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f32> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Sensor driver consumed by the acquisition layer.
///
/// `read` either yields a complete reading or fails; failures are treated as
/// transient and retried by [`RetryingSource`].
pub trait SensorDriver {
    type Error: fmt::Debug;

    /// Readies the part for the following `read`, called at the start of
    /// every attempt. Drivers use it to start a conversion or to finish a
    /// deferred initialization; an error fails the attempt without a `read`
    /// and the next attempt calls `trigger` again.
    fn trigger(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Fetches the latest conversion.
    fn read(&mut self) -> Result<Reading, Self::Error>;
}

impl<D> SensorDriver for &mut D
where
    D: SensorDriver,
{
    type Error = D::Error;

    fn trigger(&mut self) -> Result<(), Self::Error> {
        (**self).trigger()
    }

    fn read(&mut self) -> Result<Reading, Self::Error> {
        (**self).read()
    }
}

/// Lifecycle of a retrying source within one acquisition run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceState {
    Idle,
    RetryPending(TimerHandle),
    Ready,
    Abandoned,
}

/// Wraps one sensor and retries failed attempts at a fixed interval.
pub struct RetryingSource<D> {
    id: SourceId,
    driver: D,
    retry_interval: Duration,
    state: SourceState,
    attempts: u16,
}

impl<D> RetryingSource<D>
where
    D: SensorDriver,
{
    #[must_use]
    pub const fn new(id: SourceId, driver: D, retry_interval: Duration) -> Self {
        Self {
            id,
            driver,
            retry_interval,
            state: SourceState::Idle,
            attempts: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SourceId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> SourceState {
        self.state
    }

    /// Attempts made since the last [`RetryingSource::begin`].
    #[must_use]
    pub const fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Starts a fresh acquisition and performs the first attempt immediately.
    ///
    /// A retry still pending from an earlier run is cancelled first so only
    /// one retry timer ever exists for this source.
    pub fn begin<I>(&mut self, cx: &mut Dispatch<'_, I>) -> Option<Reading>
    where
        I: CycleInstant,
    {
        self.cancel_retry(cx.timers);
        self.attempts = 0;
        self.attempt(cx)
    }

    /// Handles an expired [`TimerKey::SourceRetry`] timer.
    ///
    /// Stale handles (from a superseded or abandoned run) are ignored.
    pub fn on_retry_timer<I>(
        &mut self,
        handle: TimerHandle,
        cx: &mut Dispatch<'_, I>,
    ) -> Option<Reading>
    where
        I: CycleInstant,
    {
        match self.state {
            SourceState::RetryPending(pending) if pending == handle => self.attempt(cx),
            _ => None,
        }
    }

    /// Stops retrying. A source that already delivered stays [`SourceState::Ready`].
    pub fn abandon<I>(&mut self, timers: &mut Timers<I>)
    where
        I: CycleInstant,
    {
        self.cancel_retry(timers);
        if self.state != SourceState::Ready {
            self.state = SourceState::Abandoned;
        }
    }

    fn cancel_retry<I>(&mut self, timers: &mut Timers<I>)
    where
        I: CycleInstant,
    {
        if let SourceState::RetryPending(handle) = self.state {
            timers.cancel(handle);
            self.state = SourceState::Idle;
        }
    }

    fn attempt<I>(&mut self, cx: &mut Dispatch<'_, I>) -> Option<Reading>
    where
        I: CycleInstant,
    {
        self.attempts = self.attempts.saturating_add(1);
        let outcome = self.driver.trigger().and_then(|()| self.driver.read());
        let details = TelemetryPayload::Source(SourceTelemetry::new(self.id, self.attempts));

        match outcome {
            Ok(reading) => {
                self.state = SourceState::Ready;
                cx.telemetry
                    .record(TelemetryEventKind::SourceReady(self.id), details, cx.now);
                Some(reading)
            }
            Err(_) => {
                cx.telemetry.record(
                    TelemetryEventKind::SourceAttemptFailed(self.id),
                    details,
                    cx.now,
                );
                // Each source owns a dedicated timer slot, so a full queue means
                // the run was torn down around us.
                let retry = cx.schedule_after(self.retry_interval, TimerKey::SourceRetry(self.id));
                self.state = match retry {
                    Ok(handle) => SourceState::RetryPending(handle),
                    Err(_) => SourceState::Abandoned,
                };
                None
            }
        }
    }
}
