//! Wake-cycle orchestration: boot, acquire and connect, wait, publish, flush, sleep.
//!
//! [`WakeCycle`] owns every per-cycle resource. The surrounding dispatcher
//! calls [`WakeCycle::boot`] once, then feeds transport notifications through
//! [`WakeCycle::handle`] and sleeps until [`WakeCycle::next_deadline`] before
//! calling [`WakeCycle::poll_timers`]. Every wait inside the cycle is bounded,
//! so the phase always reaches [`CyclePhase::Sleep`]; the dispatcher then
//! calls [`WakeCycle::enter_sleep`] and powers down for the returned interval.

use core::{fmt, time::Duration};

use crate::acquisition::SensorDriver;
use crate::aggregator::{
    AcquisitionAggregator, AcquisitionResult, AcquisitionStatus, AggregatorError,
};
use crate::barrier::{BarrierBits, BarrierError, BarrierWait, CompletionBarrier};
use crate::config::{ConfigError, CycleConfig};
use crate::counter::{CounterError, CycleCounter, RetainedStore};
use crate::delivery::{DeliveryQueue, FlushOutcome, MessageId, OutboundMessage, Transport};
use crate::payload::{JsonPayloadEncoder, PayloadBuffer, PayloadEncoder};
use crate::scheduler::{Dispatch, SchedulerError, TimerKey, Timers};
use crate::status::{StatusIndicator, StatusState};
use crate::telemetry::{
    CycleTelemetry, SkipReason, TelemetryEventKind, TelemetryPayload, TelemetryRecorder,
};
use crate::time::CycleInstant;

macro_rules! dispatch {
    ($cycle:ident, $now:expr) => {
        Dispatch::new($now, &mut $cycle.timers, &mut $cycle.telemetry)
    };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CyclePhase {
    Boot,
    AcquireAndConnect,
    AwaitBarrier,
    Publish,
    Flush,
    Sleep,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CyclePhase::Boot => "boot",
            CyclePhase::AcquireAndConnect => "acquire-and-connect",
            CyclePhase::AwaitBarrier => "await-barrier",
            CyclePhase::Publish => "publish",
            CyclePhase::Flush => "flush",
            CyclePhase::Sleep => "sleep",
        })
    }
}

/// Asynchronous notifications from the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleEvent {
    TransportConnected,
    TransportDisconnected,
    PublishAcked(MessageId),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishOutcome {
    Queued,
    Skipped(SkipReason),
}

/// What happened during the cycle, filled in as phases complete.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleReport {
    pub acquisition: Option<AcquisitionStatus>,
    pub barrier: Option<BarrierBits>,
    pub publish: Option<PublishOutcome>,
    pub flush: Option<FlushOutcome>,
}

/// Power-down request produced by [`WakeCycle::enter_sleep`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SleepRequest {
    /// Counter value of the cycle that just ended.
    pub cycle: u32,
    /// Value persisted for the next wake.
    pub next_cycle: u32,
    pub duration: Duration,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleError {
    Config(ConfigError),
    Aggregator(AggregatorError),
    Barrier(BarrierError),
    Scheduler(SchedulerError),
    Counter(CounterError),
    /// Operation not valid in the current phase.
    WrongPhase(CyclePhase),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Config(err) => write!(f, "config: {err}"),
            CycleError::Aggregator(err) => write!(f, "acquisition: {err}"),
            CycleError::Barrier(err) => write!(f, "barrier: {err}"),
            CycleError::Scheduler(err) => write!(f, "timers: {err}"),
            CycleError::Counter(err) => write!(f, "counter: {err}"),
            CycleError::WrongPhase(phase) => write!(f, "not allowed during {phase}"),
        }
    }
}

impl From<ConfigError> for CycleError {
    fn from(err: ConfigError) -> Self {
        CycleError::Config(err)
    }
}

impl From<AggregatorError> for CycleError {
    fn from(err: AggregatorError) -> Self {
        CycleError::Aggregator(err)
    }
}

impl From<BarrierError> for CycleError {
    fn from(err: BarrierError) -> Self {
        CycleError::Barrier(err)
    }
}

impl From<SchedulerError> for CycleError {
    fn from(err: SchedulerError) -> Self {
        CycleError::Scheduler(err)
    }
}

impl From<CounterError> for CycleError {
    fn from(err: CounterError) -> Self {
        CycleError::Counter(err)
    }
}

/// One boot-to-sleep execution of the node.
pub struct WakeCycle<D, T, S, I, E = JsonPayloadEncoder>
where
    I: CycleInstant,
{
    config: CycleConfig,
    counter: CycleCounter,
    phase: CyclePhase,
    aggregator: AcquisitionAggregator<D, I>,
    queue: DeliveryQueue<T>,
    barrier: CompletionBarrier<I>,
    status: S,
    encoder: E,
    timers: Timers<I>,
    telemetry: TelemetryRecorder<I>,
    acquisition: Option<AcquisitionResult>,
    report: CycleReport,
}

impl<D, T, S, I> WakeCycle<D, T, S, I, JsonPayloadEncoder>
where
    D: SensorDriver,
    T: Transport,
    S: StatusIndicator,
    I: CycleInstant,
{
    /// Builds the per-cycle resources with the JSON payload encoder.
    pub fn new(
        config: CycleConfig,
        counter: CycleCounter,
        aggregator: AcquisitionAggregator<D, I>,
        transport: T,
        status: S,
    ) -> Result<Self, CycleError> {
        Self::with_encoder(config, counter, aggregator, transport, status, JsonPayloadEncoder)
    }
}

impl<D, T, S, I, E> WakeCycle<D, T, S, I, E>
where
    D: SensorDriver,
    T: Transport,
    S: StatusIndicator,
    I: CycleInstant,
    E: PayloadEncoder,
{
    pub fn with_encoder(
        config: CycleConfig,
        counter: CycleCounter,
        aggregator: AcquisitionAggregator<D, I>,
        transport: T,
        status: S,
        encoder: E,
    ) -> Result<Self, CycleError> {
        config.validate()?;
        if aggregator.retry_interval() != config.retry_interval {
            return Err(ConfigError::RetryIntervalMismatch.into());
        }
        Ok(Self {
            config,
            counter,
            phase: CyclePhase::Boot,
            aggregator,
            queue: DeliveryQueue::new(transport),
            barrier: CompletionBarrier::new(),
            status,
            encoder,
            timers: Timers::new(),
            telemetry: TelemetryRecorder::new(),
            acquisition: None,
            report: CycleReport::default(),
        })
    }

    #[must_use]
    pub const fn phase(&self) -> CyclePhase {
        self.phase
    }

    #[must_use]
    pub const fn cycle(&self) -> u32 {
        self.counter.value()
    }

    #[must_use]
    pub const fn config(&self) -> &CycleConfig {
        &self.config
    }

    #[must_use]
    pub const fn report(&self) -> &CycleReport {
        &self.report
    }

    #[must_use]
    pub const fn acquisition(&self) -> Option<&AcquisitionResult> {
        self.acquisition.as_ref()
    }

    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryRecorder<I> {
        &self.telemetry
    }

    #[must_use]
    pub const fn queue(&self) -> &DeliveryQueue<T> {
        &self.queue
    }

    /// Earliest instant at which [`WakeCycle::poll_timers`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        self.timers.next_deadline()
    }

    #[must_use]
    pub fn is_ready_to_sleep(&self) -> bool {
        self.phase == CyclePhase::Sleep
    }

    /// Starts acquisition and the transport connection, then registers the
    /// bounded barrier wait.
    pub fn boot(&mut self, now: I) -> Result<CyclePhase, CycleError> {
        if self.phase != CyclePhase::Boot {
            return Err(CycleError::WrongPhase(self.phase));
        }
        self.status.set_status(StatusState::FastBlink);
        self.telemetry.record(
            TelemetryEventKind::CycleStarted,
            TelemetryPayload::Cycle(CycleTelemetry::new(self.counter.value(), None)),
            now,
        );

        self.phase = CyclePhase::AcquireAndConnect;
        // A refused connect request leaves transport_ready unset; the barrier
        // deadline covers it.
        if self.queue.connect().is_err() {
            self.telemetry.record(
                TelemetryEventKind::ConnectRefused,
                TelemetryPayload::none(),
                now,
            );
        }

        let completed = {
            let mut cx = dispatch!(self, now);
            self.aggregator
                .start(self.config.acquisition_timeout, &mut cx)?
        };
        if let Some(result) = completed {
            self.acquisition_finished(result, now)?;
        }

        self.phase = CyclePhase::AwaitBarrier;
        self.status.set_status(StatusState::SlowBlink);
        let wait = {
            let mut cx = dispatch!(self, now);
            self.barrier
                .wait(BarrierBits::ALL, self.config.barrier_timeout, &mut cx)?
        };
        if let BarrierWait::Released(observed) = wait {
            self.barrier_released(observed, now)?;
        }
        Ok(self.phase)
    }

    /// Feeds one transport notification into the cycle.
    pub fn handle(&mut self, event: CycleEvent, now: I) -> Result<CyclePhase, CycleError> {
        match event {
            CycleEvent::TransportConnected => {
                let released = {
                    let mut cx = dispatch!(self, now);
                    self.queue.on_transport_connected(&mut cx);
                    self.barrier.signal(BarrierBits::TRANSPORT_READY, &mut cx)
                };
                if let Some(observed) = released {
                    self.barrier_released(observed, now)?;
                }
            }
            CycleEvent::TransportDisconnected => {
                let mut cx = dispatch!(self, now);
                self.queue.on_transport_disconnected(&mut cx);
                self.barrier.retract(BarrierBits::TRANSPORT_READY);
            }
            CycleEvent::PublishAcked(id) => {
                let flushed = {
                    let mut cx = dispatch!(self, now);
                    self.queue.on_ack(id, &mut cx)
                };
                if let Some(outcome) = flushed {
                    self.flush_finished(outcome);
                }
            }
        }
        Ok(self.phase)
    }

    /// Routes every timer expired at `now` to its owner.
    pub fn poll_timers(&mut self, now: I) -> Result<CyclePhase, CycleError> {
        while let Some(expired) = self.timers.pop_expired(now) {
            match expired.key {
                TimerKey::SourceRetry(_) | TimerKey::AcquisitionDeadline => {
                    let completed = {
                        let mut cx = dispatch!(self, now);
                        self.aggregator.on_timer(expired, &mut cx)
                    };
                    if let Some(result) = completed {
                        self.acquisition_finished(result, now)?;
                    }
                }
                TimerKey::BarrierDeadline => {
                    let released = {
                        let mut cx = dispatch!(self, now);
                        self.barrier.on_deadline(expired.handle, &mut cx)
                    };
                    if let Some(observed) = released {
                        self.barrier_released(observed, now)?;
                    }
                }
                TimerKey::FlushDeadline => {
                    let flushed = {
                        let mut cx = dispatch!(self, now);
                        self.queue.on_flush_deadline(expired.handle, &mut cx)
                    };
                    if let Some(outcome) = flushed {
                        self.flush_finished(outcome);
                    }
                }
            }
        }
        Ok(self.phase)
    }

    /// Releases per-cycle resources and persists the counter for the next wake.
    ///
    /// Only valid once the cycle reached [`CyclePhase::Sleep`]; the counter is
    /// written exactly once.
    pub fn enter_sleep<R>(&mut self, store: &mut R, now: I) -> Result<SleepRequest, CycleError>
    where
        R: RetainedStore,
    {
        if self.phase != CyclePhase::Sleep {
            return Err(CycleError::WrongPhase(self.phase));
        }

        self.queue.disconnect();
        self.timers.clear();
        let next_cycle = self.counter.commit_next(store)?;
        self.status.set_status(StatusState::Off);
        self.telemetry.record(
            TelemetryEventKind::SleepEntered,
            TelemetryPayload::Cycle(CycleTelemetry::new(
                next_cycle,
                Some(self.config.sleep_interval),
            )),
            now,
        );

        Ok(SleepRequest {
            cycle: self.counter.value(),
            next_cycle,
            duration: self.config.sleep_interval,
        })
    }

    fn acquisition_finished(
        &mut self,
        result: AcquisitionResult,
        now: I,
    ) -> Result<(), CycleError> {
        self.report.acquisition = Some(result.status());
        self.acquisition = Some(result);

        let released = {
            let mut cx = dispatch!(self, now);
            self.barrier.signal(BarrierBits::ACQUISITION_DONE, &mut cx)
        };
        if let Some(observed) = released {
            self.barrier_released(observed, now)?;
        }
        Ok(())
    }

    fn barrier_released(&mut self, observed: BarrierBits, now: I) -> Result<(), CycleError> {
        if self.phase != CyclePhase::AwaitBarrier {
            return Ok(());
        }
        self.report.barrier = Some(observed);
        self.phase = CyclePhase::Publish;

        if !observed.contains(BarrierBits::ACQUISITION_DONE) {
            let stopped = {
                let mut cx = dispatch!(self, now);
                self.aggregator.stop(&mut cx)
            };
            if let Some(result) = stopped {
                self.report.acquisition = Some(result.status());
                self.acquisition = Some(result);
            }
        }

        let outcome = self.publish(observed, now);
        self.report.publish = Some(outcome);
        match outcome {
            PublishOutcome::Queued => {
                self.phase = CyclePhase::Flush;
                let flushed = {
                    let mut cx = dispatch!(self, now);
                    self.queue.begin_flush(self.config.flush_timeout, &mut cx)?
                };
                if let Some(outcome) = flushed {
                    self.flush_finished(outcome);
                }
            }
            PublishOutcome::Skipped(reason) => {
                self.telemetry.record(
                    TelemetryEventKind::PublishSkipped(reason),
                    TelemetryPayload::none(),
                    now,
                );
                self.cycle_done();
            }
        }
        Ok(())
    }

    fn publish(&mut self, observed: BarrierBits, now: I) -> PublishOutcome {
        if !observed.contains(BarrierBits::TRANSPORT_READY) {
            return PublishOutcome::Skipped(SkipReason::TransportUnavailable);
        }
        let Some(result) = self.acquisition.as_ref() else {
            return PublishOutcome::Skipped(SkipReason::NoData);
        };
        if result.filled_count() == 0 {
            return PublishOutcome::Skipped(SkipReason::NoData);
        }

        let mut payload = PayloadBuffer::new();
        if self
            .encoder
            .encode(self.counter.value(), result, &mut payload)
            .is_err()
        {
            return PublishOutcome::Skipped(SkipReason::EncodeFailed);
        }
        let Ok(message) = OutboundMessage::new(self.config.topic, &payload) else {
            return PublishOutcome::Skipped(SkipReason::QueueRejected);
        };

        let mut cx = dispatch!(self, now);
        match self.queue.enqueue(message, &mut cx) {
            Ok(()) => PublishOutcome::Queued,
            Err(_) => PublishOutcome::Skipped(SkipReason::QueueRejected),
        }
    }

    fn flush_finished(&mut self, outcome: FlushOutcome) {
        if self.phase != CyclePhase::Flush {
            return;
        }
        self.report.flush = Some(outcome);
        self.cycle_done();
    }

    fn cycle_done(&mut self) {
        self.phase = CyclePhase::Sleep;
        self.status.set_status(StatusState::On);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Reading;
    use crate::time::MicrosInstant;

    struct Steady;

    impl SensorDriver for Steady {
        type Error = ();

        fn read(&mut self) -> Result<Reading, ()> {
            Ok(Reading::new().with("temperature", 20.0))
        }
    }

    struct Offline;

    impl Transport for Offline {
        type Error = ();

        fn connect(&mut self) -> Result<(), ()> {
            Err(())
        }

        fn disconnect(&mut self) {}

        fn publish(&mut self, _topic: &str, _payload: &str) -> Result<MessageId, ()> {
            Err(())
        }
    }

    #[derive(Default)]
    struct StatusLog(heapless::Vec<StatusState, 8>);

    impl StatusIndicator for StatusLog {
        fn set_status(&mut self, state: StatusState) {
            let _ = self.0.push(state);
        }
    }

    struct Store(Option<u32>);

    impl RetainedStore for Store {
        fn load(&mut self) -> Option<u32> {
            self.0
        }

        fn store(&mut self, value: u32) {
            self.0 = Some(value);
        }
    }

    #[test]
    fn offline_cycle_skips_publish_and_sleeps() {
        let mut store = Store(Some(41));
        let mut status = StatusLog::default();
        let mut aggregator = AcquisitionAggregator::new(Duration::from_millis(100));
        aggregator.add_source("bme280", Steady, true).expect("add");

        let mut cycle = WakeCycle::new(
            CycleConfig::new().with_barrier_timeout(Duration::from_millis(500)),
            CycleCounter::resume(&mut store),
            aggregator,
            Offline,
            &mut status,
        )
        .expect("valid config");

        assert_eq!(cycle.boot(MicrosInstant::ZERO), Ok(CyclePhase::AwaitBarrier));
        let deadline = cycle.next_deadline().expect("barrier deadline");
        assert_eq!(deadline, MicrosInstant::from_millis(500));
        assert_eq!(cycle.poll_timers(deadline), Ok(CyclePhase::Sleep));
        assert_eq!(
            cycle.report().publish,
            Some(PublishOutcome::Skipped(SkipReason::TransportUnavailable))
        );

        let request = cycle.enter_sleep(&mut store, deadline).expect("sleep");
        assert_eq!(request.cycle, 41);
        assert_eq!(request.next_cycle, 42);
        assert_eq!(request.duration, Duration::from_secs(60));
        assert_eq!(
            cycle.enter_sleep(&mut store, deadline),
            Err(CycleError::Counter(CounterError::AlreadyCommitted))
        );
        drop(cycle);

        assert_eq!(
            status.0.as_slice(),
            &[
                StatusState::FastBlink,
                StatusState::SlowBlink,
                StatusState::On,
                StatusState::Off
            ]
        );
        assert_eq!(store.0, Some(42));
    }

    #[test]
    fn sleep_before_the_cycle_finishes_is_rejected() {
        let mut store = Store(None);
        let aggregator =
            AcquisitionAggregator::<Steady, MicrosInstant>::new(Duration::from_millis(100));
        let mut cycle = WakeCycle::new(
            CycleConfig::new(),
            CycleCounter::resume(&mut store),
            aggregator,
            Offline,
            StatusLog::default(),
        )
        .expect("valid config");

        assert_eq!(
            cycle.enter_sleep(&mut store, MicrosInstant::ZERO),
            Err(CycleError::WrongPhase(CyclePhase::Boot))
        );
        assert_eq!(store.0, None);
    }

    #[test]
    fn refused_connect_is_recorded_and_the_barrier_still_waits() {
        let mut store = Store(Some(3));
        let mut aggregator = AcquisitionAggregator::new(Duration::from_millis(100));
        aggregator.add_source("bme280", Steady, true).expect("add");
        let mut cycle = WakeCycle::new(
            CycleConfig::new().with_barrier_timeout(Duration::from_millis(800)),
            CycleCounter::resume(&mut store),
            aggregator,
            Offline,
            StatusLog::default(),
        )
        .expect("valid config");

        cycle.boot(MicrosInstant::ZERO).expect("boot");

        let refused = cycle
            .telemetry()
            .oldest_first()
            .find(|record| record.event == TelemetryEventKind::ConnectRefused)
            .expect("refusal recorded");
        assert_eq!(refused.timestamp, MicrosInstant::ZERO);
        assert_eq!(cycle.telemetry().count(TelemetryEventKind::ConnectRefused), 1);
        assert_eq!(cycle.phase(), CyclePhase::AwaitBarrier);
        assert_eq!(cycle.next_deadline(), Some(MicrosInstant::from_millis(800)));
    }

    #[test]
    fn aggregator_retry_interval_must_match_config() {
        let mut store = Store(None);
        let aggregator =
            AcquisitionAggregator::<Steady, MicrosInstant>::new(Duration::from_millis(250));
        let built = WakeCycle::new(
            CycleConfig::new(),
            CycleCounter::resume(&mut store),
            aggregator,
            Offline,
            StatusLog::default(),
        );

        assert!(matches!(
            built,
            Err(CycleError::Config(ConfigError::RetryIntervalMismatch))
        ));
    }
}
