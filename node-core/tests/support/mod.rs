#![allow(dead_code)]

//! Host-side dispatcher used by the integration tests.
//!
//! `Simulation` plays the role of the firmware executor: it boots a
//! [`WakeCycle`], then repeatedly jumps the virtual clock to whichever comes
//! first, the next timer deadline or the next scripted transport
//! notification, until the cycle is ready to sleep.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use node_core::acquisition::{DEFAULT_RETRY_INTERVAL, Reading, SensorDriver};
use node_core::aggregator::AcquisitionAggregator;
use node_core::config::CycleConfig;
use node_core::counter::{CycleCounter, RetainedStore};
use node_core::cycle::{CycleEvent, CyclePhase, SleepRequest, WakeCycle};
use node_core::delivery::{MessageId, Transport};
use node_core::status::{StatusIndicator, StatusState};
use node_core::time::MicrosInstant;

/// Sensor that fails a fixed number of attempts before answering.
pub struct ScriptedSensor {
    failures_left: u32,
    reading: Reading,
    attempts: Rc<Cell<u32>>,
}

impl ScriptedSensor {
    pub fn succeeding_after(failures: u32, reading: Reading) -> Self {
        Self {
            failures_left: failures,
            reading,
            attempts: Rc::new(Cell::new(0)),
        }
    }

    pub fn never() -> Self {
        Self::succeeding_after(u32::MAX, Reading::new())
    }

    /// Shared attempt counter that stays readable after the sensor moves into a cycle.
    pub fn attempts(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.attempts)
    }
}

impl SensorDriver for ScriptedSensor {
    type Error = &'static str;

    fn read(&mut self) -> Result<Reading, Self::Error> {
        self.attempts.set(self.attempts.get() + 1);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err("no response");
        }
        Ok(self.reading.clone())
    }
}

pub fn bme280_reading() -> Reading {
    Reading::new()
        .with("temperature", 21.5)
        .with("humidity", 48.25)
        .with("pressure", 1009.75)
}

/// How the simulated broker behaves.
#[derive(Copy, Clone, Debug)]
pub struct BrokerScript {
    /// Delay from the connect request to the connected notification.
    pub connect_after: Option<Duration>,
    /// Delay from a publish to its acknowledgement.
    pub ack_after: Option<Duration>,
}

impl BrokerScript {
    pub const fn responsive() -> Self {
        Self {
            connect_after: Some(Duration::from_millis(20)),
            ack_after: Some(Duration::from_millis(30)),
        }
    }

    pub const fn unreachable() -> Self {
        Self {
            connect_after: None,
            ack_after: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct BrokerLog {
    pub connect_requests: u32,
    pub disconnects: u32,
    pub published: Vec<(MessageId, String, String)>,
    outbox: Vec<(Duration, CycleEvent)>,
    next_id: u16,
}

impl BrokerLog {
    pub fn payloads(&self) -> Vec<&str> {
        self.published
            .iter()
            .map(|(_, _, payload)| payload.as_str())
            .collect()
    }
}

pub struct ScriptedTransport {
    script: BrokerScript,
    log: Rc<RefCell<BrokerLog>>,
}

impl Transport for ScriptedTransport {
    type Error = &'static str;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let mut log = self.log.borrow_mut();
        log.connect_requests += 1;
        if let Some(delay) = self.script.connect_after {
            log.outbox.push((delay, CycleEvent::TransportConnected));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.borrow_mut().disconnects += 1;
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<MessageId, Self::Error> {
        let mut log = self.log.borrow_mut();
        log.next_id += 1;
        let id = MessageId(log.next_id);
        log.published
            .push((id, topic.to_owned(), payload.to_owned()));
        if let Some(delay) = self.script.ack_after {
            log.outbox.push((delay, CycleEvent::PublishAcked(id)));
        }
        Ok(id)
    }
}

#[derive(Clone, Default)]
pub struct StatusLog(Rc<RefCell<Vec<StatusState>>>);

impl StatusLog {
    pub fn states(&self) -> Vec<StatusState> {
        self.0.borrow().clone()
    }
}

impl StatusIndicator for StatusLog {
    fn set_status(&mut self, state: StatusState) {
        self.0.borrow_mut().push(state);
    }
}

/// Retained word that survives simulated power-down.
#[derive(Debug, Default)]
pub struct MemoryStore(pub Option<u32>);

impl RetainedStore for MemoryStore {
    fn load(&mut self) -> Option<u32> {
        self.0
    }

    fn store(&mut self, value: u32) {
        self.0 = Some(value);
    }
}

pub type SimCycle = WakeCycle<ScriptedSensor, ScriptedTransport, StatusLog, MicrosInstant>;

pub struct Simulation {
    pub cycle: SimCycle,
    pub now: MicrosInstant,
    pub broker: Rc<RefCell<BrokerLog>>,
    pub status: StatusLog,
    pending: Vec<(MicrosInstant, CycleEvent)>,
}

impl Simulation {
    pub fn new(
        config: CycleConfig,
        store: &mut MemoryStore,
        sensors: Vec<(&'static str, ScriptedSensor)>,
        script: BrokerScript,
    ) -> Self {
        let mut aggregator = AcquisitionAggregator::new(config.retry_interval);
        for (label, sensor) in sensors {
            aggregator
                .add_source(label, sensor, true)
                .expect("source slot");
        }

        let broker = Rc::new(RefCell::new(BrokerLog::default()));
        let transport = ScriptedTransport {
            script,
            log: Rc::clone(&broker),
        };
        let status = StatusLog::default();
        let cycle = WakeCycle::new(
            config,
            CycleCounter::resume(store),
            aggregator,
            transport,
            status.clone(),
        )
        .expect("valid config");

        Self {
            cycle,
            now: MicrosInstant::ZERO,
            broker,
            status,
            pending: Vec::new(),
        }
    }

    pub fn default_config() -> CycleConfig {
        CycleConfig::new().with_retry_interval(DEFAULT_RETRY_INTERVAL)
    }

    /// Queues an extra transport notification at an absolute instant.
    pub fn inject(&mut self, at_ms: u64, event: CycleEvent) {
        self.pending.push((MicrosInstant::from_millis(at_ms), event));
    }

    /// Runs the cycle from boot until it is ready to sleep.
    pub fn run_to_sleep(&mut self) -> CyclePhase {
        self.cycle.boot(self.now).expect("boot");
        self.collect_outbox();

        while !self.cycle.is_ready_to_sleep() {
            let next_timer = self.cycle.next_deadline();
            let next_event = self.next_event_index();

            match (next_timer, next_event) {
                (Some(deadline), Some(index)) if self.pending[index].0 < deadline => {
                    self.deliver(index);
                }
                (_, Some(index)) if next_timer.is_none() => self.deliver(index),
                (Some(deadline), _) => {
                    self.now = deadline;
                    self.cycle.poll_timers(deadline).expect("timers");
                }
                (None, None) => panic!("cycle stalled in {}", self.cycle.phase()),
                (None, Some(_)) => unreachable!(),
            }
            self.collect_outbox();
        }
        self.cycle.phase()
    }

    /// Completes the power-down step against `store`.
    pub fn sleep(&mut self, store: &mut MemoryStore) -> SleepRequest {
        self.cycle.enter_sleep(store, self.now).expect("enter sleep")
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.now.as_micros())
    }

    fn next_event_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .min_by_key(|(_, (at, _))| *at)
            .map(|(index, _)| index)
    }

    fn deliver(&mut self, index: usize) {
        let (at, event) = self.pending.remove(index);
        self.now = at;
        self.cycle.handle(event, at).expect("handle event");
    }

    fn collect_outbox(&mut self) {
        let drained: Vec<_> = self.broker.borrow_mut().outbox.drain(..).collect();
        for (delay, event) in drained {
            self.pending.push((self.now + delay, event));
        }
    }
}
