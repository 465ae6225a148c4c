use std::cell::RefCell;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use node_core::acquisition::{Reading, SensorDriver};
use node_core::aggregator::AcquisitionAggregator;
use node_core::config::CycleConfig;
use node_core::counter::{CycleCounter, RetainedStore};
use node_core::cycle::{CycleError, CycleEvent, CyclePhase, CycleReport, WakeCycle};
use node_core::delivery::{MessageId, Transport};
use node_core::link::{LinkCommand, LinkEvent, parse_command, parse_event};
use node_core::status::{StatusIndicator, StatusState};
use node_core::telemetry::EventId;
use node_core::time::{CycleInstant, MicrosInstant};

/// How the simulated coprocessor and broker respond.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BrokerProfile {
    /// Delay from `CONNECT` to `+CONNECTED`; `None` never connects.
    pub connect_delay: Option<Duration>,
    /// Delay from `PUB` to `+PUBACK`; `None` never acknowledges.
    pub ack_delay: Option<Duration>,
    /// Once per cycle, drop the link this long after the first publish and
    /// reconnect after the second delay. The dropped publish is never acked.
    pub drop_after_publish: Option<(Duration, Duration)>,
}

impl BrokerProfile {
    pub const RESPONSIVE: Self = Self {
        connect_delay: Some(Duration::from_millis(20)),
        ack_delay: Some(Duration::from_millis(30)),
        drop_after_publish: None,
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScenarioSettings {
    pub cycles: u32,
    /// Failed attempts before the sensor answers, every cycle.
    pub sensor_failures: u32,
    pub broker: BrokerProfile,
    pub cycle: CycleConfig,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scenario {
    Nominal,
    FlakySensor,
    DeadSensor,
    NoBroker,
    SlowBroker,
    LinkDrop,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Nominal,
        Scenario::FlakySensor,
        Scenario::DeadSensor,
        Scenario::NoBroker,
        Scenario::SlowBroker,
        Scenario::LinkDrop,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Scenario::Nominal => "nominal",
            Scenario::FlakySensor => "flaky-sensor",
            Scenario::DeadSensor => "dead-sensor",
            Scenario::NoBroker => "no-broker",
            Scenario::SlowBroker => "slow-broker",
            Scenario::LinkDrop => "link-drop",
        }
    }

    pub fn log_path(self) -> &'static str {
        match self {
            Scenario::Nominal => "scenarios/nominal.log",
            Scenario::FlakySensor => "scenarios/flaky-sensor.log",
            Scenario::DeadSensor => "scenarios/dead-sensor.log",
            Scenario::NoBroker => "scenarios/no-broker.log",
            Scenario::SlowBroker => "scenarios/slow-broker.log",
            Scenario::LinkDrop => "scenarios/link-drop.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            Scenario::Nominal => "Sensor node emulator: nominal duty cycle",
            Scenario::FlakySensor => "Sensor node emulator: sensor answers on the third attempt",
            Scenario::DeadSensor => "Sensor node emulator: sensor never answers",
            Scenario::NoBroker => "Sensor node emulator: broker unreachable",
            Scenario::SlowBroker => "Sensor node emulator: broker never acknowledges",
            Scenario::LinkDrop => "Sensor node emulator: link drops mid-flush",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| tag.eq_ignore_ascii_case(scenario.tag()))
            .ok_or_else(|| format!("Unknown scenario `{tag}`"))
    }

    pub fn settings(self) -> ScenarioSettings {
        let base = ScenarioSettings {
            cycles: 3,
            sensor_failures: 0,
            broker: BrokerProfile::RESPONSIVE,
            cycle: CycleConfig::new(),
        };
        match self {
            Scenario::Nominal => base,
            Scenario::FlakySensor => ScenarioSettings {
                sensor_failures: 2,
                ..base
            },
            Scenario::DeadSensor => ScenarioSettings {
                sensor_failures: u32::MAX,
                ..base
            },
            Scenario::NoBroker => ScenarioSettings {
                broker: BrokerProfile {
                    connect_delay: None,
                    ..BrokerProfile::RESPONSIVE
                },
                ..base
            },
            Scenario::SlowBroker => ScenarioSettings {
                broker: BrokerProfile {
                    ack_delay: None,
                    ..BrokerProfile::RESPONSIVE
                },
                ..base
            },
            Scenario::LinkDrop => ScenarioSettings {
                broker: BrokerProfile {
                    drop_after_publish: Some((
                        Duration::from_millis(10),
                        Duration::from_millis(50),
                    )),
                    ..BrokerProfile::RESPONSIVE
                },
                ..base
            },
        }
    }
}

/// What a transcript line describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineKind {
    /// Line written by the node to the coprocessor.
    NodeToLink,
    /// Line written by the coprocessor to the node.
    LinkToNode,
    Status,
    Telemetry,
    Summary,
}

impl LineKind {
    pub fn prefix(self) -> &'static str {
        match self {
            LineKind::NodeToLink => "NODE>",
            LineKind::LinkToNode => "LINK<",
            LineKind::Status => "LED  ",
            LineKind::Telemetry => "TELEM",
            LineKind::Summary => "=====",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TranscriptLine {
    pub at: MicrosInstant,
    pub kind: LineKind,
    pub text: String,
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[+{:>8} ms] {} {}",
            self.at.as_millis(),
            self.kind.prefix(),
            self.text
        )
    }
}

/// Summary of one simulated wake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleOutcome {
    pub cycle: u32,
    pub report: CycleReport,
    pub awake: Duration,
    pub published: Vec<String>,
}

#[derive(Debug)]
pub enum SimError {
    Cycle(CycleError),
    /// Nothing left to wait for before the cycle reached sleep.
    Stalled(CyclePhase),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Cycle(err) => write!(f, "cycle error: {err}"),
            SimError::Stalled(phase) => write!(f, "cycle stalled in {phase}"),
        }
    }
}

impl From<CycleError> for SimError {
    fn from(err: CycleError) -> Self {
        SimError::Cycle(err)
    }
}

/// Runs consecutive wake cycles on a virtual clock.
pub struct Simulator {
    settings: ScenarioSettings,
    store: RamStore,
    now: MicrosInstant,
    transcript: Vec<TranscriptLine>,
}

impl Simulator {
    pub fn new(settings: ScenarioSettings) -> Self {
        Self {
            settings,
            store: RamStore::default(),
            now: MicrosInstant::ZERO,
            transcript: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ScenarioSettings {
        &self.settings
    }

    pub fn now(&self) -> MicrosInstant {
        self.now
    }

    /// Removes and returns the transcript lines produced so far.
    pub fn take_transcript(&mut self) -> Vec<TranscriptLine> {
        std::mem::take(&mut self.transcript)
    }

    /// Runs every configured cycle.
    #[cfg(test)]
    pub fn run(&mut self) -> Result<Vec<CycleOutcome>, SimError> {
        (0..self.settings.cycles).map(|_| self.run_cycle()).collect()
    }

    /// Boots one wake cycle, drives it to sleep, and advances the clock past
    /// the sleep interval.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, SimError> {
        let started = self.now;
        let counter = CycleCounter::resume(&mut self.store);
        let mut aggregator = AcquisitionAggregator::new(self.settings.cycle.retry_interval);
        aggregator
            .add_source(
                "bme280",
                FlakySensor::new(self.settings.sensor_failures, counter.value()),
                true,
            )
            .map_err(CycleError::from)?;

        let coprocessor = Rc::new(RefCell::new(Coprocessor::new(self.settings.broker)));
        let status = StatusTrace::default();
        let cycle = WakeCycle::new(
            self.settings.cycle,
            counter,
            aggregator,
            WireTransport::new(Rc::clone(&coprocessor)),
            status.clone(),
        )?;
        let mut rig = CycleRig {
            cycle,
            coprocessor,
            status,
            inbound: Vec::new(),
            cursor: None,
        };

        rig.cycle.boot(self.now)?;
        rig.collect(self.now, &mut self.transcript);

        while !rig.cycle.is_ready_to_sleep() {
            let next_line = rig.next_inbound();
            match (rig.cycle.next_deadline(), next_line) {
                (deadline, Some(index))
                    if deadline.is_none_or(|deadline| rig.inbound[index].0 < deadline) =>
                {
                    let (at, line) = rig.inbound.remove(index);
                    self.now = at;
                    rig.deliver(at, &line, &mut self.transcript)?;
                }
                (Some(deadline), _) => {
                    self.now = deadline;
                    rig.cycle.poll_timers(deadline)?;
                }
                (None, _) => return Err(SimError::Stalled(rig.cycle.phase())),
            }
            rig.collect(self.now, &mut self.transcript);
        }

        let request = rig.cycle.enter_sleep(&mut self.store, self.now)?;
        rig.collect(self.now, &mut self.transcript);

        let outcome = CycleOutcome {
            cycle: request.cycle,
            report: *rig.cycle.report(),
            awake: self.now.saturating_duration_since(started),
            published: rig.coprocessor.borrow().published.clone(),
        };
        self.transcript.push(TranscriptLine {
            at: self.now,
            kind: LineKind::Summary,
            text: format!(
                "cycle {} awake {} ms, sleeping {} s; {:?}",
                outcome.cycle,
                outcome.awake.as_millis(),
                request.duration.as_secs(),
                outcome.report
            ),
        });
        self.now = self.now + request.duration;
        Ok(outcome)
    }
}

type SimCycle = WakeCycle<FlakySensor, WireTransport, StatusTrace, MicrosInstant>;

/// Per-cycle resources plus the coprocessor lines still in flight.
struct CycleRig {
    cycle: SimCycle,
    coprocessor: Rc<RefCell<Coprocessor>>,
    status: StatusTrace,
    inbound: Vec<(MicrosInstant, String)>,
    cursor: Option<EventId>,
}

impl CycleRig {
    fn next_inbound(&self) -> Option<usize> {
        self.inbound
            .iter()
            .enumerate()
            .min_by_key(|(_, (at, _))| *at)
            .map(|(index, _)| index)
    }

    fn deliver(
        &mut self,
        at: MicrosInstant,
        line: &str,
        transcript: &mut Vec<TranscriptLine>,
    ) -> Result<(), SimError> {
        transcript.push(TranscriptLine {
            at,
            kind: LineKind::LinkToNode,
            text: line.trim_end().to_string(),
        });
        let event = match parse_event(line) {
            Ok(LinkEvent::Connected) => CycleEvent::TransportConnected,
            Ok(LinkEvent::Disconnected) => CycleEvent::TransportDisconnected,
            Ok(LinkEvent::PubAck(id)) => CycleEvent::PublishAcked(id),
            Ok(LinkEvent::Error(_)) => return Ok(()),
            Err(err) => {
                transcript.push(TranscriptLine {
                    at,
                    kind: LineKind::Telemetry,
                    text: format!("ignored link line: {err}"),
                });
                return Ok(());
            }
        };
        self.cycle.handle(event, at)?;
        Ok(())
    }

    /// Moves side effects of the last step into the transcript.
    fn collect(&mut self, now: MicrosInstant, transcript: &mut Vec<TranscriptLine>) {
        let mut coprocessor = self.coprocessor.borrow_mut();
        for line in coprocessor.received.drain(..) {
            transcript.push(TranscriptLine {
                at: now,
                kind: LineKind::NodeToLink,
                text: line.trim_end().to_string(),
            });
        }
        for (delay, line) in coprocessor.outbox.drain(..) {
            self.inbound.push((now + delay, line));
        }
        drop(coprocessor);

        for state in self.status.0.borrow_mut().drain(..) {
            transcript.push(TranscriptLine {
                at: now,
                kind: LineKind::Status,
                text: state.to_string(),
            });
        }

        for record in self.cycle.telemetry().since(self.cursor) {
            let details = record.details.to_string();
            let text = if details.is_empty() {
                record.event.to_string()
            } else {
                format!("{} {details}", record.event)
            };
            transcript.push(TranscriptLine {
                at: record.timestamp,
                kind: LineKind::Telemetry,
                text,
            });
            self.cursor = Some(record.id);
        }
    }
}

/// Sensor that fails a fixed number of attempts per cycle, then reports a
/// reading that drifts slightly from one cycle to the next.
pub struct FlakySensor {
    failures_left: u32,
    cycle: u32,
}

impl FlakySensor {
    pub fn new(failures: u32, cycle: u32) -> Self {
        Self {
            failures_left: failures,
            cycle,
        }
    }
}

impl SensorDriver for FlakySensor {
    type Error = &'static str;

    fn read(&mut self) -> Result<Reading, Self::Error> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err("bme280: no response");
        }
        let drift = f32::from(u8::try_from(self.cycle % 8).unwrap_or(0)) * 0.25;
        Ok(Reading::new()
            .with("temperature", 21.5 + drift)
            .with("humidity", 48.25 - drift)
            .with("pressure", 1009.75))
    }
}

/// Retained word that survives the simulated power-down.
#[derive(Debug, Default)]
pub struct RamStore(Option<u32>);

impl RetainedStore for RamStore {
    fn load(&mut self) -> Option<u32> {
        self.0
    }

    fn store(&mut self, value: u32) {
        self.0 = Some(value);
    }
}

#[derive(Clone, Default)]
struct StatusTrace(Rc<RefCell<Vec<StatusState>>>);

impl StatusIndicator for StatusTrace {
    fn set_status(&mut self, state: StatusState) {
        self.0.borrow_mut().push(state);
    }
}

/// Node side of the link: encodes each request as a protocol line.
struct WireTransport {
    coprocessor: Rc<RefCell<Coprocessor>>,
    next_id: u16,
}

impl WireTransport {
    fn new(coprocessor: Rc<RefCell<Coprocessor>>) -> Self {
        Self {
            coprocessor,
            next_id: 0,
        }
    }

    fn send(&self, command: &LinkCommand<'_>) -> Result<(), fmt::Error> {
        let mut line = String::new();
        command.encode(&mut line)?;
        self.coprocessor.borrow_mut().receive(line);
        Ok(())
    }
}

impl Transport for WireTransport {
    type Error = fmt::Error;

    fn connect(&mut self) -> Result<(), Self::Error> {
        self.send(&LinkCommand::Connect)
    }

    fn disconnect(&mut self) {
        let _ = self.send(&LinkCommand::Disconnect);
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<MessageId, Self::Error> {
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        let id = MessageId(self.next_id);
        self.send(&LinkCommand::Publish { id, topic, payload })?;
        Ok(id)
    }
}

/// Coprocessor and broker model: parses command lines and schedules replies.
struct Coprocessor {
    profile: BrokerProfile,
    connected: bool,
    dropped: bool,
    /// Lines received from the node since the last collection.
    received: Vec<String>,
    /// Replies and the delay after which they reach the node.
    outbox: Vec<(Duration, String)>,
    published: Vec<String>,
}

impl Coprocessor {
    fn new(profile: BrokerProfile) -> Self {
        Self {
            profile,
            connected: false,
            dropped: false,
            received: Vec::new(),
            outbox: Vec::new(),
            published: Vec::new(),
        }
    }

    fn receive(&mut self, line: String) {
        match parse_command(&line) {
            Ok(LinkCommand::Connect) => {
                if let Some(delay) = self.profile.connect_delay {
                    self.connected = true;
                    self.reply(delay, &LinkEvent::Connected);
                }
            }
            Ok(LinkCommand::Disconnect) => self.connected = false,
            Ok(LinkCommand::Publish { id, payload, .. }) => {
                if self.connected {
                    self.published.push(payload.to_string());
                    self.acknowledge(id);
                } else {
                    self.reply(Duration::ZERO, &LinkEvent::Error("not connected"));
                }
            }
            Err(_) => self.reply(Duration::ZERO, &LinkEvent::Error("bad command")),
        }
        self.received.push(line);
    }

    fn acknowledge(&mut self, id: MessageId) {
        if let (Some((drop_after, reconnect_after)), false) =
            (self.profile.drop_after_publish, self.dropped)
        {
            self.dropped = true;
            self.reply(drop_after, &LinkEvent::Disconnected);
            self.reply(drop_after + reconnect_after, &LinkEvent::Connected);
            return;
        }
        if let Some(delay) = self.profile.ack_delay {
            self.reply(delay, &LinkEvent::PubAck(id));
        }
    }

    fn reply(&mut self, delay: Duration, event: &LinkEvent<'_>) {
        let mut line = String::new();
        if event.encode(&mut line).is_ok() {
            self.outbox.push((delay, line));
        }
    }
}

/// Writes transcripts to disk, one file per scenario.
pub struct TranscriptWriter {
    writer: BufWriter<fs::File>,
}

impl TranscriptWriter {
    pub fn create(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = Self {
            writer: BufWriter::new(file),
        };
        writeln!(writer.writer, "# {header}")?;
        writeln!(
            writer.writer,
            "# Timestamps are virtual milliseconds since the first boot"
        )?;
        writeln!(writer.writer)?;
        writer.writer.flush()?;
        Ok(writer)
    }

    pub fn append(&mut self, lines: &[TranscriptLine]) -> io::Result<()> {
        for line in lines {
            writeln!(self.writer, "{line}")?;
        }
        self.writer.flush()
    }
}
