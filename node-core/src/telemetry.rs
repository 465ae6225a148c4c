//! Telemetry event catalog and recorder shared by firmware and host targets.
//!
//! Core components never log directly. They record strongly typed events into
//! a fixed-size ring; the firmware drains the ring into `defmt` and the
//! emulator prints it. Event kinds encode to compact numeric codes so they can
//! also travel over diagnostics channels.

use core::{convert::TryFrom, fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::acquisition::SourceId;
use crate::aggregator::AcquisitionStatus;
use crate::barrier::BarrierBits;
use crate::delivery::{FlushOutcome, MessageId};
use crate::time::CycleInstant;

/// Identifier assigned to each recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Why the publish step did not enqueue a message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The barrier released without `transport_ready`.
    TransportUnavailable,
    /// Acquisition finished without a single reading.
    NoData,
    /// The result did not fit the payload buffer.
    EncodeFailed,
    /// The delivery queue refused the message.
    QueueRejected,
}

impl SkipReason {
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            SkipReason::TransportUnavailable => 0,
            SkipReason::NoData => 1,
            SkipReason::EncodeFailed => 2,
            SkipReason::QueueRejected => 3,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u16) -> Option<Self> {
        match code {
            0 => Some(SkipReason::TransportUnavailable),
            1 => Some(SkipReason::NoData),
            2 => Some(SkipReason::EncodeFailed),
            3 => Some(SkipReason::QueueRejected),
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::TransportUnavailable => "transport-unavailable",
            SkipReason::NoData => "no-data",
            SkipReason::EncodeFailed => "encode-failed",
            SkipReason::QueueRejected => "queue-rejected",
        })
    }
}

/// Discriminated telemetry events emitted during a wake cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    CycleStarted,
    SourceAttemptFailed(SourceId),
    SourceReady(SourceId),
    AcquisitionFinished(AcquisitionStatus),
    TransportConnected,
    TransportDisconnected,
    /// The transport refused the connect request outright.
    ConnectRefused,
    BarrierReleased,
    PublishSkipped(SkipReason),
    MessageQueued,
    MessageSent,
    MessageAcked,
    FlushFinished,
    SleepEntered,
    Custom(u16),
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::CycleStarted => f.write_str("cycle-started"),
            TelemetryEventKind::SourceAttemptFailed(id) => write!(f, "attempt-failed {id}"),
            TelemetryEventKind::SourceReady(id) => write!(f, "source-ready {id}"),
            TelemetryEventKind::AcquisitionFinished(status) => {
                write!(f, "acquisition-finished {status}")
            }
            TelemetryEventKind::TransportConnected => f.write_str("transport-connected"),
            TelemetryEventKind::TransportDisconnected => f.write_str("transport-disconnected"),
            TelemetryEventKind::ConnectRefused => f.write_str("connect-refused"),
            TelemetryEventKind::BarrierReleased => f.write_str("barrier-released"),
            TelemetryEventKind::PublishSkipped(reason) => write!(f, "publish-skipped {reason}"),
            TelemetryEventKind::MessageQueued => f.write_str("message-queued"),
            TelemetryEventKind::MessageSent => f.write_str("message-sent"),
            TelemetryEventKind::MessageAcked => f.write_str("message-acked"),
            TelemetryEventKind::FlushFinished => f.write_str("flush-finished"),
            TelemetryEventKind::SleepEntered => f.write_str("sleep-entered"),
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl TelemetryEventKind {
    const CYCLE_STARTED_CODE: u16 = 0x0001;
    const TRANSPORT_CONNECTED_CODE: u16 = 0x0002;
    const TRANSPORT_DISCONNECTED_CODE: u16 = 0x0003;
    const BARRIER_RELEASED_CODE: u16 = 0x0004;
    const MESSAGE_QUEUED_CODE: u16 = 0x0005;
    const MESSAGE_SENT_CODE: u16 = 0x0006;
    const MESSAGE_ACKED_CODE: u16 = 0x0007;
    const FLUSH_FINISHED_CODE: u16 = 0x0008;
    const SLEEP_ENTERED_CODE: u16 = 0x0009;
    const CONNECT_REFUSED_CODE: u16 = 0x000A;
    const ATTEMPT_FAILED_BASE: u16 = 0x0010;
    const SOURCE_READY_BASE: u16 = 0x0020;
    const ACQUISITION_BASE: u16 = 0x0030;
    const SKIPPED_BASE: u16 = 0x0040;
    const BLOCK: u16 = 0x0010;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::CycleStarted => Self::CYCLE_STARTED_CODE,
            TelemetryEventKind::SourceAttemptFailed(id) => {
                Self::ATTEMPT_FAILED_BASE + id.as_u8() as u16
            }
            TelemetryEventKind::SourceReady(id) => Self::SOURCE_READY_BASE + id.as_u8() as u16,
            TelemetryEventKind::AcquisitionFinished(status) => {
                Self::ACQUISITION_BASE + status.to_raw() as u16
            }
            TelemetryEventKind::TransportConnected => Self::TRANSPORT_CONNECTED_CODE,
            TelemetryEventKind::TransportDisconnected => Self::TRANSPORT_DISCONNECTED_CODE,
            TelemetryEventKind::ConnectRefused => Self::CONNECT_REFUSED_CODE,
            TelemetryEventKind::BarrierReleased => Self::BARRIER_RELEASED_CODE,
            TelemetryEventKind::PublishSkipped(reason) => Self::SKIPPED_BASE + reason.to_raw(),
            TelemetryEventKind::MessageQueued => Self::MESSAGE_QUEUED_CODE,
            TelemetryEventKind::MessageSent => Self::MESSAGE_SENT_CODE,
            TelemetryEventKind::MessageAcked => Self::MESSAGE_ACKED_CODE,
            TelemetryEventKind::FlushFinished => Self::FLUSH_FINISHED_CODE,
            TelemetryEventKind::SleepEntered => Self::SLEEP_ENTERED_CODE,
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::CYCLE_STARTED_CODE => TelemetryEventKind::CycleStarted,
            Self::TRANSPORT_CONNECTED_CODE => TelemetryEventKind::TransportConnected,
            Self::TRANSPORT_DISCONNECTED_CODE => TelemetryEventKind::TransportDisconnected,
            Self::CONNECT_REFUSED_CODE => TelemetryEventKind::ConnectRefused,
            Self::BARRIER_RELEASED_CODE => TelemetryEventKind::BarrierReleased,
            Self::MESSAGE_QUEUED_CODE => TelemetryEventKind::MessageQueued,
            Self::MESSAGE_SENT_CODE => TelemetryEventKind::MessageSent,
            Self::MESSAGE_ACKED_CODE => TelemetryEventKind::MessageAcked,
            Self::FLUSH_FINISHED_CODE => TelemetryEventKind::FlushFinished,
            Self::SLEEP_ENTERED_CODE => TelemetryEventKind::SleepEntered,
            value if Self::in_block(value, Self::ATTEMPT_FAILED_BASE) => {
                source_from_offset(value - Self::ATTEMPT_FAILED_BASE)
                    .map_or(TelemetryEventKind::Custom(value), |id| {
                        TelemetryEventKind::SourceAttemptFailed(id)
                    })
            }
            value if Self::in_block(value, Self::SOURCE_READY_BASE) => {
                source_from_offset(value - Self::SOURCE_READY_BASE)
                    .map_or(TelemetryEventKind::Custom(value), TelemetryEventKind::SourceReady)
            }
            value if Self::in_block(value, Self::ACQUISITION_BASE) => {
                u8::try_from(value - Self::ACQUISITION_BASE)
                    .ok()
                    .and_then(AcquisitionStatus::from_raw)
                    .map_or(TelemetryEventKind::Custom(value), |status| {
                        TelemetryEventKind::AcquisitionFinished(status)
                    })
            }
            value if Self::in_block(value, Self::SKIPPED_BASE) => {
                SkipReason::from_raw(value - Self::SKIPPED_BASE)
                    .map_or(TelemetryEventKind::Custom(value), |reason| {
                        TelemetryEventKind::PublishSkipped(reason)
                    })
            }
            other => TelemetryEventKind::Custom(other),
        }
    }

    const fn in_block(value: u16, base: u16) -> bool {
        value >= base && value < base + Self::BLOCK
    }
}

fn source_from_offset(offset: u16) -> Option<SourceId> {
    u8::try_from(offset)
        .ok()
        .filter(|index| usize::from(*index) < crate::acquisition::MAX_SOURCES)
        .map(SourceId::new)
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Cycle number at boot or at power-down.
    Cycle(CycleTelemetry),
    /// Attempt bookkeeping for one source.
    Source(SourceTelemetry),
    /// Summary of a finished acquisition run.
    Acquisition(AcquisitionTelemetry),
    /// Bits observed when the barrier released.
    Barrier(BarrierTelemetry),
    /// Delivery queue activity.
    Message(MessageTelemetry),
    /// Flush result.
    Flush(FlushOutcome),
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// Renders the payload as space separated `key=value` pairs; empty for `None`.
impl fmt::Display for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryPayload::None => Ok(()),
            TelemetryPayload::Cycle(details) => {
                write!(f, "cycle={}", details.cycle)?;
                write_millis(f, " sleep", details.sleep_for)
            }
            TelemetryPayload::Source(details) => {
                write!(f, "{} attempts={}", details.source, details.attempts)
            }
            TelemetryPayload::Acquisition(details) => {
                write!(f, "filled={}/{}", details.filled, details.enabled)?;
                write_millis(f, " elapsed", details.elapsed)
            }
            TelemetryPayload::Barrier(details) => {
                write!(f, "observed={}", details.observed)?;
                if details.timed_out {
                    f.write_str(" timed-out")?;
                }
                write_millis(f, " waited", details.waited)
            }
            TelemetryPayload::Message(details) => {
                if let Some(id) = details.id {
                    write!(f, "id={id} ")?;
                }
                write!(f, "depth={}", details.queue_depth)
            }
            TelemetryPayload::Flush(outcome) => write!(f, "{outcome}"),
        }
    }
}

fn write_millis(f: &mut fmt::Formatter<'_>, label: &str, value: Option<Duration>) -> fmt::Result {
    match value {
        Some(value) => write!(f, "{label}={}ms", value.as_millis()),
        None => Ok(()),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CycleTelemetry {
    pub cycle: u32,
    pub sleep_for: Option<Duration>,
}

impl CycleTelemetry {
    #[must_use]
    pub const fn new(cycle: u32, sleep_for: Option<Duration>) -> Self {
        Self { cycle, sleep_for }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceTelemetry {
    pub source: SourceId,
    pub attempts: u16,
}

impl SourceTelemetry {
    #[must_use]
    pub const fn new(source: SourceId, attempts: u16) -> Self {
        Self { source, attempts }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AcquisitionTelemetry {
    pub filled: u8,
    pub enabled: u8,
    pub elapsed: Option<Duration>,
}

impl AcquisitionTelemetry {
    #[must_use]
    pub fn new(filled: usize, enabled: usize, elapsed: Option<Duration>) -> Self {
        Self {
            filled: truncate_count(filled),
            enabled: truncate_count(enabled),
            elapsed,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarrierTelemetry {
    pub observed: BarrierBits,
    pub timed_out: bool,
    pub waited: Option<Duration>,
}

impl BarrierTelemetry {
    #[must_use]
    pub const fn new(observed: BarrierBits, timed_out: bool, waited: Option<Duration>) -> Self {
        Self {
            observed,
            timed_out,
            waited,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageTelemetry {
    pub id: Option<MessageId>,
    pub queue_depth: u8,
}

impl MessageTelemetry {
    #[must_use]
    pub fn new(id: Option<MessageId>, queue_depth: usize) -> Self {
        Self {
            id,
            queue_depth: truncate_count(queue_depth),
        }
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: CycleInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Records newer than `cursor`, oldest first. Pass the last id already
    /// consumed, or `None` to read everything still retained.
    pub fn since(
        &self,
        cursor: Option<EventId>,
    ) -> impl Iterator<Item = &TelemetryRecord<TInstant>> + '_ {
        self.ring
            .oldest_ordered()
            .filter(move |record| cursor.is_none_or(|last| record.id > last))
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Counts retained records matching `event`.
    pub fn count(&self, event: TelemetryEventKind) -> usize {
        self.ring
            .oldest_ordered()
            .filter(|record| record.event == event)
            .count()
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: CycleInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_count(count: usize) -> u8 {
    u8::try_from(count).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MicrosInstant;

    #[test]
    fn event_codes_decode_back() {
        let fixtures = [
            TelemetryEventKind::CycleStarted,
            TelemetryEventKind::SourceAttemptFailed(SourceId::new(2)),
            TelemetryEventKind::SourceReady(SourceId::new(0)),
            TelemetryEventKind::AcquisitionFinished(AcquisitionStatus::Timeout),
            TelemetryEventKind::PublishSkipped(SkipReason::NoData),
            TelemetryEventKind::ConnectRefused,
            TelemetryEventKind::SleepEntered,
        ];

        for event in fixtures {
            assert_eq!(TelemetryEventKind::from_raw(event.to_raw()), event);
        }
    }

    #[test]
    fn unknown_codes_fall_back_to_custom() {
        assert_eq!(
            TelemetryEventKind::from_raw(0x001F),
            TelemetryEventKind::Custom(0x001F)
        );
        assert_eq!(
            TelemetryEventKind::from_raw(0x0100),
            TelemetryEventKind::Custom(0x0100)
        );
    }

    #[test]
    fn ring_keeps_latest_records_in_order() {
        let mut recorder = TelemetryRecorder::<MicrosInstant, 2>::new();
        recorder.record(
            TelemetryEventKind::CycleStarted,
            TelemetryPayload::Cycle(CycleTelemetry::new(7, None)),
            MicrosInstant::ZERO,
        );
        let second = recorder.record(
            TelemetryEventKind::TransportConnected,
            TelemetryPayload::none(),
            MicrosInstant::from_millis(5),
        );
        recorder.record(
            TelemetryEventKind::BarrierReleased,
            TelemetryPayload::none(),
            MicrosInstant::from_millis(9),
        );

        let events: heapless::Vec<_, 2> = recorder
            .oldest_first()
            .map(|record| record.event)
            .collect();
        assert_eq!(
            events.as_slice(),
            &[
                TelemetryEventKind::TransportConnected,
                TelemetryEventKind::BarrierReleased
            ]
        );

        let unread: heapless::Vec<_, 2> = recorder
            .since(Some(second))
            .map(|record| record.id)
            .collect();
        assert_eq!(unread.as_slice(), &[second + 1]);
    }

    #[test]
    fn display_uses_kebab_case() {
        let mut text = heapless::String::<32>::new();
        fmt::write(
            &mut text,
            format_args!(
                "{}",
                TelemetryEventKind::PublishSkipped(SkipReason::TransportUnavailable)
            ),
        )
        .expect("fits");
        assert_eq!(text.as_str(), "publish-skipped transport-unavailable");
    }

    #[test]
    fn payload_renders_key_value_pairs() {
        let mut text = heapless::String::<64>::new();
        let payload = TelemetryPayload::Barrier(BarrierTelemetry::new(
            BarrierBits::ACQUISITION_DONE,
            true,
            Some(Duration::from_secs(10)),
        ));
        fmt::write(&mut text, format_args!("{payload}")).expect("fits");
        assert_eq!(
            text.as_str(),
            "observed={acquisition_done} timed-out waited=10000ms"
        );

        text.clear();
        fmt::write(&mut text, format_args!("{}", TelemetryPayload::none())).expect("fits");
        assert!(text.is_empty());
    }
}
