//! Connection-gated outbound queue for the single telemetry channel.
//!
//! Messages leave strictly in enqueue order with at most one in flight. The
//! head stays queued until the transport acknowledges it; a disconnect simply
//! forgets the in-flight marker so the head is resent once the link returns.

use core::{fmt, time::Duration};

use heapless::{Deque, String};

use crate::scheduler::{Dispatch, SchedulerError, TimerHandle, TimerKey};
use crate::telemetry::{MessageTelemetry, TelemetryEventKind, TelemetryPayload};
use crate::time::CycleInstant;

pub const TOPIC_CAPACITY: usize = 64;
pub const PAYLOAD_CAPACITY: usize = 256;
pub const QUEUE_DEPTH: usize = 4;

/// Transport-assigned identifier used to match acknowledgements.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u16);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable topic/payload pair owned by the queue until acknowledged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundMessage {
    topic: String<TOPIC_CAPACITY>,
    payload: String<PAYLOAD_CAPACITY>,
}

impl OutboundMessage {
    pub fn new(topic: &str, payload: &str) -> Result<Self, EnqueueError> {
        let topic = String::try_from(topic).map_err(|_| EnqueueError::TopicTooLong)?;
        let payload = String::try_from(payload).map_err(|_| EnqueueError::PayloadTooLarge)?;
        Ok(Self { topic, payload })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Transport client consumed by the queue.
///
/// Connection state changes and acknowledgements arrive asynchronously and are
/// fed back through [`DeliveryQueue::on_transport_connected`],
/// [`DeliveryQueue::on_transport_disconnected`], and [`DeliveryQueue::on_ack`].
pub trait Transport {
    type Error: fmt::Debug;

    /// Requests a connection; completion is notified later.
    fn connect(&mut self) -> Result<(), Self::Error>;

    /// Drops the connection without waiting for a notification.
    fn disconnect(&mut self);

    /// Hands one message to the transport and returns the id its ack will carry.
    fn publish(&mut self, topic: &str, payload: &str) -> Result<MessageId, Self::Error>;
}

impl<T> Transport for &mut T
where
    T: Transport,
{
    type Error = T::Error;

    fn connect(&mut self) -> Result<(), Self::Error> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<MessageId, Self::Error> {
        (**self).publish(topic, payload)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueError {
    QueueFull,
    TopicTooLong,
    PayloadTooLarge,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnqueueError::QueueFull => "delivery queue full",
            EnqueueError::TopicTooLong => "topic too long",
            EnqueueError::PayloadTooLarge => "payload too large",
        })
    }
}

/// Result of a bounded flush.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Every message was acknowledged.
    Drained,
    /// The deadline passed with messages still queued.
    TimedOut { remaining: u8 },
}

impl fmt::Display for FlushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushOutcome::Drained => f.write_str("drained"),
            FlushOutcome::TimedOut { remaining } => write!(f, "timed out ({remaining} left)"),
        }
    }
}

/// FIFO of outbound messages bound to one transport for one wake cycle.
pub struct DeliveryQueue<T, const DEPTH: usize = QUEUE_DEPTH> {
    transport: T,
    queue: Deque<OutboundMessage, DEPTH>,
    connected: bool,
    in_flight: Option<MessageId>,
    flush: Option<TimerHandle>,
}

impl<T, const DEPTH: usize> DeliveryQueue<T, DEPTH>
where
    T: Transport,
{
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            queue: Deque::new(),
            connected: false,
            in_flight: None,
            flush: None,
        }
    }

    /// Asks the transport to connect. State changes arrive as notifications.
    pub fn connect(&mut self) -> Result<(), T::Error> {
        self.transport.connect()
    }

    /// Drops the link at the end of the cycle. Queued messages are discarded.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connected = false;
        self.in_flight = None;
        self.queue.clear();
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn in_flight(&self) -> Option<MessageId> {
        self.in_flight
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` while a flush deadline is armed.
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        self.flush.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Appends a message and sends it right away when the link is idle.
    pub fn enqueue<I>(
        &mut self,
        message: OutboundMessage,
        cx: &mut Dispatch<'_, I>,
    ) -> Result<(), EnqueueError>
    where
        I: CycleInstant,
    {
        self.queue
            .push_back(message)
            .map_err(|_| EnqueueError::QueueFull)?;
        cx.telemetry.record(
            TelemetryEventKind::MessageQueued,
            TelemetryPayload::Message(MessageTelemetry::new(None, self.queue.len())),
            cx.now,
        );
        self.pump(cx);
        Ok(())
    }

    pub fn on_transport_connected<I>(&mut self, cx: &mut Dispatch<'_, I>)
    where
        I: CycleInstant,
    {
        if !self.connected {
            self.connected = true;
            cx.telemetry.record(
                TelemetryEventKind::TransportConnected,
                TelemetryPayload::none(),
                cx.now,
            );
        }
        self.pump(cx);
    }

    /// Clears the connected flag and forgets the in-flight marker. The head
    /// stays queued and is resent after the next connect notification.
    pub fn on_transport_disconnected<I>(&mut self, cx: &mut Dispatch<'_, I>)
    where
        I: CycleInstant,
    {
        self.in_flight = None;
        if self.connected {
            self.connected = false;
            cx.telemetry.record(
                TelemetryEventKind::TransportDisconnected,
                TelemetryPayload::Message(MessageTelemetry::new(None, self.queue.len())),
                cx.now,
            );
        }
    }

    /// Pops the acknowledged head and sends the next one.
    ///
    /// Acks that do not match the in-flight message are ignored. Returns the
    /// flush outcome when this ack drained the queue during a flush.
    pub fn on_ack<I>(&mut self, id: MessageId, cx: &mut Dispatch<'_, I>) -> Option<FlushOutcome>
    where
        I: CycleInstant,
    {
        if self.in_flight != Some(id) {
            return None;
        }

        self.in_flight = None;
        self.queue.pop_front();
        cx.telemetry.record(
            TelemetryEventKind::MessageAcked,
            TelemetryPayload::Message(MessageTelemetry::new(Some(id), self.queue.len())),
            cx.now,
        );
        self.pump(cx);

        if self.queue.is_empty() {
            self.finish_flush(FlushOutcome::Drained, cx)
        } else {
            None
        }
    }

    /// Starts a bounded wait for the queue to drain.
    ///
    /// An empty queue succeeds immediately; otherwise the outcome arrives from
    /// [`DeliveryQueue::on_ack`] or [`DeliveryQueue::on_flush_deadline`].
    pub fn begin_flush<I>(
        &mut self,
        timeout: Duration,
        cx: &mut Dispatch<'_, I>,
    ) -> Result<Option<FlushOutcome>, SchedulerError>
    where
        I: CycleInstant,
    {
        if self.queue.is_empty() {
            cx.telemetry.record(
                TelemetryEventKind::FlushFinished,
                TelemetryPayload::Flush(FlushOutcome::Drained),
                cx.now,
            );
            return Ok(Some(FlushOutcome::Drained));
        }
        if self.flush.is_none() {
            self.flush = Some(cx.schedule_after(timeout, TimerKey::FlushDeadline)?);
        }
        Ok(None)
    }

    /// Handles an expired [`TimerKey::FlushDeadline`].
    pub fn on_flush_deadline<I>(
        &mut self,
        handle: TimerHandle,
        cx: &mut Dispatch<'_, I>,
    ) -> Option<FlushOutcome>
    where
        I: CycleInstant,
    {
        if self.flush != Some(handle) {
            return None;
        }
        let remaining = u8::try_from(self.queue.len()).unwrap_or(u8::MAX);
        self.finish_flush(FlushOutcome::TimedOut { remaining }, cx)
    }

    fn finish_flush<I>(
        &mut self,
        outcome: FlushOutcome,
        cx: &mut Dispatch<'_, I>,
    ) -> Option<FlushOutcome>
    where
        I: CycleInstant,
    {
        let handle = self.flush.take()?;
        cx.timers.cancel(handle);
        cx.telemetry.record(
            TelemetryEventKind::FlushFinished,
            TelemetryPayload::Flush(outcome),
            cx.now,
        );
        Some(outcome)
    }

    fn pump<I>(&mut self, cx: &mut Dispatch<'_, I>)
    where
        I: CycleInstant,
    {
        if !self.connected || self.in_flight.is_some() {
            return;
        }
        let Some(head) = self.queue.front() else {
            return;
        };

        match self.transport.publish(head.topic(), head.payload()) {
            Ok(id) => {
                self.in_flight = Some(id);
                cx.telemetry.record(
                    TelemetryEventKind::MessageSent,
                    TelemetryPayload::Message(MessageTelemetry::new(Some(id), self.queue.len())),
                    cx.now,
                );
            }
            // A rejected publish means the link is gone; the head waits for
            // the next connect notification.
            Err(_) => self.on_transport_disconnected(cx),
        }
    }
}
