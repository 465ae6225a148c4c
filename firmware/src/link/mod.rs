#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Channels and transport glue for the network coprocessor link.
//!
//! The wake cycle talks to [`LinkTransport`], which encodes each request as
//! one protocol line and hands it to the UART task through a bounded channel.
//! The UART task assembles incoming lines, parses them, and forwards the
//! resulting [`CycleEvent`]s back through a second channel.

use core::fmt;

use embassy_sync::channel::{Channel, Receiver, Sender};
use heapless::{String, Vec};
use node_core::cycle::CycleEvent;
use node_core::delivery::{MessageId, PAYLOAD_CAPACITY, TOPIC_CAPACITY, Transport};
use node_core::link::{LinkCommand, LinkEvent};

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;

#[cfg(target_os = "none")]
type LinkMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type LinkMutex = NoopRawMutex;

/// Longest line exchanged on the link: `PUB <id> <topic> <payload>\n`.
pub const LINK_LINE_CAPACITY: usize = 16 + TOPIC_CAPACITY + PAYLOAD_CAPACITY;

/// Depth of the outbound command channel.
pub const COMMAND_QUEUE_DEPTH: usize = 4;

/// Depth of the inbound event channel.
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// One encoded protocol line.
pub type LinkLine = String<LINK_LINE_CAPACITY>;

pub type CommandSender<'a> = Sender<'a, LinkMutex, LinkLine, COMMAND_QUEUE_DEPTH>;
pub type CommandReceiver<'a> = Receiver<'a, LinkMutex, LinkLine, COMMAND_QUEUE_DEPTH>;
pub type EventSender<'a> = Sender<'a, LinkMutex, CycleEvent, EVENT_QUEUE_DEPTH>;
pub type EventReceiver<'a> = Receiver<'a, LinkMutex, CycleEvent, EVENT_QUEUE_DEPTH>;

/// Bundles both link directions so tasks can share a single instance.
pub struct LinkChannels {
    commands: Channel<LinkMutex, LinkLine, COMMAND_QUEUE_DEPTH>,
    events: Channel<LinkMutex, CycleEvent, EVENT_QUEUE_DEPTH>,
}

impl LinkChannels {
    pub const fn new() -> Self {
        Self {
            commands: Channel::new(),
            events: Channel::new(),
        }
    }

    pub fn command_sender(&self) -> CommandSender<'_> {
        self.commands.sender()
    }

    pub fn command_receiver(&self) -> CommandReceiver<'_> {
        self.commands.receiver()
    }

    pub fn event_sender(&self) -> EventSender<'_> {
        self.events.sender()
    }

    pub fn event_receiver(&self) -> EventReceiver<'_> {
        self.events.receiver()
    }
}

/// Reasons a request never reached the UART task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkError {
    /// The command channel is full.
    Busy,
    /// The encoded line does not fit a [`LinkLine`].
    Encode,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkError::Busy => "link command queue full",
            LinkError::Encode => "link line overflow",
        })
    }
}

/// [`Transport`] backed by the coprocessor link.
pub struct LinkTransport<'a> {
    commands: CommandSender<'a>,
    next_id: u16,
}

impl<'a> LinkTransport<'a> {
    pub fn new(commands: CommandSender<'a>) -> Self {
        Self {
            commands,
            next_id: 0,
        }
    }

    fn send(&self, command: &LinkCommand<'_>) -> Result<(), LinkError> {
        let mut line = LinkLine::new();
        command.encode(&mut line).map_err(|_| LinkError::Encode)?;
        self.commands.try_send(line).map_err(|_| LinkError::Busy)
    }

    fn allocate_id(&mut self) -> MessageId {
        // Zero is never handed out so a reset coprocessor cannot ack a stale id.
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        MessageId(self.next_id)
    }
}

impl Transport for LinkTransport<'_> {
    type Error = LinkError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        self.send(&LinkCommand::Connect)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.send(&LinkCommand::Disconnect) {
            log_dropped_command("DISCONNECT", err);
        }
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<MessageId, Self::Error> {
        let id = self.allocate_id();
        self.send(&LinkCommand::Publish { id, topic, payload })?;
        Ok(id)
    }
}

/// Maps a parsed link event onto the cycle's transport notifications.
pub fn cycle_event(event: LinkEvent<'_>) -> Option<CycleEvent> {
    match event {
        LinkEvent::Connected => Some(CycleEvent::TransportConnected),
        LinkEvent::Disconnected => Some(CycleEvent::TransportDisconnected),
        LinkEvent::PubAck(id) => Some(CycleEvent::PublishAcked(id)),
        LinkEvent::Error(_) => None,
    }
}

/// Splits a byte stream into newline-terminated lines.
pub struct LineAssembler {
    buffer: Vec<u8, LINK_LINE_CAPACITY>,
    overflowed: bool,
    complete: bool,
}

/// Outcome of feeding one byte to a [`LineAssembler`].
#[derive(Debug, Eq, PartialEq)]
pub enum Assembled<'a> {
    Pending,
    Line(&'a str),
    /// The line exceeded the buffer or was not UTF-8 and was discarded.
    Dropped,
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
            complete: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> Assembled<'_> {
        if self.complete {
            self.buffer.clear();
            self.complete = false;
        }
        if byte != b'\n' {
            if self.buffer.push(byte).is_err() {
                self.overflowed = true;
            }
            return Assembled::Pending;
        }

        self.complete = true;
        if core::mem::replace(&mut self.overflowed, false) {
            return Assembled::Dropped;
        }
        match core::str::from_utf8(&self.buffer) {
            Ok(line) => Assembled::Line(line),
            Err(_) => Assembled::Dropped,
        }
    }
}

#[cfg(target_os = "none")]
fn log_dropped_command(command: &'static str, err: LinkError) {
    defmt::warn!("link: dropped {} ({})", command, defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
fn log_dropped_command(command: &'static str, err: LinkError) {
    println!("link: dropped {command} ({err})");
}
