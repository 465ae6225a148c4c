//! Line protocol spoken with the network coprocessor.
//!
//! Commands (node to coprocessor):
//!
//! ```text
//! CONNECT
//! DISCONNECT
//! PUB <id> <topic> <payload>
//! ```
//!
//! Events (coprocessor to node):
//!
//! ```text
//! +CONNECTED
//! +DISCONNECTED
//! +PUBACK <id>
//! +ERROR <text>
//! ```
//!
//! Every line ends with `\n`; a trailing `\r` is tolerated on input.

use core::fmt;

use winnow::ascii::{dec_uint, space1};
use winnow::combinator::{alt, preceded, separated_pair};
use winnow::error::ModalResult;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::delivery::MessageId;

/// Notification received from the coprocessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent<'a> {
    Connected,
    Disconnected,
    PubAck(MessageId),
    Error(&'a str),
}

/// Request sent to the coprocessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkCommand<'a> {
    Connect,
    Disconnect,
    Publish {
        id: MessageId,
        topic: &'a str,
        payload: &'a str,
    },
}

impl LinkCommand<'_> {
    /// Writes the command followed by a newline.
    pub fn encode<W>(&self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        match self {
            LinkCommand::Connect => out.write_str("CONNECT\n"),
            LinkCommand::Disconnect => out.write_str("DISCONNECT\n"),
            LinkCommand::Publish { id, topic, payload } => {
                writeln!(out, "PUB {} {topic} {payload}", id.0)
            }
        }
    }
}

impl LinkEvent<'_> {
    /// Writes the event followed by a newline.
    pub fn encode<W>(&self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        match self {
            LinkEvent::Connected => out.write_str("+CONNECTED\n"),
            LinkEvent::Disconnected => out.write_str("+DISCONNECTED\n"),
            LinkEvent::PubAck(id) => writeln!(out, "+PUBACK {}", id.0),
            LinkEvent::Error(text) => writeln!(out, "+ERROR {text}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkParseError {
    /// Blank line.
    Empty,
    /// No command or event matched.
    Unrecognized,
    /// A known prefix was followed by unexpected text.
    TrailingInput,
}

impl fmt::Display for LinkParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkParseError::Empty => f.write_str("empty line"),
            LinkParseError::Unrecognized => f.write_str("unrecognized line"),
            LinkParseError::TrailingInput => f.write_str("unexpected trailing input"),
        }
    }
}

/// Parses one event line from the coprocessor.
pub fn parse_event(line: &str) -> Result<LinkEvent<'_>, LinkParseError> {
    parse_line(line, event)
}

/// Parses one command line, as the coprocessor (or its simulator) sees it.
pub fn parse_command(line: &str) -> Result<LinkCommand<'_>, LinkParseError> {
    parse_line(line, command)
}

fn parse_line<'i, O>(
    line: &'i str,
    mut parser: impl FnMut(&mut &'i str) -> ModalResult<O, ()>,
) -> Result<O, LinkParseError> {
    let mut input = line.trim_end_matches(['\r', '\n']);
    if input.is_empty() {
        return Err(LinkParseError::Empty);
    }
    let parsed = parser(&mut input).map_err(|_| LinkParseError::Unrecognized)?;
    if input.is_empty() {
        Ok(parsed)
    } else {
        Err(LinkParseError::TrailingInput)
    }
}

fn message_id(input: &mut &str) -> ModalResult<MessageId, ()> {
    dec_uint::<_, u16, _>.map(MessageId).parse_next(input)
}

fn event<'i>(input: &mut &'i str) -> ModalResult<LinkEvent<'i>, ()> {
    alt((
        "+CONNECTED".value(LinkEvent::Connected),
        "+DISCONNECTED".value(LinkEvent::Disconnected),
        preceded(("+PUBACK", space1), message_id).map(LinkEvent::PubAck),
        preceded(("+ERROR", space1), rest).map(LinkEvent::Error),
    ))
    .parse_next(input)
}

fn command<'i>(input: &mut &'i str) -> ModalResult<LinkCommand<'i>, ()> {
    alt((
        "CONNECT".value(LinkCommand::Connect),
        "DISCONNECT".value(LinkCommand::Disconnect),
        preceded(
            ("PUB", space1),
            (
                message_id,
                preceded(
                    space1,
                    separated_pair(take_till(1.., ' '), ' ', rest),
                ),
            ),
        )
        .map(|(id, (topic, payload))| LinkCommand::Publish { id, topic, payload }),
    ))
    .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events() {
        assert_eq!(parse_event("+CONNECTED\r\n"), Ok(LinkEvent::Connected));
        assert_eq!(parse_event("+DISCONNECTED"), Ok(LinkEvent::Disconnected));
        assert_eq!(
            parse_event("+PUBACK 17\n"),
            Ok(LinkEvent::PubAck(MessageId(17)))
        );
        assert_eq!(
            parse_event("+ERROR broker refused"),
            Ok(LinkEvent::Error("broker refused"))
        );
    }

    #[test]
    fn rejects_malformed_events() {
        assert_eq!(parse_event("\r\n"), Err(LinkParseError::Empty));
        assert_eq!(parse_event("+PUBACK x"), Err(LinkParseError::Unrecognized));
        assert_eq!(parse_event("+CONNECTED now"), Err(LinkParseError::TrailingInput));
        assert_eq!(parse_event("+PUBACK 70000"), Err(LinkParseError::Unrecognized));
    }

    #[test]
    fn publish_command_keeps_payload_spaces() {
        let mut line = heapless::String::<96>::new();
        LinkCommand::Publish {
            id: MessageId(3),
            topic: "sensors/node",
            payload: "{\"a\": 1}",
        }
        .encode(&mut line)
        .expect("fits");
        assert_eq!(line.as_str(), "PUB 3 sensors/node {\"a\": 1}\n");

        assert_eq!(
            parse_command(&line),
            Ok(LinkCommand::Publish {
                id: MessageId(3),
                topic: "sensors/node",
                payload: "{\"a\": 1}",
            })
        );
    }

    #[test]
    fn connect_prefix_does_not_swallow_disconnect() {
        assert_eq!(parse_command("DISCONNECT"), Ok(LinkCommand::Disconnect));
        assert_eq!(parse_command("CONNECT\n"), Ok(LinkCommand::Connect));
    }
}
