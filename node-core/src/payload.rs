//! Serialization of an acquisition result into the published document.
//!
//! The document is a flat JSON object: one key per reading field with two
//! fixed decimals, the cycle number, and a `partial` flag when the run did not
//! complete normally. Field names and labels are static identifiers, so no
//! string escaping is performed.

use core::fmt::{self, Write};

use heapless::String;

use crate::aggregator::{AcquisitionResult, AcquisitionStatus};
use crate::delivery::PAYLOAD_CAPACITY;

/// Buffer the encoder writes into.
pub type PayloadBuffer = String<PAYLOAD_CAPACITY>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PayloadError {
    /// The document did not fit the payload buffer.
    Overflow,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Overflow => f.write_str("payload buffer overflow"),
        }
    }
}

impl From<fmt::Error> for PayloadError {
    fn from(_: fmt::Error) -> Self {
        PayloadError::Overflow
    }
}

/// Turns an acquisition result into a message payload.
pub trait PayloadEncoder {
    fn encode(
        &self,
        cycle: u32,
        result: &AcquisitionResult,
        out: &mut PayloadBuffer,
    ) -> Result<(), PayloadError>;
}

/// Flat JSON document with `%.2f` style numbers.
#[derive(Copy, Clone, Debug, Default)]
pub struct JsonPayloadEncoder;

impl PayloadEncoder for JsonPayloadEncoder {
    fn encode(
        &self,
        cycle: u32,
        result: &AcquisitionResult,
        out: &mut PayloadBuffer,
    ) -> Result<(), PayloadError> {
        out.clear();
        let prefixed = result.enabled_count() > 1;

        out.write_char('{')?;
        for (label, reading) in result.readings() {
            for field in reading.fields() {
                if prefixed {
                    write!(out, "\"{label}_{}\":", field.name)?;
                } else {
                    write!(out, "\"{}\":", field.name)?;
                }
                if field.value.is_finite() {
                    write!(out, "{:.2},", field.value)?;
                } else {
                    out.write_str("null,")?;
                }
            }
        }
        write!(out, "\"cycle\":{cycle}")?;
        if result.status() != AcquisitionStatus::Ok {
            out.write_str(",\"partial\":true")?;
        }
        out.write_char('}')?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{DEFAULT_RETRY_INTERVAL, Reading, SensorDriver};
    use crate::aggregator::AcquisitionAggregator;
    use crate::scheduler::{Dispatch, Timers};
    use crate::telemetry::TelemetryRecorder;
    use crate::time::MicrosInstant;
    use core::time::Duration;

    struct Fixed(Option<Reading>);

    impl SensorDriver for Fixed {
        type Error = ();

        fn read(&mut self) -> Result<Reading, ()> {
            self.0.clone().ok_or(())
        }
    }

    fn acquire(sources: &[(&'static str, Option<Reading>)], stop: bool) -> AcquisitionResult {
        let mut timers = Timers::new();
        let mut telemetry = TelemetryRecorder::new();
        let mut aggregator = AcquisitionAggregator::new(DEFAULT_RETRY_INTERVAL);
        for (label, reading) in sources {
            aggregator
                .add_source(*label, Fixed(reading.clone()), true)
                .expect("add");
        }
        let mut cx = Dispatch::new(MicrosInstant::ZERO, &mut timers, &mut telemetry);
        match aggregator.start(Duration::from_secs(5), &mut cx).expect("start") {
            Some(result) => result,
            None if stop => aggregator.stop(&mut cx).expect("stopped"),
            None => panic!("expected immediate completion"),
        }
    }

    fn bme280() -> Reading {
        Reading::new()
            .with("temperature", 21.456)
            .with("humidity", 40.0)
            .with("pressure", 1013.25)
    }

    #[test]
    fn single_source_uses_plain_keys() {
        let result = acquire(&[("bme280", Some(bme280()))], false);
        let mut out = PayloadBuffer::new();
        JsonPayloadEncoder.encode(7, &result, &mut out).expect("encode");
        assert_eq!(
            out.as_str(),
            "{\"temperature\":21.46,\"humidity\":40.00,\"pressure\":1013.25,\"cycle\":7}"
        );
    }

    #[test]
    fn partial_results_are_flagged_and_prefixed() {
        let result = acquire(
            &[
                ("indoor", Some(Reading::new().with("temperature", f32::NAN))),
                ("outdoor", None),
            ],
            true,
        );
        let mut out = PayloadBuffer::new();
        JsonPayloadEncoder.encode(3, &result, &mut out).expect("encode");
        assert_eq!(
            out.as_str(),
            "{\"indoor_temperature\":null,\"cycle\":3,\"partial\":true}"
        );
    }
}
