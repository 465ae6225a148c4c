#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Mirrors the wake cycle's telemetry ring to defmt / the host console.

use core::fmt;

use node_core::telemetry::{EventId, TelemetryRecord, TelemetryRecorder};

use crate::time::FirmwareInstant;

/// Remembers which records were already logged.
#[derive(Debug, Default)]
pub struct TelemetryLog {
    cursor: Option<EventId>,
}

impl TelemetryLog {
    pub const fn new() -> Self {
        Self { cursor: None }
    }

    /// Logs every record newer than the last call and returns how many were emitted.
    pub fn drain(&mut self, recorder: &TelemetryRecorder<FirmwareInstant>) -> usize {
        let mut emitted = 0;
        for record in recorder.since(self.cursor) {
            emit_log(&RecordLine(record));
            self.cursor = Some(record.id);
            emitted += 1;
        }
        emitted
    }
}

/// `t=<ms>ms <event> <details>` rendering of one record.
pub struct RecordLine<'a>(pub &'a TelemetryRecord<FirmwareInstant>);

impl fmt::Display for RecordLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.0;
        write!(f, "t={}ms {}", record.timestamp.as_millis(), record.event)?;
        let mut details = heapless::String::<96>::new();
        if fmt::write(&mut details, format_args!("{}", record.details)).is_err() {
            return f.write_str(" …");
        }
        if !details.is_empty() {
            write!(f, " {details}")?;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
fn emit_log(line: &RecordLine<'_>) {
    defmt::info!("telemetry {}", defmt::Display2Format(line));
}

#[cfg(not(target_os = "none"))]
fn emit_log(line: &RecordLine<'_>) {
    println!("telemetry {line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Instant;
    use node_core::acquisition::SourceId;
    use node_core::telemetry::{SourceTelemetry, TelemetryEventKind, TelemetryPayload};

    fn at(ms: u64) -> FirmwareInstant {
        FirmwareInstant::from(Instant::from_millis(ms))
    }

    #[test]
    fn drain_only_emits_new_records() {
        let mut recorder: TelemetryRecorder<FirmwareInstant> = TelemetryRecorder::new();
        let mut log = TelemetryLog::new();

        recorder.record(TelemetryEventKind::CycleStarted, TelemetryPayload::none(), at(0));
        recorder.record(TelemetryEventKind::TransportConnected, TelemetryPayload::none(), at(20));
        assert_eq!(log.drain(&recorder), 2);
        assert_eq!(log.drain(&recorder), 0);

        recorder.record(TelemetryEventKind::BarrierReleased, TelemetryPayload::none(), at(25));
        assert_eq!(log.drain(&recorder), 1);
    }

    #[test]
    fn record_line_includes_details() {
        let mut recorder: TelemetryRecorder<FirmwareInstant> = TelemetryRecorder::new();
        recorder.record(
            TelemetryEventKind::SourceAttemptFailed(SourceId::new(0)),
            TelemetryPayload::Source(SourceTelemetry::new(SourceId::new(0), 2)),
            at(100),
        );
        let record = recorder.latest().expect("recorded");

        assert_eq!(
            format!("{}", RecordLine(record)),
            format!("t=100ms {} source0 attempts=2", record.event)
        );
    }
}
