use core::time::Duration;

use embassy_futures::select::{Either, select};
use embassy_time::Timer;
use node_core::acquisition::SensorDriver;
use node_core::aggregator::AcquisitionAggregator;
use node_core::counter::CycleCounter;
use node_core::cycle::{CycleError, SleepRequest, WakeCycle};

use crate::config::CYCLE_CONFIG;
use crate::hw::retained;
use crate::link::{LinkChannels, LinkTransport};
use crate::status::{StatusHandle, StatusLed};
use crate::telemetry::TelemetryLog;
use crate::time::FirmwareInstant;

/// Runs one wake cycle to completion and commits the counter. The sensor
/// driver is dropped before returning.
///
/// Sleeps until the next timer deadline or link event, whichever comes first,
/// and feeds it to the cycle until the cycle is ready to power down.
pub async fn run<D>(
    sensor: D,
    link: &'static LinkChannels,
    status: &'static StatusLed,
) -> Result<SleepRequest, CycleError>
where
    D: SensorDriver,
{
    let mut store = retained::take();
    let counter = CycleCounter::resume(&mut store);
    log_boot_banner(counter.value(), CYCLE_CONFIG.sleep_interval);

    let mut aggregator = AcquisitionAggregator::new(CYCLE_CONFIG.retry_interval);
    aggregator.add_source("bme280", sensor, true)?;

    let mut cycle = WakeCycle::new(
        CYCLE_CONFIG,
        counter,
        aggregator,
        LinkTransport::new(link.command_sender()),
        StatusHandle::new(status),
    )?;
    let events = link.event_receiver();
    let mut log = TelemetryLog::new();

    cycle.boot(FirmwareInstant::now())?;
    while !cycle.is_ready_to_sleep() {
        log.drain(cycle.telemetry());

        let woke = match cycle.next_deadline() {
            Some(deadline) => {
                select(events.receive(), Timer::at(deadline.into_embassy())).await
            }
            None => Either::First(events.receive().await),
        };

        let now = FirmwareInstant::now();
        match woke {
            Either::First(event) => cycle.handle(event, now)?,
            Either::Second(()) => cycle.poll_timers(now)?,
        };
    }

    let request = cycle.enter_sleep(&mut store, FirmwareInstant::now())?;
    log.drain(cycle.telemetry());
    defmt::info!(
        "cycle {} done: {}; next wake {} in {}s",
        request.cycle,
        defmt::Debug2Format(cycle.report()),
        request.next_cycle,
        request.duration.as_secs()
    );
    // Releases the sensor's I2C bus before power-down.
    drop(cycle);
    Ok(request)
}

fn log_boot_banner(cycle: u32, sleep_interval: Duration) {
    defmt::info!(
        "sensor-node boot: cycle={} sleep={}s topic={=str}",
        cycle,
        sleep_interval.as_secs(),
        CYCLE_CONFIG.topic
    );
}
