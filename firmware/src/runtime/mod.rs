use core::fmt;

use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::i2c::{Config as I2cConfig, I2c};
use embassy_stm32::rcc::LsConfig;
use embassy_stm32::rtc::{Rtc, RtcConfig};
use embassy_time::Delay;
use node_core::cycle::CycleError;

use crate::hw::power;
use crate::link::LinkChannels;
use crate::sensor::Bme280Source;
use crate::shutdown::TaskShutdown;
use crate::status::StatusLed;

mod cycle_task;
mod link_task;
mod status_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) static LINK: LinkChannels = LinkChannels::new();
pub(super) static STATUS: StatusLed = StatusLed::new();
static LINK_SHUTDOWN: TaskShutdown = TaskShutdown::new();
static STATUS_SHUTDOWN: TaskShutdown = TaskShutdown::new();

/// Failures that leave the node unable to run a cycle; the device restarts.
#[derive(Copy, Clone, Debug)]
pub(super) enum InitError {
    Uart,
    Cycle(CycleError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Uart => f.write_str("link UART failed to start"),
            InitError::Cycle(err) => write!(f, "wake cycle aborted: {err}"),
        }
    }
}

pub(super) fn fatal(err: InitError) -> ! {
    defmt::error!("fatal: {}; restarting", defmt::Display2Format(&err));
    power::restart()
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let mut config = hal::Config::default();
    // LSI keeps the RTC wakeup timer running through Standby.
    config.rcc.ls = LsConfig::default_lsi();
    let hal::Peripherals {
        PA5,
        PB0,
        PB1,
        PB6,
        PB7,
        I2C1,
        RTC,
        USART5,
        ..
    } = hal::init(config);

    spawner
        .spawn(status_task::run(
            &STATUS,
            &STATUS_SHUTDOWN,
            Output::new(PA5, Level::Low, Speed::Low),
        ))
        .expect("failed to spawn status task");

    spawner
        .spawn(link_task::run(&LINK, &LINK_SHUTDOWN, USART5, PB0, PB1))
        .expect("failed to spawn link task");

    let rtc = Rtc::new(RTC, RtcConfig::default());
    let i2c = I2c::new_blocking(I2C1, PB6, PB7, I2cConfig::default());
    let sensor = Bme280Source::new(i2c, Delay);

    match cycle_task::run(sensor, &LINK, &STATUS).await {
        Ok(request) => {
            // The sensor and its I2C bus were dropped with the cycle; stop
            // the remaining tasks so their peripherals are released too.
            LINK_SHUTDOWN.stop().await;
            STATUS_SHUTDOWN.stop().await;
            power::enter_low_power(rtc, request.duration)
        }
        Err(err) => fatal(InitError::Cycle(err)),
    }
}
