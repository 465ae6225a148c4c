use embassy_futures::select::select;
use embassy_stm32::gpio::Output;
use embassy_time::Timer;

use crate::shutdown::TaskShutdown;
use crate::status::{StatusLed, blink_step};
use crate::time::to_embassy;

#[embassy_executor::task]
pub async fn run(
    status: &'static StatusLed,
    shutdown: &'static TaskShutdown,
    mut led: Output<'static>,
) -> ! {
    select(blink(status, &mut led), shutdown.requested()).await;
    led.set_low();
    // Dropping the output returns PA5 to analog mode.
    drop(led);
    shutdown.release();
    loop {
        core::future::pending::<()>().await;
    }
}

async fn blink(status: &StatusLed, led: &mut Output<'static>) {
    let mut lit = false;
    loop {
        let state = status.current();
        match blink_step(state, lit) {
            Some((level, hold)) => {
                lit = level;
                drive(led, lit);
                select(status.changed(), Timer::after(to_embassy(hold))).await;
            }
            None => {
                lit = state.steady_level().unwrap_or(false);
                drive(led, lit);
                status.changed().await;
            }
        }
    }
}

fn drive(led: &mut Output<'static>, lit: bool) {
    if lit {
        led.set_high();
    } else {
        led.set_low();
    }
}
