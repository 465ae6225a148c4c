#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Power-down primitive.
//!
//! The node spends the sleep interval in Standby: the core, clocks and
//! peripherals are off, SRAM is kept (so the retained counter survives) and the
//! RTC wakeup timer, clocked from LSI, restarts the device through reset. The
//! runtime stops the link and status tasks and drops the I2C bus before
//! calling [`enter_low_power`], so no peripheral is still running when the core
//! executes `WFI`.

use core::time::Duration;

/// RTC wakeup clock selection (`RTC_CR.WUCKSEL`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeupClock {
    /// `ck_spre` (1 Hz): the timer fires after `reload + 1` seconds.
    Seconds,
    /// `ck_spre` with 2^16 added to the reload value.
    SecondsExtended,
}

impl WakeupClock {
    const fn wucksel(self) -> u32 {
        match self {
            WakeupClock::Seconds => 0b100,
            WakeupClock::SecondsExtended => 0b110,
        }
    }
}

const EXTENDED_OFFSET: u64 = 1 << 16;
const MAX_WAKEUP_SECS: u64 = EXTENDED_OFFSET * 2;

/// Wakeup timer settings for `duration`, rounded up to whole seconds and
/// clamped to the 1 s ..= ~36 h range the RTC can express.
pub fn wakeup_reload(duration: Duration) -> (WakeupClock, u16) {
    let mut secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    let ticks = secs.clamp(1, MAX_WAKEUP_SECS);
    if ticks <= EXTENDED_OFFSET {
        (WakeupClock::Seconds, narrow(ticks - 1))
    } else {
        (WakeupClock::SecondsExtended, narrow(ticks - 1 - EXTENDED_OFFSET))
    }
}

fn narrow(value: u64) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[cfg(target_os = "none")]
pub use target::{enter_low_power, restart};

#[cfg(target_os = "none")]
mod target {
    use core::time::Duration;

    use cortex_m::peripheral::{NVIC, SCB};
    use embassy_stm32::pac;
    use embassy_stm32::rtc::Rtc;

    use super::wakeup_reload;

    const RTC_KEY_1: u32 = 0xCA;
    const RTC_KEY_2: u32 = 0x53;
    const RTC_KEY_LOCK: u32 = 0xFF;
    const RTC_CR_WUCKSEL: u32 = 0b111;
    const RTC_CR_WUTE: u32 = 1 << 10;
    const RTC_CR_WUTIE: u32 = 1 << 14;
    const RTC_ICSR_WUTWF: u32 = 1 << 2;
    const RTC_SCR_CWUTF: u32 = 1 << 2;

    const PWR_CR1_LPMS: u32 = 0b111;
    const PWR_LPMS_STANDBY: u32 = 0b011;
    const PWR_CR3_RRS: u32 = 1 << 8;
    const PWR_CR3_EIWUL: u32 = 1 << 15;
    const PWR_SCR_CLEAR_ALL: u32 = 0x13F;

    /// Arms the RTC wakeup timer for `duration` and enters Standby. The next
    /// wake starts from reset; this never returns.
    ///
    /// Taking the [`Rtc`] guarantees its clock and prescalers are configured.
    pub fn enter_low_power(_rtc: Rtc, duration: Duration) -> ! {
        arm_wakeup(duration);

        cortex_m::interrupt::disable();
        mask_interrupts();

        pac::PWR.cr3().modify(|w| w.0 |= PWR_CR3_RRS | PWR_CR3_EIWUL);
        pac::PWR.scr().write(|w| w.0 = PWR_SCR_CLEAR_ALL);
        pac::PWR
            .cr1()
            .modify(|w| w.0 = (w.0 & !PWR_CR1_LPMS) | PWR_LPMS_STANDBY);

        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
        peripherals.SCB.set_sleepdeep();
        loop {
            cortex_m::asm::dsb();
            cortex_m::asm::wfi();
        }
    }

    /// Resets immediately; used when a persistent subsystem cannot start.
    pub fn restart() -> ! {
        SCB::sys_reset()
    }

    fn arm_wakeup(duration: Duration) {
        let (clock, reload) = wakeup_reload(duration);
        let rtc = pac::RTC;

        rtc.wpr().write(|w| w.0 = RTC_KEY_1);
        rtc.wpr().write(|w| w.0 = RTC_KEY_2);

        rtc.cr().modify(|w| w.0 &= !(RTC_CR_WUTE | RTC_CR_WUTIE));
        while rtc.icsr().read().0 & RTC_ICSR_WUTWF == 0 {}

        rtc.wutr().write(|w| w.0 = u32::from(reload));
        rtc.cr()
            .modify(|w| w.0 = (w.0 & !RTC_CR_WUCKSEL) | clock.wucksel());
        rtc.scr().write(|w| w.0 = RTC_SCR_CWUTF);
        rtc.cr().modify(|w| w.0 |= RTC_CR_WUTE | RTC_CR_WUTIE);

        rtc.wpr().write(|w| w.0 = RTC_KEY_LOCK);
    }

    /// Masks and un-pends every NVIC line so a stale interrupt cannot abort
    /// the Standby entry.
    fn mask_interrupts() {
        let nvic = unsafe { &*NVIC::PTR };
        unsafe {
            nvic.icer[0].write(u32::MAX);
            nvic.icpr[0].write(u32::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_intervals_use_the_one_hertz_clock() {
        assert_eq!(
            wakeup_reload(Duration::from_secs(60)),
            (WakeupClock::Seconds, 59)
        );
        assert_eq!(
            wakeup_reload(Duration::from_millis(1500)),
            (WakeupClock::Seconds, 1)
        );
        assert_eq!(wakeup_reload(Duration::ZERO), (WakeupClock::Seconds, 0));
    }

    #[test]
    fn long_intervals_switch_to_the_extended_range() {
        assert_eq!(
            wakeup_reload(Duration::from_secs(65_536)),
            (WakeupClock::Seconds, u16::MAX)
        );
        assert_eq!(
            wakeup_reload(Duration::from_secs(65_537)),
            (WakeupClock::SecondsExtended, 0)
        );
        assert_eq!(
            wakeup_reload(Duration::from_secs(7 * 24 * 3600)),
            (WakeupClock::SecondsExtended, u16::MAX)
        );
    }
}
