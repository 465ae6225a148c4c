#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Stop handshake between the power-down path and a long-running task.
//!
//! The task races its work against [`TaskShutdown::requested`], drops the
//! peripherals it owns, then calls [`TaskShutdown::release`]. The power-down
//! path awaits [`TaskShutdown::stop`], so nothing is left driving a pin or
//! holding a bus when the core enters standby.

use embassy_sync::signal::Signal;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;

#[cfg(target_os = "none")]
type ShutdownMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type ShutdownMutex = NoopRawMutex;

pub struct TaskShutdown {
    request: Signal<ShutdownMutex, ()>,
    released: Signal<ShutdownMutex, ()>,
}

impl TaskShutdown {
    pub const fn new() -> Self {
        Self {
            request: Signal::new(),
            released: Signal::new(),
        }
    }

    /// Completes once the power-down path asks the task to stop.
    pub async fn requested(&self) {
        self.request.wait().await;
    }

    /// Called by the task after its peripherals are dropped.
    pub fn release(&self) {
        self.released.signal(());
    }

    /// Asks the task to stop and waits until it has released its resources.
    pub async fn stop(&self) {
        self.request.signal(());
        self.released.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::select;

    struct Peripheral<'a>(&'a Cell<bool>);

    impl Drop for Peripheral<'_> {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn stop_returns_after_the_task_dropped_its_peripheral() {
        let shutdown = TaskShutdown::new();
        let dropped = Cell::new(false);
        let seen_by_stop = Cell::new(false);

        let task = async {
            let uart = Peripheral(&dropped);
            select(core::future::pending::<()>(), shutdown.requested()).await;
            drop(uart);
            shutdown.release();
        };
        let power_down = async {
            shutdown.stop().await;
            seen_by_stop.set(dropped.get());
        };
        block_on(join(task, power_down));

        assert!(dropped.get());
        assert!(seen_by_stop.get());
    }

    #[test]
    fn request_before_the_task_waits_is_not_lost() {
        let shutdown = TaskShutdown::new();
        let power_down = shutdown.stop();
        let task = async {
            shutdown.requested().await;
            shutdown.release();
        };
        block_on(join(power_down, task));
    }
}
