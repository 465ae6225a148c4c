#![no_std]

// Wake-cycle logic shared by the sensor node firmware and host tooling.
//
// Every component here is a plain state machine driven by an explicit `now`
// instant and the cycle's timer queue, so the same code runs under the MCU
// executor and under the emulator's virtual clock.
pub mod acquisition;
pub mod aggregator;
pub mod barrier;
pub mod config;
pub mod counter;
pub mod cycle;
pub mod delivery;
pub mod link;
pub mod payload;
pub mod scheduler;
pub mod status;
pub mod telemetry;
pub mod time;
