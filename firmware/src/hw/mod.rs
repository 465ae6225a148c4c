//! Board-level primitives outside the wake-cycle core.

pub mod power;
pub mod retained;
