#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Cycle counter storage in RAM that survives a software reset.
//!
//! The word lives in `.uninit`, which the runtime does not zero on boot. A
//! magic marker distinguishes a value written by the previous wake from
//! power-on garbage.

use node_core::counter::RetainedStore;

/// Written alongside the counter; anything else means cold boot.
pub const RETAINED_MAGIC: u32 = 0x5E45_C0DE;

/// Raw layout of the retained block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct RetainedBlock {
    pub magic: u32,
    pub counter: u32,
    /// Bitwise complement of `counter`, catches partial writes.
    pub check: u32,
}

impl RetainedBlock {
    pub const fn sealed(counter: u32) -> Self {
        Self {
            magic: RETAINED_MAGIC,
            counter,
            check: !counter,
        }
    }

    pub const fn counter(&self) -> Option<u32> {
        if self.magic == RETAINED_MAGIC && self.check == !self.counter {
            Some(self.counter)
        } else {
            None
        }
    }
}

/// [`RetainedStore`] over a borrowed block.
pub struct RetainedCounter<'a> {
    block: &'a mut RetainedBlock,
}

impl<'a> RetainedCounter<'a> {
    pub fn new(block: &'a mut RetainedBlock) -> Self {
        Self { block }
    }
}

impl RetainedStore for RetainedCounter<'_> {
    fn load(&mut self) -> Option<u32> {
        self.block.counter()
    }

    fn store(&mut self, value: u32) {
        *self.block = RetainedBlock::sealed(value);
    }
}

/// Takes the retained block. Must be called at most once per boot.
#[cfg(target_os = "none")]
pub fn take() -> RetainedCounter<'static> {
    use core::mem::MaybeUninit;

    #[unsafe(link_section = ".uninit.RETAINED")]
    static mut RETAINED: MaybeUninit<RetainedBlock> = MaybeUninit::uninit();

    // SAFETY: single call at boot; every bit pattern is a valid `RetainedBlock`.
    let block = unsafe { (*core::ptr::addr_of_mut!(RETAINED)).assume_init_mut() };
    RetainedCounter::new(block)
}
