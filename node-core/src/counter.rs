//! Cycle counter persisted in retained memory across power-down.

use core::fmt;

/// Word of memory that survives sleep but not a cold boot.
pub trait RetainedStore {
    /// Returns the stored value, or `None` after a cold boot.
    fn load(&mut self) -> Option<u32>;

    fn store(&mut self, value: u32);
}

impl<S> RetainedStore for &mut S
where
    S: RetainedStore,
{
    fn load(&mut self) -> Option<u32> {
        (**self).load()
    }

    fn store(&mut self, value: u32) {
        (**self).store(value);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CounterError {
    /// The next value was already written this wake.
    AlreadyCommitted,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::AlreadyCommitted => f.write_str("cycle counter already committed"),
        }
    }
}

/// Wake counter read at boot and advanced exactly once before power-down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CycleCounter {
    value: u32,
    committed: bool,
}

impl CycleCounter {
    /// Reads the counter for this wake; a cold boot starts from zero.
    pub fn resume<S>(store: &mut S) -> Self
    where
        S: RetainedStore,
    {
        Self {
            value: store.load().unwrap_or(0),
            committed: false,
        }
    }

    /// Counter value for the current wake.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed
    }

    /// Persists `value + 1` (wrapping) for the next wake.
    pub fn commit_next<S>(&mut self, store: &mut S) -> Result<u32, CounterError>
    where
        S: RetainedStore,
    {
        if self.committed {
            return Err(CounterError::AlreadyCommitted);
        }
        let next = self.value.wrapping_add(1);
        store.store(next);
        self.committed = true;
        Ok(next)
    }
}
