//! Tracked allocation
//!
//! Every buffer the kernel allocates on behalf of an object (task stacks,
//! queue storage) is accounted here so that the current and peak footprint
//! can be reported by [`Kernel::memory_stats`](crate::Kernel::memory_stats).
use alloc::{boxed::Box, vec::Vec};
use core::mem::size_of;

use crate::error::CreateObjectError;

/// A snapshot of the memory accounting counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently allocated.
    pub current: usize,
    /// The highest value `current` has ever reached.
    pub peak: usize,
    /// The number of successful allocations so far.
    pub allocations: u32,
}

/// The allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl From<OutOfMemory> for CreateObjectError {
    fn from(OutOfMemory: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryAccount {
    stats: MemoryStats,
}

impl MemoryAccount {
    pub(crate) fn stats(&self) -> MemoryStats {
        self.stats
    }

    fn record_alloc(&mut self, bytes: usize) {
        self.stats.current += bytes;
        self.stats.allocations = self.stats.allocations.wrapping_add(1);
        if self.stats.current > self.stats.peak {
            self.stats.peak = self.stats.current;
        }
    }

    fn record_free(&mut self, bytes: usize) {
        debug_assert!(self.stats.current >= bytes);
        self.stats.current = self.stats.current.saturating_sub(bytes);
    }

    /// Allocate a zero-filled buffer of `len` elements.
    pub(crate) fn alloc_zeroed<T: Copy + Default>(
        &mut self,
        len: usize,
    ) -> Result<Box<[T]>, OutOfMemory> {
        let mut v = Vec::new();
        v.try_reserve_exact(len).map_err(|_| OutOfMemory)?;
        v.resize(len, T::default());
        self.record_alloc(len * size_of::<T>());
        Ok(v.into_boxed_slice())
    }

    /// Release a buffer obtained from [`Self::alloc_zeroed`].
    pub(crate) fn free<T>(&mut self, buf: Box<[T]>) {
        self.record_free(buf.len() * size_of::<T>());
        drop(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let mut account = MemoryAccount::default();
        let a = account.alloc_zeroed::<u8>(100).unwrap();
        let b = account.alloc_zeroed::<u32>(10).unwrap();
        assert_eq!(
            account.stats(),
            MemoryStats {
                current: 140,
                peak: 140,
                allocations: 2
            }
        );
        assert!(b.iter().all(|&x| x == 0));

        account.free(a);
        assert_eq!(account.stats().current, 40);
        assert_eq!(account.stats().peak, 140);

        account.free(b);
        assert_eq!(account.stats().current, 0);
        assert_eq!(account.stats().allocations, 2);
    }

    #[test]
    fn huge_allocation_fails() {
        let mut account = MemoryAccount::default();
        assert_eq!(
            account.alloc_zeroed::<u64>(usize::MAX / 4).err(),
            Some(OutOfMemory)
        );
        assert_eq!(account.stats(), MemoryStats::default());
    }
}
