//! First-fit address range allocator for device memory windows.
//!
//! Manages a contiguous device address window by keeping a sorted list of
//! free ranges. Reservations are aligned to the requested boundary and carved
//! from the first free range that fits; releases return the range to the
//! free list and merge it with its neighbours. The arena hands out addresses
//! only, it never touches the memory behind them.

use std::collections::BTreeMap;

/// Address range allocator for a fixed device window.
///
/// Every live reservation is disjoint from every other live reservation and
/// lies entirely inside `[base, base + len)`. The arena is not internally
/// synchronized; device memory implementations wrap it in their own lock.
#[derive(Debug)]
pub struct DeviceArena {
    /// First device address of the managed window.
    base: u64,

    /// Size of the window in bytes.
    len: u64,

    /// Free ranges as `(start, len)`, sorted by start and never adjacent.
    free: Vec<(u64, u64)>,

    /// Live reservations keyed by start address, valued by length.
    live: BTreeMap<u64, u64>,
}

impl DeviceArena {
    /// Creates an arena managing the device window `[base, base + len)`.
    pub fn new(base: u64, len: u64) -> Self {
        let free = if len > 0 { vec![(base, len)] } else { Vec::new() };
        Self {
            base,
            len,
            free,
            live: BTreeMap::new(),
        }
    }

    /// Reserves `size` bytes aligned to `align`.
    ///
    /// Scans the free list in address order and carves the reservation out
    /// of the first range that can hold it after alignment padding. Any
    /// padding in front of the reservation stays on the free list.
    ///
    /// # Returns
    ///
    /// The start address of the reservation, or `None` if `size` is zero,
    /// `align` is not a power of two, or no free range is large enough.
    pub fn reserve(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        for i in 0..self.free.len() {
            let (start, len) = self.free[i];
            let aligned = start.checked_add(align - 1)? & !(align - 1);
            let padding = aligned - start;
            let Some(needed) = padding.checked_add(size) else {
                continue;
            };
            if needed > len {
                continue;
            }

            let tail_start = aligned + size;
            let tail_len = len - needed;

            self.free.remove(i);
            let mut at = i;
            if padding > 0 {
                self.free.insert(at, (start, padding));
                at += 1;
            }
            if tail_len > 0 {
                self.free.insert(at, (tail_start, tail_len));
            }

            self.live.insert(aligned, size);
            return Some(aligned);
        }

        None
    }

    /// Returns a reservation to the free list.
    ///
    /// # Returns
    ///
    /// The size of the released reservation, or `None` if `addr` is not the
    /// start of a live reservation.
    pub fn release(&mut self, addr: u64) -> Option<u64> {
        let size = self.live.remove(&addr)?;

        let at = self.free.partition_point(|&(start, _)| start < addr);
        self.free.insert(at, (addr, size));

        // Merge with the following range first so `at` stays valid.
        if at + 1 < self.free.len() {
            let (next_start, next_len) = self.free[at + 1];
            if addr + size == next_start {
                self.free[at].1 += next_len;
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_start, prev_len) = self.free[at - 1];
            if prev_start + prev_len == addr {
                self.free[at - 1].1 += self.free[at].1;
                self.free.remove(at);
            }
        }

        Some(size)
    }

    /// Returns the live reservation that fully contains `[addr, addr + len)`.
    pub fn containing(&self, addr: u64, len: u64) -> Option<(u64, u64)> {
        let (&start, &size) = self.live.range(..=addr).next_back()?;
        let end = addr.checked_add(len)?;
        (end <= start + size).then_some((start, size))
    }

    /// First device address of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the window in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the window has zero size.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> u64 {
        self.live.values().sum()
    }

    /// Number of live reservations.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_aligned_and_disjoint() {
        let mut arena = DeviceArena::new(0x1000_0010, 0x1000);
        let a = arena.reserve(100, 64).unwrap();
        let b = arena.reserve(100, 64).unwrap();

        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(a + 100 <= b || b + 100 <= a);
        assert_eq!(arena.used(), 200);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut arena = DeviceArena::new(0, 256);
        assert!(arena.reserve(256, 64).is_some());
        assert!(arena.reserve(1, 1).is_none());
    }

    #[test]
    fn zero_size_and_bad_alignment_are_rejected() {
        let mut arena = DeviceArena::new(0, 256);
        assert!(arena.reserve(0, 64).is_none());
        assert!(arena.reserve(16, 48).is_none());
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut arena = DeviceArena::new(0, 192);
        let a = arena.reserve(64, 64).unwrap();
        let b = arena.reserve(64, 64).unwrap();
        let c = arena.reserve(64, 64).unwrap();

        assert_eq!(arena.release(a), Some(64));
        assert_eq!(arena.release(c), Some(64));
        assert_eq!(arena.release(b), Some(64));

        // The whole window is one range again.
        assert_eq!(arena.reserve(192, 64), Some(0));
    }

    #[test]
    fn double_release_is_rejected() {
        let mut arena = DeviceArena::new(0, 128);
        let a = arena.reserve(64, 64).unwrap();
        assert_eq!(arena.release(a), Some(64));
        assert_eq!(arena.release(a), None);
        assert_eq!(arena.release(a + 4), None);
    }

    #[test]
    fn containing_checks_bounds_of_live_ranges() {
        let mut arena = DeviceArena::new(0x100, 0x400);
        let a = arena.reserve(0x80, 0x40).unwrap();

        assert_eq!(arena.containing(a, 0x80), Some((a, 0x80)));
        assert_eq!(arena.containing(a + 0x7c, 4), Some((a, 0x80)));
        assert_eq!(arena.containing(a + 0x7e, 4), None);
        assert_eq!(arena.containing(a + 0x80, 4), None);
    }
}
