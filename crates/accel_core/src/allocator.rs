//! Buffer allocator pairing host memory with device-visible memory.
//!
//! Each live buffer is a zeroed host block and a device reservation of the
//! same padded size. Host blocks are aligned to the cache line and padded to
//! a whole number of lines so that coherency maintenance over a buffer never
//! reaches a neighbouring allocation. The allocator is the only component
//! that frees or reassigns either side.

use crate::coherency::Region;
use crate::device::{DeviceAddr, DeviceMemory};
use crate::{AccelError, MemorySide, Result};
use accel_common::cache::WORD_SIZE;
use bytemuck::Pod;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Opaque identifier of a live buffer.
///
/// A handle names a slot in the allocator's table and the generation of
/// that slot. Releasing a buffer bumps the generation, so a stale handle can
/// never alias a later buffer that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    slot: u32,
    generation: u32,
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}.{}", self.slot, self.generation)
    }
}

/// Coherency domain buffers are allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyDomain {
    Coherent,
    Manual,
}

/// Exclusively owned, zeroed host memory.
struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is uniquely owned and only reachable through the
// allocator, which hands out borrows tied to its own borrow.
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    fn zeroed(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: callers never request zero-sized blocks.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `layout.size()` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct BufferEntry {
    size: usize,
    host: HostBlock,
    device: DeviceAddr,
}

struct Slot {
    generation: u32,
    entry: Option<BufferEntry>,
}

/// Table of live buffers.
pub struct BufferAllocator {
    device: Arc<dyn DeviceMemory>,
    line_size: usize,
    domain: CoherencyDomain,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
}

impl BufferAllocator {
    /// Creates an allocator reserving device memory from `device`.
    ///
    /// `line_size` is the alignment and padding granularity of every buffer.
    pub fn new(
        device: Arc<dyn DeviceMemory>,
        line_size: usize,
        domain: CoherencyDomain,
    ) -> Result<Self> {
        if !line_size.is_power_of_two() || line_size < WORD_SIZE {
            return Err(AccelError::Config(format!(
                "buffer granularity {line_size} must be a power of two of at least {WORD_SIZE}"
            )));
        }
        Ok(Self {
            device,
            line_size,
            domain,
            slots: Vec::new(),
            free_slots: Vec::new(),
        })
    }

    /// Reserves a buffer of `size` bytes on both sides.
    ///
    /// If the device side cannot be reserved the host block is freed before
    /// returning, so a failed allocation leaves nothing behind.
    pub fn allocate(&mut self, size: usize) -> Result<BufferHandle> {
        let padded = size
            .checked_next_multiple_of(self.line_size)
            .filter(|&p| p > 0)
            .ok_or(AccelError::AllocationFailure {
                side: MemorySide::Host,
                size,
            })?;

        let host = HostBlock::zeroed(padded, self.line_size).ok_or(
            AccelError::AllocationFailure {
                side: MemorySide::Host,
                size: padded,
            },
        )?;

        let device = match self.device.reserve(padded, self.line_size) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!(size = padded, "device reservation failed: {e}");
                return Err(AccelError::AllocationFailure {
                    side: MemorySide::Device,
                    size: padded,
                });
            }
        };

        let entry = BufferEntry { size, host, device };
        let handle = match self.free_slots.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot as usize];
                s.entry = Some(entry);
                BufferHandle {
                    slot,
                    generation: s.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                BufferHandle {
                    slot,
                    generation: 0,
                }
            }
        };

        tracing::debug!(%handle, size, padded, device = %device, "allocated buffer");
        Ok(handle)
    }

    /// Frees both sides of a buffer and invalidates its handle.
    pub fn release(&mut self, handle: BufferHandle) -> Result<()> {
        self.entry(handle)?;
        let slot = &mut self.slots[handle.slot as usize];
        let entry = slot.entry.take().ok_or_else(|| stale(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(handle.slot);

        tracing::debug!(%handle, device = %entry.device, "released buffer");
        // The host block is freed when `entry` drops, whatever the device says.
        self.device.release(entry.device)
    }

    fn entry(&self, handle: BufferHandle) -> Result<&BufferEntry> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
            .ok_or_else(|| stale(handle))
    }

    fn entry_mut(&mut self, handle: BufferHandle) -> Result<&mut BufferEntry> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
            .ok_or_else(|| stale(handle))
    }

    /// Start of the buffer's host memory.
    pub fn host_address_of(&self, handle: BufferHandle) -> Result<NonNull<u8>> {
        Ok(self.entry(handle)?.host.ptr)
    }

    /// Device address of the buffer.
    pub fn device_address_of(&self, handle: BufferHandle) -> Result<DeviceAddr> {
        Ok(self.entry(handle)?.device)
    }

    /// Logical size requested at allocation.
    pub fn size_of(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.entry(handle)?.size)
    }

    /// Size including cache line padding.
    pub fn padded_size_of(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.entry(handle)?.host.layout.size())
    }

    /// Line-aligned coherency region covering the whole buffer.
    ///
    /// The region borrows the allocator, so the buffer cannot be released
    /// while the region is alive:
    ///
    /// ```compile_fail
    /// # use accel_core::{BufferAllocator, CoherencyController, CoherencyDomain, DeviceAddr, DeviceMemory};
    /// # use accel_core::Result;
    /// # use std::sync::Arc;
    /// # struct Null;
    /// # impl DeviceMemory for Null {
    /// #     fn reserve(&self, _: usize, _: usize) -> Result<DeviceAddr> { Ok(DeviceAddr(0)) }
    /// #     fn release(&self, _: DeviceAddr) -> Result<()> { Ok(()) }
    /// #     fn write_block(&self, _: DeviceAddr, _: &[u8]) -> Result<()> { Ok(()) }
    /// #     fn read_block(&self, _: DeviceAddr, _: &mut [u8]) -> Result<()> { Ok(()) }
    /// # }
    /// let mut buffers = BufferAllocator::new(Arc::new(Null), 64, CoherencyDomain::Manual)?;
    /// let ctl = CoherencyController::new(true, 64)?;
    /// let h = buffers.allocate(64)?;
    /// let region = buffers.region_of(h)?;
    /// buffers.release(h)?;
    /// ctl.flush(region)?;
    /// # Ok::<(), accel_core::AccelError>(())
    /// ```
    pub fn region_of(&self, handle: BufferHandle) -> Result<Region<'_>> {
        Ok(Region::of_slice(self.entry(handle)?.host.bytes()))
    }

    /// Host bytes of the buffer's logical size.
    pub fn host_bytes(&self, handle: BufferHandle) -> Result<&[u8]> {
        let entry = self.entry(handle)?;
        Ok(&entry.host.bytes()[..entry.size])
    }

    /// Mutable host bytes of the buffer's logical size.
    pub fn host_bytes_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        let entry = self.entry_mut(handle)?;
        let size = entry.size;
        Ok(&mut entry.host.bytes_mut()[..size])
    }

    pub(crate) fn padded_bytes(&self, handle: BufferHandle) -> Result<&[u8]> {
        Ok(self.entry(handle)?.host.bytes())
    }

    pub(crate) fn padded_bytes_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        Ok(self.entry_mut(handle)?.host.bytes_mut())
    }

    /// Host memory viewed as whole elements of `T`.
    ///
    /// Trailing bytes that do not fill an element are not included.
    /// Zero-sized element types are rejected with `Config`.
    pub fn host_slice<T: Pod>(&self, handle: BufferHandle) -> Result<&[T]> {
        let size = element_size::<T>()?;
        let bytes = self.host_bytes(handle)?;
        let whole = bytes.len() - bytes.len() % size;
        bytemuck::try_cast_slice(&bytes[..whole]).map_err(|_| AccelError::AlignmentViolation {
            addr: bytes.as_ptr() as usize,
            len: whole,
            line: align_of::<T>(),
        })
    }

    /// Mutable counterpart of [`host_slice`](Self::host_slice).
    pub fn host_slice_mut<T: Pod>(&mut self, handle: BufferHandle) -> Result<&mut [T]> {
        let size = element_size::<T>()?;
        let bytes = self.host_bytes_mut(handle)?;
        let whole = bytes.len() - bytes.len() % size;
        let addr = bytes.as_ptr() as usize;
        bytemuck::try_cast_slice_mut(&mut bytes[..whole]).map_err(|_| {
            AccelError::AlignmentViolation {
                addr,
                len: whole,
                line: align_of::<T>(),
            }
        })
    }

    /// Coherency domain every buffer of this allocator belongs to.
    pub fn domain(&self) -> CoherencyDomain {
        self.domain
    }

    /// Alignment and padding granularity of buffers.
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Number of live buffers.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Handles of all live buffers.
    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.entry.as_ref().map(|_| BufferHandle {
                slot: slot as u32,
                generation: s.generation,
            })
        })
    }
}

fn element_size<T>() -> Result<usize> {
    match size_of::<T>() {
        0 => Err(AccelError::Config(format!(
            "cannot view buffers as zero-sized `{}`",
            std::any::type_name::<T>()
        ))),
        size => Ok(size),
    }
}

fn stale(handle: BufferHandle) -> AccelError {
    tracing::warn!(%handle, "use of unknown or released buffer");
    AccelError::InvalidHandle(handle)
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        let live: Vec<_> = self.handles().collect();
        for handle in live {
            if let Err(e) = self.release(handle) {
                tracing::warn!(%handle, "release on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::DeviceArena;
    use crate::coherency::CoherencyController;
    use std::sync::Mutex;

    /// Device memory that only tracks reservations.
    struct ArenaOnly {
        arena: Mutex<DeviceArena>,
        released: Mutex<Vec<DeviceAddr>>,
    }

    impl ArenaOnly {
        fn new(len: u64) -> Arc<Self> {
            Arc::new(Self {
                arena: Mutex::new(DeviceArena::new(0x4000_0000, len)),
                released: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceMemory for ArenaOnly {
        fn reserve(&self, size: usize, align: usize) -> Result<DeviceAddr> {
            self.arena
                .lock()
                .unwrap()
                .reserve(size as u64, align as u64)
                .map(DeviceAddr)
                .ok_or(AccelError::AllocationFailure {
                    side: MemorySide::Device,
                    size,
                })
        }

        fn release(&self, addr: DeviceAddr) -> Result<()> {
            self.released.lock().unwrap().push(addr);
            self.arena.lock().unwrap().release(addr.raw());
            Ok(())
        }

        fn write_block(&self, _addr: DeviceAddr, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_block(&self, _addr: DeviceAddr, _out: &mut [u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn buffers_are_line_aligned_padded_and_zeroed() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x10000), 64, CoherencyDomain::Manual).unwrap();
        let h = buffers.allocate(100).unwrap();

        assert_eq!(buffers.size_of(h).unwrap(), 100);
        assert_eq!(buffers.padded_size_of(h).unwrap(), 128);
        assert_eq!(buffers.host_address_of(h).unwrap().as_ptr() as usize % 64, 0);
        assert_eq!(buffers.device_address_of(h).unwrap().raw() % 64, 0);
        assert!(buffers.region_of(h).unwrap().is_line_aligned(64));
        assert!(buffers.host_bytes(h).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn released_handle_is_rejected_everywhere() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x10000), 64, CoherencyDomain::Coherent).unwrap();
        let h = buffers.allocate(64).unwrap();
        buffers.release(h).unwrap();

        assert!(matches!(buffers.host_address_of(h), Err(AccelError::InvalidHandle(x)) if x == h));
        assert!(matches!(buffers.device_address_of(h), Err(AccelError::InvalidHandle(_))));
        assert!(matches!(buffers.size_of(h), Err(AccelError::InvalidHandle(_))));
        assert!(matches!(buffers.region_of(h), Err(AccelError::InvalidHandle(_))));
        assert!(matches!(buffers.host_bytes(h), Err(AccelError::InvalidHandle(_))));
        assert!(matches!(buffers.release(h), Err(AccelError::InvalidHandle(_))));

        // The slot is reused under a new generation; the old handle stays dead.
        let h2 = buffers.allocate(64).unwrap();
        assert_ne!(h, h2);
        assert!(buffers.size_of(h).is_err());
        assert_eq!(buffers.size_of(h2).unwrap(), 64);
    }

    #[test]
    fn live_buffers_never_overlap() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x10000), 64, CoherencyDomain::Coherent).unwrap();
        let mut live = Vec::new();
        for size in [4, 64, 65, 200, 1, 128, 333] {
            live.push(buffers.allocate(size).unwrap());
        }
        buffers.release(live.remove(2)).unwrap();
        live.push(buffers.allocate(90).unwrap());

        let spans = |f: &dyn Fn(BufferHandle) -> (u64, u64)| -> Vec<(u64, u64)> {
            live.iter().map(|&h| f(h)).collect()
        };
        let host = spans(&|h| {
            let start = buffers.host_address_of(h).unwrap().as_ptr() as u64;
            (start, start + buffers.padded_size_of(h).unwrap() as u64)
        });
        let device = spans(&|h| {
            let start = buffers.device_address_of(h).unwrap().raw();
            (start, start + buffers.padded_size_of(h).unwrap() as u64)
        });

        for set in [host, device] {
            for (i, a) in set.iter().enumerate() {
                for b in &set[i + 1..] {
                    assert!(a.1 <= b.0 || b.1 <= a.0, "{a:x?} overlaps {b:x?}");
                }
            }
        }
    }

    #[test]
    fn device_exhaustion_rolls_back_and_reports_device_side() {
        let device = ArenaOnly::new(128);
        let mut buffers = BufferAllocator::new(device.clone(), 64, CoherencyDomain::Coherent).unwrap();
        buffers.allocate(128).unwrap();

        let err = buffers.allocate(64).unwrap_err();
        assert!(matches!(
            err,
            AccelError::AllocationFailure {
                side: MemorySide::Device,
                size: 64
            }
        ));
        assert_eq!(buffers.live_count(), 1);
    }

    #[test]
    fn zero_size_is_an_allocation_failure() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x1000), 64, CoherencyDomain::Coherent).unwrap();
        assert!(matches!(
            buffers.allocate(0),
            Err(AccelError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn typed_views_cover_whole_elements() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x1000), 64, CoherencyDomain::Coherent).unwrap();
        let h = buffers.allocate(4 * 32 + 2).unwrap();

        let words = buffers.host_slice_mut::<i32>(h).unwrap();
        assert_eq!(words.len(), 32);
        words[31] = -5;

        assert_eq!(buffers.host_slice::<i32>(h).unwrap()[31], -5);
        assert_eq!(buffers.host_slice::<u16>(h).unwrap().len(), 65);
    }

    #[test]
    fn zero_sized_views_are_rejected() {
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x1000), 64, CoherencyDomain::Coherent).unwrap();
        let h = buffers.allocate(64).unwrap();

        assert!(matches!(buffers.host_slice::<()>(h), Err(AccelError::Config(_))));
        assert!(matches!(buffers.host_slice_mut::<()>(h), Err(AccelError::Config(_))));
        assert_eq!(buffers.host_slice::<u8>(h).unwrap().len(), 64);
    }

    #[test]
    fn native_maintenance_preserves_allocated_buffers() {
        let ctl = CoherencyController::new(true, 64).unwrap();
        let mut buffers = BufferAllocator::new(ArenaOnly::new(0x10000), 64, CoherencyDomain::Manual).unwrap();

        for size in [64, 100, 4096] {
            let h = buffers.allocate(size).unwrap();
            for (i, b) in buffers.host_bytes_mut(h).unwrap().iter_mut().enumerate() {
                *b = (i * 13 + size) as u8;
            }

            ctl.flush(buffers.region_of(h).unwrap()).unwrap();
            let after_flush = buffers.host_bytes(h).unwrap().to_vec();
            ctl.invalidate(buffers.region_of(h).unwrap()).unwrap();
            assert_eq!(buffers.host_bytes(h).unwrap(), after_flush.as_slice(), "size {size}");

            buffers.release(h).unwrap();
        }
        // 64 + 128 + 4096 bytes, each walked twice.
        assert_eq!(ctl.lines_walked(), 2 * (1 + 2 + 64));
    }

    #[test]
    fn drop_releases_remaining_device_reservations() {
        let device = ArenaOnly::new(0x1000);
        {
            let mut buffers = BufferAllocator::new(device.clone(), 64, CoherencyDomain::Coherent).unwrap();
            buffers.allocate(64).unwrap();
            buffers.allocate(64).unwrap();
        }
        assert_eq!(device.released.lock().unwrap().len(), 2);
        assert_eq!(device.arena.lock().unwrap().live_count(), 0);
    }
}
