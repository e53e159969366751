//! Device-side capability interfaces.
//!
//! The core never computes on the accelerator's behalf. It reserves device
//! memory, moves bytes in and out of it, and submits commands, all through
//! the two traits defined here. A software accelerator implements both for
//! simulation; real platforms implement `DeviceMemory` over a reserved
//! physical carve-out and `Accelerator` over their command interface.

use crate::arena::DeviceArena;
use crate::invoke::{Command, Completer};
use crate::{AccelError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Device-visible address.
///
/// An opaque token meaningful only to the accelerator and the transfer
/// engine. It is never dereferenced on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddr(pub u64);

impl DeviceAddr {
    /// Returns the address `bytes` past this one.
    pub fn offset(self, bytes: u64) -> DeviceAddr {
        DeviceAddr(self.0 + bytes)
    }

    /// Raw address value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Device memory reachable by the accelerator.
///
/// Implementations hand out non-overlapping reservations and copy whole
/// blocks between host slices and reserved device memory. Block copies must
/// stay inside a single live reservation.
pub trait DeviceMemory: Send + Sync {
    /// Reserves `size` bytes of device memory aligned to `align`.
    fn reserve(&self, size: usize, align: usize) -> Result<DeviceAddr>;

    /// Releases a reservation previously returned by `reserve`.
    fn release(&self, addr: DeviceAddr) -> Result<()>;

    /// Copies `data` into device memory starting at `addr`.
    fn write_block(&self, addr: DeviceAddr, data: &[u8]) -> Result<()>;

    /// Copies device memory starting at `addr` into `out`.
    fn read_block(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<()>;
}

/// Command interface of the accelerator.
///
/// `submit` hands over a command together with the completer of its token.
/// The accelerator completes the token when the command finishes; dropping
/// the completer without completing it reports a failed response.
pub trait Accelerator: Send + Sync {
    fn submit(&self, command: Command, completer: Completer);
}

/// Device memory backed by a memory-mapped reserved physical region.
///
/// On hardware the region is a carve-out of DRAM excluded from the kernel's
/// allocator and mapped through `/dev/mem`; device addresses are the
/// physical addresses of the carve-out. Any mappable file works, which is
/// how the tests exercise it.
pub struct MappedCarveout {
    map: Mutex<MmapMut>,
    arena: Mutex<DeviceArena>,
}

impl MappedCarveout {
    /// Maps `len` bytes of physical memory at `phys_base` through `path`.
    ///
    /// Device addresses handed out by the carve-out equal the physical
    /// addresses of the mapped bytes.
    pub fn open(path: impl AsRef<Path>, phys_base: u64, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| AccelError::Device(format!("open {}: {e}", path.display())))?;
        Self::map(&file, phys_base, phys_base, len)
    }

    /// Maps `len` bytes of `file` at `file_offset` and addresses them from
    /// `device_base` on the device side.
    pub fn map(file: &File, file_offset: u64, device_base: u64, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(AccelError::Config("carve-out length must be non-zero".into()));
        }

        // SAFETY: the mapping is owned by this value and only accessed through
        // bounds-checked block copies below.
        let map = unsafe { MmapOptions::new().offset(file_offset).len(len).map_mut(file) }
            .map_err(|e| AccelError::Device(format!("map carve-out: {e}")))?;

        tracing::debug!(device_base = %DeviceAddr(device_base), len, "mapped device carve-out");

        Ok(Self {
            map: Mutex::new(map),
            arena: Mutex::new(DeviceArena::new(device_base, len as u64)),
        })
    }

    fn offset_of(&self, addr: DeviceAddr, len: usize) -> Result<usize> {
        let arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena.containing(addr.raw(), len as u64).ok_or_else(|| {
            AccelError::Device(format!("{len} bytes at {addr} outside any reservation"))
        })?;
        Ok((addr.raw() - arena.base()) as usize)
    }
}

impl DeviceMemory for MappedCarveout {
    fn reserve(&self, size: usize, align: usize) -> Result<DeviceAddr> {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena
            .reserve(size as u64, align as u64)
            .map(DeviceAddr)
            .ok_or(AccelError::AllocationFailure {
                side: crate::MemorySide::Device,
                size,
            })
    }

    fn release(&self, addr: DeviceAddr) -> Result<()> {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena
            .release(addr.raw())
            .map(|_| ())
            .ok_or_else(|| AccelError::Device(format!("{addr} is not a live reservation")))
    }

    fn write_block(&self, addr: DeviceAddr, data: &[u8]) -> Result<()> {
        let offset = self.offset_of(addr, data.len())?;
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_block(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(addr, out.len())?;
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        out.copy_from_slice(&map[offset..offset + out.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carveout(len: usize) -> (tempfile::NamedTempFile, MappedCarveout) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len as u64).unwrap();
        let carveout = MappedCarveout::map(file.as_file(), 0, 0x7000_0000, len).unwrap();
        (file, carveout)
    }

    #[test]
    fn block_round_trip_through_carveout() {
        let (_file, mem) = carveout(4096);
        let addr = mem.reserve(128, 64).unwrap();
        assert_eq!(addr, DeviceAddr(0x7000_0000));

        let data: Vec<u8> = (0..128u8).collect();
        mem.write_block(addr, &data).unwrap();

        let mut back = vec![0u8; 128];
        mem.read_block(addr, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn block_copies_must_stay_inside_a_reservation() {
        let (_file, mem) = carveout(4096);
        let addr = mem.reserve(64, 64).unwrap();

        let err = mem.write_block(addr.offset(32), &[0u8; 64]).unwrap_err();
        assert!(matches!(err, AccelError::Device(_)));

        mem.release(addr).unwrap();
        let err = mem.read_block(addr, &mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, AccelError::Device(_)));
    }

    #[test]
    fn exhausted_carveout_reports_device_allocation_failure() {
        let (_file, mem) = carveout(256);
        mem.reserve(256, 64).unwrap();
        let err = mem.reserve(64, 64).unwrap_err();
        assert!(matches!(
            err,
            AccelError::AllocationFailure {
                side: crate::MemorySide::Device,
                ..
            }
        ));
    }
}
