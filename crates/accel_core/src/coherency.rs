//! Cache maintenance over host memory regions.
//!
//! On platforms where the accelerator does not snoop the host caches, the
//! host must flush a region after writing it and before the device reads
//! it, and invalidate a region after the device writes it and before the
//! host reads it. Both directions use the same clean-and-invalidate line
//! walk: a full barrier, one maintenance operation per cache line, a second
//! full barrier. Cleaning before invalidating means the walk never discards
//! host-dirty data.
//!
//! The strategy is chosen once from configuration. Coherent platforms get a
//! no-op; the alignment contract is checked on every platform so callers
//! fail identically everywhere.

use crate::{AccelError, Result};
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// A host memory range subject to cache maintenance.
///
/// A region borrows the memory it covers, so it cannot outlive the buffer
/// it was taken from:
///
/// ```compile_fail
/// # use accel_core::Region;
/// let region = {
///     let bytes = vec![0u8; 64];
///     Region::of_slice(&bytes)
/// };
/// # let _ = region;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    addr: usize,
    len: usize,
    _borrow: PhantomData<&'a [u8]>,
}

impl<'a> Region<'a> {
    /// Region covering a host slice, borrowed for the region's lifetime.
    pub fn of_slice(bytes: &'a [u8]) -> Self {
        Self {
            addr: bytes.as_ptr() as usize,
            len: bytes.len(),
            _borrow: PhantomData,
        }
    }

    /// Region over raw host memory.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay mapped in this process for all of `'a`.
    pub unsafe fn from_raw_parts(addr: usize, len: usize) -> Self {
        Self {
            addr,
            len,
            _borrow: PhantomData,
        }
    }

    /// First byte address of the region.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte address.
    pub fn end(&self) -> usize {
        self.addr + self.len
    }

    /// Returns true if both bounds fall on `line` boundaries.
    pub fn is_line_aligned(&self, line: usize) -> bool {
        self.addr % line == 0 && self.len % line == 0
    }
}

/// Architecture cache line maintenance primitive.
pub trait LineMaintenance: Send + Sync {
    /// Cleans and invalidates the cache line containing `addr`.
    fn clean_invalidate(&self, addr: usize);
}

/// Native line maintenance for the build target.
///
/// `dc civac` on aarch64 and `clflush` on x86_64. Other targets have no
/// user-space line primitive and fall back to a full fence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLines;

impl LineMaintenance for NativeLines {
    #[inline(always)]
    fn clean_invalidate(&self, addr: usize) {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: `addr` lies inside a region the caller guarantees is mapped.
        unsafe {
            core::arch::asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags));
        }

        #[cfg(target_arch = "x86_64")]
        // SAFETY: as above; clflush has no other preconditions.
        unsafe {
            core::arch::x86_64::_mm_clflush(addr as *const u8);
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            let _ = addr;
            fence(Ordering::SeqCst);
        }
    }
}

/// Strategy applied to a validated, line-aligned region.
pub trait RegionOp: Send + Sync {
    /// Applies the operation and returns the number of lines touched.
    fn apply(&self, region: Region<'_>, line: usize) -> usize;

    /// Returns true if this strategy performs real maintenance.
    fn is_manual(&self) -> bool;
}

/// Strategy for hardware-coherent platforms. Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Coherent;

impl RegionOp for Coherent {
    fn apply(&self, _region: Region<'_>, _line: usize) -> usize {
        0
    }

    fn is_manual(&self) -> bool {
        false
    }
}

/// Strategy walking a region line by line between two full barriers.
#[derive(Debug, Default)]
pub struct LineWalk<L = NativeLines> {
    lines: L,
}

impl<L: LineMaintenance> LineWalk<L> {
    pub fn new(lines: L) -> Self {
        Self { lines }
    }
}

impl<L: LineMaintenance> RegionOp for LineWalk<L> {
    fn apply(&self, region: Region<'_>, line: usize) -> usize {
        fence(Ordering::SeqCst);

        let mut walked = 0;
        for addr in (region.addr..region.end()).step_by(line) {
            self.lines.clean_invalidate(addr);
            walked += 1;
        }

        fence(Ordering::SeqCst);
        tracing::trace!(addr = format_args!("{:#x}", region.addr), walked, "line walk");
        walked
    }

    fn is_manual(&self) -> bool {
        true
    }
}

/// Applies the configured coherency strategy to host regions.
pub struct CoherencyController {
    op: Box<dyn RegionOp>,
    line_size: usize,
    walked: AtomicU64,
}

impl CoherencyController {
    /// Builds the controller for a platform.
    ///
    /// `manual` selects the native line walk; otherwise every operation is
    /// a no-op.
    pub fn new(manual: bool, line_size: usize) -> Result<Self> {
        let op: Box<dyn RegionOp> = if manual {
            Box::new(LineWalk::new(NativeLines))
        } else {
            Box::new(Coherent)
        };
        Self::with_op(op, line_size)
    }

    /// Builds the controller around an explicit strategy.
    pub fn with_op(op: Box<dyn RegionOp>, line_size: usize) -> Result<Self> {
        if !line_size.is_power_of_two() {
            return Err(AccelError::Config(format!(
                "cache line size {line_size} is not a power of two"
            )));
        }
        tracing::debug!(manual = op.is_manual(), line_size, "coherency controller ready");
        Ok(Self {
            op,
            line_size,
            walked: AtomicU64::new(0),
        })
    }

    /// Returns true if operations walk cache lines.
    pub fn is_manual(&self) -> bool {
        self.op.is_manual()
    }

    /// Line size regions are validated and walked against.
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Total cache lines walked since construction.
    pub fn lines_walked(&self) -> u64 {
        self.walked.load(Ordering::Relaxed)
    }

    fn validate(&self, region: Region<'_>) -> Result<()> {
        if region.is_line_aligned(self.line_size) {
            Ok(())
        } else {
            Err(AccelError::AlignmentViolation {
                addr: region.addr,
                len: region.len,
                line: self.line_size,
            })
        }
    }

    fn run(&self, what: &str, region: Region<'_>) {
        let walked = self.op.apply(region, self.line_size);
        self.walked.fetch_add(walked as u64, Ordering::Relaxed);
        tracing::debug!(
            op = what,
            addr = format_args!("{:#x}", region.addr),
            len = region.len,
            walked,
            "cache maintenance"
        );
    }

    /// Pushes host-written data in `region` out to memory.
    ///
    /// Must run after the host writes the region and before the device
    /// reads it.
    pub fn flush(&self, region: Region<'_>) -> Result<()> {
        self.validate(region)?;
        self.run("flush", region);
        Ok(())
    }

    /// Drops host-cached copies of `region`.
    ///
    /// Must run after the device writes the region and before the host reads
    /// it. The host must not hold unflushed writes to the region.
    pub fn invalidate(&self, region: Region<'_>) -> Result<()> {
        self.validate(region)?;
        self.run("invalidate", region);
        Ok(())
    }

    /// Flushes several regions. Nothing is walked unless all are aligned.
    pub fn flush_all(&self, regions: &[Region<'_>]) -> Result<()> {
        regions.iter().try_for_each(|&r| self.validate(r))?;
        regions.iter().for_each(|&r| self.run("flush", r));
        Ok(())
    }

    /// Invalidates several regions. Nothing is walked unless all are aligned.
    pub fn invalidate_all(&self, regions: &[Region<'_>]) -> Result<()> {
        regions.iter().try_for_each(|&r| self.validate(r))?;
        regions.iter().for_each(|&r| self.run("invalidate", r));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[repr(align(64))]
    struct Lines<const N: usize>([u8; N]);

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<usize>>>);

    impl LineMaintenance for Recorder {
        fn clean_invalidate(&self, addr: usize) {
            self.0.lock().unwrap().push(addr);
        }
    }

    fn recording_controller() -> (CoherencyController, Recorder) {
        let recorder = Recorder::default();
        let ctl =
            CoherencyController::with_op(Box::new(LineWalk::new(recorder.clone())), 64).unwrap();
        (ctl, recorder)
    }

    #[test]
    fn walk_touches_each_line_once_in_order() {
        let buf = Lines([0u8; 256]);
        let (ctl, recorder) = recording_controller();

        ctl.flush(Region::of_slice(&buf.0)).unwrap();

        let base = buf.0.as_ptr() as usize;
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![base, base + 64, base + 128, base + 192]
        );
        assert_eq!(ctl.lines_walked(), 4);
    }

    #[test]
    fn unaligned_region_is_rejected_and_neighbour_untouched() {
        let mut buf = Lines([0u8; 192]);
        // Neighbour line directly after the logical buffer.
        buf.0[128..].fill(0xA5);
        let (ctl, recorder) = recording_controller();

        let err = ctl.flush(Region::of_slice(&buf.0[..100])).unwrap_err();
        assert!(matches!(err, AccelError::AlignmentViolation { len: 100, line: 64, .. }));

        let err = ctl.invalidate(Region::of_slice(&buf.0[8..72])).unwrap_err();
        assert!(matches!(err, AccelError::AlignmentViolation { .. }));

        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(buf.0[128..].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn coherent_strategy_walks_nothing_but_still_checks_alignment() {
        let buf = Lines([0u8; 128]);
        let ctl = CoherencyController::new(false, 64).unwrap();
        assert!(!ctl.is_manual());

        ctl.flush(Region::of_slice(&buf.0)).unwrap();
        ctl.invalidate(Region::of_slice(&buf.0)).unwrap();
        assert_eq!(ctl.lines_walked(), 0);

        assert!(ctl.flush(Region::of_slice(&buf.0[..3])).is_err());
    }

    #[test]
    fn batch_operations_validate_before_walking() {
        let a = Lines([0u8; 64]);
        let b = Lines([0u8; 128]);
        let (ctl, recorder) = recording_controller();

        let err = ctl
            .flush_all(&[Region::of_slice(&a.0), Region::of_slice(&b.0[..65])])
            .unwrap_err();
        assert!(matches!(err, AccelError::AlignmentViolation { .. }));
        assert!(recorder.0.lock().unwrap().is_empty());

        ctl.invalidate_all(&[Region::of_slice(&a.0), Region::of_slice(&b.0)])
            .unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn empty_region_touches_nothing() {
        let buf = Lines([0u8; 64]);
        let (ctl, recorder) = recording_controller();
        ctl.flush(Region::of_slice(&buf.0[..0])).unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn native_flush_then_invalidate_is_idempotent() {
        let ctl = CoherencyController::new(true, 64).unwrap();
        assert!(ctl.is_manual());

        let mut buf = Lines([0u8; 4096]);
        let mut expected_lines = 0;
        for len in [64, 128, 512, 4096] {
            for (i, b) in buf.0[..len].iter_mut().enumerate() {
                *b = (i * 7 + len) as u8;
            }
            let bytes = &buf.0[..len];

            ctl.flush(Region::of_slice(bytes)).unwrap();
            let after_flush = bytes.to_vec();
            ctl.invalidate(Region::of_slice(bytes)).unwrap();
            assert_eq!(bytes, after_flush.as_slice(), "len {len}");
            ctl.invalidate(Region::of_slice(bytes)).unwrap();
            ctl.flush(Region::of_slice(bytes)).unwrap();
            assert_eq!(bytes, after_flush.as_slice(), "len {len}");

            expected_lines += 4 * len / 64;
        }
        assert_eq!(ctl.lines_walked(), expected_lines as u64);
    }
}
