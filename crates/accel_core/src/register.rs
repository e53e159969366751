//! Scoped access to the privileged control register window.
//!
//! The window is mapped once when the accessor is opened and unmapped when
//! it is dropped, so registers can never be touched after close. All access
//! is 32-bit and volatile; offsets are byte offsets that must be word
//! aligned and inside the window.

use crate::config::RegisterWindow;
use crate::{AccelError, Result};
use accel_common::bus;
use bitvec::prelude::*;
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;

/// Typed view of the per-transaction bus attribute register.
///
/// Bits 0..4 hold the cache field and bits 4..7 the protection field. All
/// other bits are reserved and always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusAttributes(u32);

impl BusAttributes {
    /// Non-cacheable transactions.
    pub const NON_CACHEABLE: BusAttributes = BusAttributes(bus::NON_CACHEABLE as u32);

    /// Bufferable, non-cacheable transactions.
    pub const BUFFERABLE: BusAttributes = BusAttributes(bus::BUFFERABLE as u32);

    /// Fully cacheable transactions.
    pub const FULLY_CACHEABLE: BusAttributes = BusAttributes(bus::FULLY_CACHEABLE as u32);

    const FIELD_MASK: u32 = (1 << (bus::PROT_SHIFT + bus::PROT_BITS)) - 1;

    /// Packs a cache and a protection field.
    pub fn new(cache: u8, protection: u8) -> Result<Self> {
        if u32::from(cache) >> bus::CACHE_BITS != 0 {
            return Err(AccelError::Config(format!(
                "cache attribute {cache:#x} wider than {} bits",
                bus::CACHE_BITS
            )));
        }
        if u32::from(protection) >> bus::PROT_BITS != 0 {
            return Err(AccelError::Config(format!(
                "protection attribute {protection:#x} wider than {} bits",
                bus::PROT_BITS
            )));
        }

        let mut raw = 0u32;
        let bits = raw.view_bits_mut::<Lsb0>();
        bits[bus::CACHE_SHIFT..bus::CACHE_SHIFT + bus::CACHE_BITS].store_le(cache);
        bits[bus::PROT_SHIFT..bus::PROT_SHIFT + bus::PROT_BITS].store_le(protection);
        Ok(Self(raw))
    }

    /// Interprets a raw register value, rejecting reserved bits.
    pub fn from_raw(raw: u32) -> Result<Self> {
        if raw & !Self::FIELD_MASK != 0 {
            return Err(AccelError::Config(format!(
                "bus attribute {raw:#x} sets reserved bits"
            )));
        }
        Ok(Self(raw))
    }

    pub fn cache(self) -> u8 {
        self.0.view_bits::<Lsb0>()[bus::CACHE_SHIFT..bus::CACHE_SHIFT + bus::CACHE_BITS].load_le()
    }

    pub fn protection(self) -> u8 {
        self.0.view_bits::<Lsb0>()[bus::PROT_SHIFT..bus::PROT_SHIFT + bus::PROT_BITS].load_le()
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BusAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x} (cache={:#x}, prot={:#x})",
            self.0,
            self.cache(),
            self.protection()
        )
    }
}

/// Capability over a mapped control register window.
pub struct RegisterAccessor {
    map: MmapMut,
    path: PathBuf,
    bus_attr_offset: usize,
}

impl RegisterAccessor {
    /// Maps the register window described by `window`.
    ///
    /// # Returns
    ///
    /// The accessor, or `RegisterAccessFailure` if the window geometry is
    /// invalid, the device file cannot be opened (typically permission
    /// denied), or the mapping fails.
    pub fn open(window: &RegisterWindow) -> Result<Self> {
        let fail = |reason: String| AccelError::RegisterAccessFailure {
            path: window.path.clone(),
            reason,
        };

        if window.len == 0 || window.len % 4 != 0 {
            return Err(fail(format!(
                "window length {:#x} is not a non-zero multiple of 4",
                window.len
            )));
        }
        if window.base % 4 != 0 {
            return Err(fail(format!("window base {:#x} is not word aligned", window.base)));
        }
        if window.bus_attr_offset % 4 != 0 || window.bus_attr_offset + 4 > window.len {
            return Err(fail(format!(
                "bus attribute offset {:#x} outside window",
                window.bus_attr_offset
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&window.path)
            .map_err(|e| fail(e.to_string()))?;

        // SAFETY: the mapping is private to this accessor and only accessed
        // through the bounds-checked volatile helpers below.
        let map = unsafe {
            MmapOptions::new()
                .offset(window.base)
                .len(window.len)
                .map_mut(&file)
        }
        .map_err(|e| fail(e.to_string()))?;

        tracing::debug!(
            path = %window.path.display(),
            base = format_args!("{:#x}", window.base),
            len = window.len,
            "mapped register window"
        );

        Ok(Self {
            map,
            path: window.path.clone(),
            bus_attr_offset: window.bus_attr_offset,
        })
    }

    /// Maps the register window or terminates the process.
    ///
    /// There is no degraded mode without the control registers, so failure
    /// logs a diagnostic and exits with a non-zero status.
    pub fn open_or_abort(window: &RegisterWindow) -> Self {
        match Self::open(window) {
            Ok(accessor) => accessor,
            Err(e) => {
                tracing::error!("{e}");
                eprintln!("fatal: {e}");
                std::process::exit(1);
            }
        }
    }

    fn check(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset.checked_add(4).is_none_or(|end| end > self.map.len()) {
            return Err(AccelError::OutOfRange {
                offset,
                len: self.map.len(),
            });
        }
        Ok(())
    }

    /// Reads the 32-bit register at byte `offset`.
    pub fn read(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;
        // SAFETY: `check` keeps the word inside the mapping and word aligned;
        // the mapping itself starts on a word boundary.
        let value = unsafe { self.map.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!(offset = format_args!("{offset:#x}"), value = format_args!("{value:#x}"), "register read");
        Ok(value)
    }

    /// Writes the 32-bit register at byte `offset`.
    pub fn write(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;
        tracing::trace!(offset = format_args!("{offset:#x}"), value = format_args!("{value:#x}"), "register write");
        // SAFETY: see `read`.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(offset)
                .cast::<u32>()
                .write_volatile(value)
        };
        Ok(())
    }

    /// Programs the bus attribute register.
    pub fn set_bus_attributes(&mut self, attrs: BusAttributes) -> Result<()> {
        tracing::debug!(%attrs, "programming bus attributes");
        self.write(self.bus_attr_offset, attrs.raw())
    }

    /// Reads back the bus attribute register.
    pub fn bus_attributes(&self) -> Result<BusAttributes> {
        BusAttributes::from_raw(self.read(self.bus_attr_offset)?)
    }

    /// Length of the mapped window in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for RegisterAccessor {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "unmapping register window");
    }
}
