//! Shared-memory management between a host processor and a memory-mapped
//! accelerator.
//!
//! This crate provides the pieces needed to hand data to an accelerator that
//! may not snoop the host caches: buffers paired across the host and device
//! address spaces, cache maintenance over host regions, transfer of buffer
//! contents across the boundary, and issuing commands with a blocking
//! completion token. Callers sequence these operations themselves; the
//! required order is host write, flush, copy to device, issue and wait,
//! invalidate, copy from device, host read.

/// Buffer allocator pairing host memory with device-visible memory.
///
/// Owns the table of live buffers, each a host block, a device address and a
/// size, and issues generational handles so that stale handles are rejected
/// at the API boundary rather than trusted to caller discipline.
pub mod allocator;

/// First-fit address range allocator for device memory.
///
/// Hands out aligned, non-overlapping address ranges from a fixed device
/// window and coalesces freed ranges. Device memory implementations use it
/// to back their reservations.
pub mod arena;

/// Cache maintenance over host memory regions.
///
/// Selects once, at initialization, between a no-op strategy for hardware
/// coherent platforms and a cache line walk for platforms that require
/// manual flush and invalidate.
pub mod coherency;

/// Runtime platform configuration.
///
/// Describes the coherency mode, cache geometry, transfer strategy and the
/// optional control register window the runtime is built from.
pub mod config;

/// Device-side capability interfaces.
///
/// The traits through which the core talks to device memory and to the
/// accelerator's command interface, plus a device memory implementation
/// over a memory-mapped reserved physical region.
pub mod device;

/// Command issue and completion tokens.
///
/// Submits commands referencing buffer device addresses and scalar
/// parameters, and exposes a token whose `wait` blocks until the
/// accelerator reports completion.
pub mod invoke;

/// Scoped access to the privileged control register window.
///
/// Maps the window once, exposes bounds-checked 32-bit register access and
/// unmaps it when the accessor is dropped.
pub mod register;

/// Runtime façade wiring the components together from a configuration.
pub mod runtime;

/// Movement of buffer contents across the host/device boundary.
///
/// Supports a single bulk block copy and a word-granular fallback that
/// issues one synchronous command per 32-bit word in ascending order.
pub mod transfer;

pub use allocator::{BufferAllocator, BufferHandle, CoherencyDomain};
pub use coherency::{CoherencyController, Region};
pub use config::{PlatformConfig, RegisterWindow, TransferMode};
pub use device::{Accelerator, DeviceAddr, DeviceMemory};
pub use invoke::{
    Command, Completer, CoreSelector, InvocationGateway, InvocationToken, Response, TokenState,
};
pub use register::{BusAttributes, RegisterAccessor};
pub use runtime::Runtime;
pub use transfer::{TransferEngine, TransferStats};

use std::path::PathBuf;

/// Which side of a paired allocation could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySide {
    Host,
    Device,
}

impl std::fmt::Display for MemorySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySide::Host => f.write_str("host"),
            MemorySide::Device => f.write_str("device"),
        }
    }
}

/// Error types returned by the accelerator memory stack.
///
/// Every failure is surfaced immediately to the caller as a distinct
/// variant; nothing is retried internally. Only `RegisterAccessFailure` is
/// fatal: there is no degraded mode without the control register window.
#[derive(Debug, thiserror::Error)]
pub enum AccelError {
    /// The buffer handle is unknown or has already been released.
    #[error("invalid buffer handle {0}")]
    InvalidHandle(BufferHandle),

    /// Host or device memory could not be reserved for a buffer.
    ///
    /// Any partial reservation has already been rolled back when this is
    /// returned, so no half-allocated buffer is reachable.
    #[error("failed to reserve {size} bytes of {side} memory")]
    AllocationFailure { side: MemorySide, size: usize },

    /// A coherency region is not aligned to the cache line size.
    ///
    /// Walking such a region would clean and invalidate bytes belonging to
    /// adjacent, unrelated allocations.
    #[error("region {addr:#x}+{len:#x} is not aligned to the {line}-byte cache line")]
    AlignmentViolation { addr: usize, len: usize, line: usize },

    /// The control register window could not be opened or mapped.
    #[error("cannot access register window {}: {reason}", path.display())]
    RegisterAccessFailure { path: PathBuf, reason: String },

    /// A register offset is misaligned or outside the mapped window.
    #[error("register offset {offset:#x} outside {len:#x}-byte window")]
    OutOfRange { offset: usize, len: usize },

    /// The accelerator rejected or faulted on a command.
    #[error("accelerator fault: {0}")]
    Device(String),

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AccelError {
    /// Returns true for errors that leave the process without a safe way to
    /// continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AccelError::RegisterAccessFailure { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AccelError>;
