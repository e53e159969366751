//! Common definitions and constants shared across the accelerator memory stack.
//!
//! This crate provides the cache geometry, the layout of the privileged
//! control register window, the bus-attribute encodings programmed into that
//! window, and the command encoding understood by the accelerator's reserved
//! systems. It is shared by the core library, the software accelerator, and
//! the host tools.

#![no_std]

// Cache and transfer granularity of the host processor.
//
// Coherency maintenance acts on whole cache lines and the word-granular
// transfer fallback moves one 32-bit word per command. Buffers handed to the
// accelerator are padded to these sizes so maintenance never spills into a
// neighbouring allocation.
pub mod cache {
    /// Cache line size of the host processor in bytes.
    ///
    /// 64 bytes is standard for ARM Cortex-A application cores and for
    /// x86_64. Platforms with a different line size override this through
    /// the platform configuration; the value must be a power of two.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Size of one transfer word in bytes.
    ///
    /// The word-granular fallback issues one synchronous command per word of
    /// this size, in strictly ascending index order.
    pub const WORD_SIZE: usize = 4;
}

// Layout of the privileged register window that governs the host/accelerator
// bus.
//
// The window is mapped once through the register accessor. All offsets are
// byte offsets into the window and must be 32-bit aligned.
pub mod mmio {
    /// Default device file used to map physical register windows.
    pub const DEFAULT_WINDOW_PATH: &str = "/dev/mem";

    /// Physical base address of the control register window.
    ///
    /// Matches the low-power-domain slave interface control block on
    /// Zynq UltraScale+ class devices. It is used as the mapping offset into
    /// the window device file.
    pub const CONTROL_WINDOW_BASE: u64 = 0xFF41_9000;

    /// Length of the control register window in bytes.
    pub const CONTROL_WINDOW_LEN: usize = 0x1000;

    /// Offset of the bus attribute register inside the control window.
    ///
    /// This register governs the per-transaction cache and protection
    /// attributes the accelerator's memory port presents to the interconnect.
    pub const BUS_ATTR_OFFSET: usize = 0x0;
}

// Per-transaction bus attribute encodings.
//
// The bus attribute register holds two bit fields: a 4-bit cache field
// starting at bit 0 and a 3-bit protection field starting at bit 4. The
// remaining bits are reserved and must be written as zero.
pub mod bus {
    /// Bit offset of the 4-bit cache attribute field.
    pub const CACHE_SHIFT: usize = 0;

    /// Width in bits of the cache attribute field.
    pub const CACHE_BITS: usize = 4;

    /// Bit offset of the 3-bit protection attribute field.
    pub const PROT_SHIFT: usize = 4;

    /// Width in bits of the protection attribute field.
    pub const PROT_BITS: usize = 3;

    /// Non-cacheable transactions. Safest and slowest setting.
    pub const NON_CACHEABLE: u8 = 0x02;

    /// Bufferable, non-cacheable transactions.
    pub const BUFFERABLE: u8 = 0x0A;

    /// Fully cacheable transactions.
    ///
    /// Only coherent with the host when the interconnect snoops the host
    /// caches; otherwise manual cache maintenance is required.
    pub const FULLY_CACHEABLE: u8 = 0x7A;
}

// Command encoding for the accelerator's reserved systems.
//
// An accelerator command addresses a system (a kind of functional unit) and
// a core within that system. Systems below `USER_SYSTEM_BASE` are reserved
// by the memory stack itself.
pub mod isa {
    /// System identifier of the word-command helper.
    ///
    /// Each command moves a single 32-bit word between the command and
    /// device memory. Operand 0 is the word's device address, scalar 0 is the
    /// value to write and scalar 1 is the direction flag. The response
    /// payload carries the word read back.
    pub const DMA_HELPER: u16 = 0x00;

    /// First system identifier available to application accelerators.
    pub const USER_SYSTEM_BASE: u16 = 0x100;

    /// System identifier of the element-wise vector add unit.
    ///
    /// Operands are `a`, `b` and `out`; scalar 0 is the element count.
    pub const VECTOR_ADD: u16 = USER_SYSTEM_BASE;

    /// Direction flag for a word command that writes device memory.
    pub const WORD_WRITE: u64 = 1;

    /// Direction flag for a word command that reads device memory.
    pub const WORD_READ: u64 = 0;
}
