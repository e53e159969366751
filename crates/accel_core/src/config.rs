//! Runtime platform configuration.
//!
//! Coherency behaviour is selected here once, at initialization, rather than
//! at compile time: the same binary runs on hardware-coherent platforms and
//! on platforms that need manual cache maintenance.

use crate::{AccelError, Result};
use accel_common::{cache, mmio};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Strategy used to move buffer contents across the host/device boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// One synchronous block copy of the whole buffer.
    #[default]
    Bulk,
    /// One synchronous command per 32-bit word, in ascending order.
    Word,
}

impl FromStr for TransferMode {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bulk" => Ok(TransferMode::Bulk),
            "word" => Ok(TransferMode::Word),
            other => Err(AccelError::Config(format!("unknown transfer mode `{other}`"))),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Bulk => f.write_str("bulk"),
            TransferMode::Word => f.write_str("word"),
        }
    }
}

/// Location and layout of the privileged control register window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWindow {
    /// Device file the window is mapped through.
    pub path: PathBuf,
    /// Physical base address, used as the mapping offset.
    pub base: u64,
    /// Window length in bytes.
    pub len: usize,
    /// Byte offset of the bus attribute register.
    pub bus_attr_offset: usize,
}

impl Default for RegisterWindow {
    fn default() -> Self {
        Self {
            path: PathBuf::from(mmio::DEFAULT_WINDOW_PATH),
            base: mmio::CONTROL_WINDOW_BASE,
            len: mmio::CONTROL_WINDOW_LEN,
            bus_attr_offset: mmio::BUS_ATTR_OFFSET,
        }
    }
}

/// Platform configuration the runtime is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Selects manual cache maintenance instead of the coherent no-op.
    pub manual_cache_flush: bool,
    /// Host cache line size in bytes.
    pub cache_line_size: usize,
    pub transfer_mode: TransferMode,
    /// Raw value programmed into the bus attribute register at start-up.
    pub bus_attributes: Option<u8>,
    pub register_window: Option<RegisterWindow>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            manual_cache_flush: false,
            cache_line_size: cache::CACHE_LINE_SIZE,
            transfer_mode: TransferMode::Bulk,
            bus_attributes: None,
            register_window: None,
        }
    }
}

impl PlatformConfig {
    pub fn with_manual_cache_flush(mut self, manual: bool) -> Self {
        self.manual_cache_flush = manual;
        self
    }

    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    pub fn with_register_window(mut self, window: RegisterWindow) -> Self {
        self.register_window = Some(window);
        self
    }

    pub fn with_bus_attributes(mut self, raw: u8) -> Self {
        self.bus_attributes = Some(raw);
        self
    }

    /// Checks the configuration for values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.cache_line_size.is_power_of_two() || self.cache_line_size < cache::WORD_SIZE {
            return Err(AccelError::Config(format!(
                "cache line size {} must be a power of two of at least {} bytes",
                self.cache_line_size,
                cache::WORD_SIZE
            )));
        }
        if self.bus_attributes.is_some() && self.register_window.is_none() {
            return Err(AccelError::Config(
                "bus attributes configured without a register window".into(),
            ));
        }
        Ok(())
    }
}
