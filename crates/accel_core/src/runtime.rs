//! Runtime façade wiring the components together from a configuration.

use crate::allocator::{BufferAllocator, BufferHandle, CoherencyDomain};
use crate::coherency::CoherencyController;
use crate::config::PlatformConfig;
use crate::device::{Accelerator, DeviceMemory};
use crate::invoke::{CoreSelector, InvocationGateway, InvocationToken};
use crate::register::{BusAttributes, RegisterAccessor};
use crate::transfer::{TransferEngine, TransferStats};
use crate::Result;
use std::sync::Arc;

/// One host's view of one accelerator.
///
/// The runtime does not sequence operations for the caller. A complete
/// round trip is: write host memory, `flush`, `copy_to_device`, `issue` and
/// `wait`, `invalidate`, `copy_from_device`, read host memory.
pub struct Runtime {
    config: PlatformConfig,
    registers: Option<RegisterAccessor>,
    coherency: CoherencyController,
    buffers: BufferAllocator,
    transfer: TransferEngine,
    gateway: InvocationGateway,
}

impl Runtime {
    /// Builds a runtime over separate device memory and accelerator
    /// capabilities.
    ///
    /// If the configuration names a register window it is mapped here and,
    /// when configured, the bus attributes are programmed. A window that
    /// cannot be mapped is returned as a fatal `RegisterAccessFailure`.
    pub fn new(
        config: PlatformConfig,
        device: Arc<dyn DeviceMemory>,
        accelerator: Arc<dyn Accelerator>,
    ) -> Result<Self> {
        config.validate()?;

        let registers = match &config.register_window {
            Some(window) => {
                let mut regs = RegisterAccessor::open(window)?;
                if let Some(raw) = config.bus_attributes {
                    regs.set_bus_attributes(BusAttributes::from_raw(u32::from(raw))?)?;
                }
                Some(regs)
            }
            None => None,
        };

        let coherency =
            CoherencyController::new(config.manual_cache_flush, config.cache_line_size)?;
        let domain = if coherency.is_manual() {
            CoherencyDomain::Manual
        } else {
            CoherencyDomain::Coherent
        };
        let buffers = BufferAllocator::new(device.clone(), config.cache_line_size, domain)?;
        let transfer = TransferEngine::new(config.transfer_mode, device);
        let gateway = InvocationGateway::new(accelerator);

        tracing::info!(
            manual = config.manual_cache_flush,
            line = config.cache_line_size,
            mode = %config.transfer_mode,
            registers = registers.is_some(),
            "accelerator runtime initialized"
        );

        Ok(Self {
            config,
            registers,
            coherency,
            buffers,
            transfer,
            gateway,
        })
    }

    /// Builds a runtime over a device that provides both capabilities.
    pub fn with_device<D>(config: PlatformConfig, device: Arc<D>) -> Result<Self>
    where
        D: DeviceMemory + Accelerator + 'static,
    {
        Self::new(config, device.clone(), device)
    }

    pub fn malloc(&mut self, size: usize) -> Result<BufferHandle> {
        self.buffers.allocate(size)
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers.release(handle)
    }

    /// Flushes the whole (padded) buffer.
    pub fn flush(&self, handle: BufferHandle) -> Result<()> {
        self.coherency.flush(self.buffers.region_of(handle)?)
    }

    /// Invalidates the whole (padded) buffer.
    pub fn invalidate(&self, handle: BufferHandle) -> Result<()> {
        self.coherency.invalidate(self.buffers.region_of(handle)?)
    }

    pub fn flush_all(&self, handles: &[BufferHandle]) -> Result<()> {
        let regions = handles
            .iter()
            .map(|&h| self.buffers.region_of(h))
            .collect::<Result<Vec<_>>>()?;
        self.coherency.flush_all(&regions)
    }

    pub fn invalidate_all(&self, handles: &[BufferHandle]) -> Result<()> {
        let regions = handles
            .iter()
            .map(|&h| self.buffers.region_of(h))
            .collect::<Result<Vec<_>>>()?;
        self.coherency.invalidate_all(&regions)
    }

    pub fn copy_to_device(&mut self, handle: BufferHandle) -> Result<()> {
        self.transfer
            .copy_to_device(&self.buffers, &self.gateway, handle)
    }

    pub fn copy_from_device(&mut self, handle: BufferHandle) -> Result<()> {
        self.transfer
            .copy_from_device(&mut self.buffers, &self.gateway, handle)
    }

    /// Issues a command over `operands` and returns its pending token.
    pub fn issue(
        &self,
        selector: CoreSelector,
        operands: &[BufferHandle],
        scalars: &[u64],
    ) -> Result<InvocationToken> {
        self.gateway
            .issue(&self.buffers, selector, operands, scalars)
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn buffers(&self) -> &BufferAllocator {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BufferAllocator {
        &mut self.buffers
    }

    pub fn coherency(&self) -> &CoherencyController {
        &self.coherency
    }

    pub fn gateway(&self) -> &InvocationGateway {
        &self.gateway
    }

    pub fn registers(&self) -> Option<&RegisterAccessor> {
        self.registers.as_ref()
    }

    pub fn registers_mut(&mut self) -> Option<&mut RegisterAccessor> {
        self.registers.as_mut()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfer.stats()
    }
}
