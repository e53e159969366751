//! Software accelerator for exercising the memory stack without hardware.
//!
//! `SimDevice` implements both device capabilities the core consumes: it
//! owns a block of simulated device memory, handing out reservations from a
//! `DeviceArena`, and it runs a command processor thread that executes
//! submitted commands in order and completes their tokens. The processor
//! understands the word-command helper used by the transfer fallback and an
//! element-wise vector add unit.

mod kernels;

use accel_common::cache::CACHE_LINE_SIZE;
use accel_core::arena::DeviceArena;
use accel_core::{
    AccelError, Accelerator, Command, Completer, DeviceAddr, DeviceMemory, MemorySide, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Fault injection and geometry for a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions {
    /// First device address of simulated memory.
    pub base: u64,
    /// Bulk block copies silently drop every other cache line.
    ///
    /// Models platforms where bulk DMA is unreliable and only the word
    /// fallback moves data correctly. Word commands are unaffected.
    pub unreliable_bulk: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            base: SimDevice::DEFAULT_BASE,
            unreliable_bulk: false,
        }
    }
}

/// Simulated device memory and its reservations.
pub(crate) struct SimMemory {
    bytes: Vec<u8>,
    arena: DeviceArena,
}

impl SimMemory {
    fn offset(&self, addr: DeviceAddr, len: usize) -> Option<usize> {
        self.arena.containing(addr.raw(), len as u64)?;
        Some((addr.raw() - self.arena.base()) as usize)
    }

    pub(crate) fn load(&self, addr: DeviceAddr, len: usize) -> Option<&[u8]> {
        let offset = self.offset(addr, len)?;
        Some(&self.bytes[offset..offset + len])
    }

    pub(crate) fn store(&mut self, addr: DeviceAddr, data: &[u8]) -> Option<()> {
        let offset = self.offset(addr, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Some(())
    }

    pub(crate) fn load_word(&self, addr: DeviceAddr) -> Option<u32> {
        if addr.raw() % 4 != 0 {
            return None;
        }
        let w = self.load(addr, 4)?;
        Some(u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
    }

    pub(crate) fn store_word(&mut self, addr: DeviceAddr, value: u32) -> Option<()> {
        if addr.raw() % 4 != 0 {
            return None;
        }
        self.store(addr, &value.to_ne_bytes())
    }
}

type Job = (Command, Completer);

/// In-process accelerator with its own device memory.
pub struct SimDevice {
    memory: Arc<Mutex<SimMemory>>,
    options: SimOptions,
    queue: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
}

impl SimDevice {
    /// Default first device address.
    pub const DEFAULT_BASE: u64 = 0x1000_0000;

    /// Creates a device with `len` bytes of memory and default options.
    pub fn new(len: usize) -> Result<Self> {
        Self::with_options(len, SimOptions::default())
    }

    /// Creates a device and starts its command processor.
    pub fn with_options(len: usize, options: SimOptions) -> Result<Self> {
        if len == 0 {
            return Err(AccelError::Config("device memory must be non-empty".into()));
        }

        let memory = Arc::new(Mutex::new(SimMemory {
            bytes: vec![0; len],
            arena: DeviceArena::new(options.base, len as u64),
        }));
        let processed = Arc::new(AtomicU64::new(0));
        let (queue, jobs) = mpsc::channel::<Job>();

        let worker = {
            let memory = Arc::clone(&memory);
            let processed = Arc::clone(&processed);
            thread::Builder::new()
                .name("accel-sim".into())
                .spawn(move || {
                    for (command, completer) in jobs {
                        let response = {
                            let mut memory = memory.lock().unwrap_or_else(PoisonError::into_inner);
                            kernels::execute(&mut memory, &command)
                        };
                        processed.fetch_add(1, Ordering::Relaxed);
                        completer.complete(response);
                    }
                    tracing::debug!("command processor stopped");
                })
                .map_err(|e| AccelError::Device(format!("spawn command processor: {e}")))?
        };

        tracing::debug!(
            base = %DeviceAddr(options.base),
            len,
            unreliable_bulk = options.unreliable_bulk,
            "simulated accelerator started"
        );

        Ok(Self {
            memory,
            options,
            queue: Some(queue),
            worker: Some(worker),
            processed,
        })
    }

    pub fn options(&self) -> SimOptions {
        self.options
    }

    /// Number of commands the processor has executed.
    pub fn commands_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Number of live device reservations.
    pub fn live_reservations(&self) -> usize {
        self.memory().arena.live_count()
    }

    fn memory(&self) -> MutexGuard<'_, SimMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceMemory for SimDevice {
    fn reserve(&self, size: usize, align: usize) -> Result<DeviceAddr> {
        self.memory()
            .arena
            .reserve(size as u64, align as u64)
            .map(DeviceAddr)
            .ok_or(AccelError::AllocationFailure {
                side: MemorySide::Device,
                size,
            })
    }

    fn release(&self, addr: DeviceAddr) -> Result<()> {
        self.memory()
            .arena
            .release(addr.raw())
            .map(|_| ())
            .ok_or_else(|| AccelError::Device(format!("{addr} is not a live reservation")))
    }

    fn write_block(&self, addr: DeviceAddr, data: &[u8]) -> Result<()> {
        let mut memory = self.memory();
        if !self.options.unreliable_bulk {
            return memory
                .store(addr, data)
                .ok_or_else(|| AccelError::Device(format!("bulk write at {addr} out of bounds")));
        }

        memory
            .offset(addr, data.len())
            .ok_or_else(|| AccelError::Device(format!("bulk write at {addr} out of bounds")))?;
        for (i, line) in data.chunks(CACHE_LINE_SIZE).enumerate().step_by(2) {
            memory.store(addr.offset((i * CACHE_LINE_SIZE) as u64), line);
        }
        tracing::trace!(%addr, len = data.len(), "bulk write dropped odd lines");
        Ok(())
    }

    fn read_block(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<()> {
        let memory = self.memory();
        let src = memory
            .load(addr, out.len())
            .ok_or_else(|| AccelError::Device(format!("bulk read at {addr} out of bounds")))?;
        if !self.options.unreliable_bulk {
            out.copy_from_slice(src);
            return Ok(());
        }

        for (i, (dst, line)) in out
            .chunks_mut(CACHE_LINE_SIZE)
            .zip(src.chunks(CACHE_LINE_SIZE))
            .enumerate()
        {
            if i % 2 == 0 {
                dst.copy_from_slice(line);
            }
        }
        tracing::trace!(%addr, len = out.len(), "bulk read dropped odd lines");
        Ok(())
    }
}

impl Accelerator for SimDevice {
    fn submit(&self, command: Command, completer: Completer) {
        tracing::trace!(selector = %command.selector, token = completer.token_id(), "command queued");
        if let Some(queue) = &self.queue {
            // A send only fails once the processor is gone; the returned
            // completer is dropped and reports failure.
            let _ = queue.send((command, completer));
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        drop(self.queue.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("command processor panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_common::isa;
    use accel_core::{CoreSelector, InvocationToken, Response};

    fn run(sim: &SimDevice, command: Command) -> Response {
        let (token, completer) = InvocationToken::pending();
        sim.submit(command, completer);
        token.wait()
    }

    #[test]
    fn word_commands_round_trip_through_device_memory() {
        let sim = SimDevice::new(0x1000).unwrap();
        let addr = sim.reserve(64, 64).unwrap();

        assert!(run(&sim, Command::word_write(0, addr.offset(8), 0xfeed)).success);
        assert_eq!(run(&sim, Command::word_read(0, addr.offset(8))), Response::ok(0xfeed));
        assert_eq!(sim.commands_processed(), 2);
    }

    #[test]
    fn commands_outside_reservations_fail() {
        let sim = SimDevice::new(0x1000).unwrap();
        let addr = sim.reserve(64, 64).unwrap();

        assert!(!run(&sim, Command::word_read(0, addr.offset(64))).success);
        assert!(!run(&sim, Command::word_read(0, addr.offset(2))).success);

        let add = Command::new(CoreSelector::new(isa::VECTOR_ADD, 0))
            .operand(addr)
            .operand(addr)
            .operand(addr)
            .scalar(17);
        assert!(!run(&sim, add).success);
    }

    #[test]
    fn unknown_system_completes_as_failed() {
        let sim = SimDevice::new(0x1000).unwrap();
        let response = run(&sim, Command::new(CoreSelector::new(0x7ff, 3)));
        assert_eq!(response, Response::failed());
    }

    #[test]
    fn unreliable_bulk_drops_alternate_lines() {
        let sim = SimDevice::with_options(
            0x1000,
            SimOptions {
                unreliable_bulk: true,
                ..SimOptions::default()
            },
        )
        .unwrap();
        let addr = sim.reserve(256, 64).unwrap();

        sim.write_block(addr, &[0xAB; 256]).unwrap();
        let mut back = [0u8; 256];
        sim.read_block(addr, &mut back).unwrap();

        assert!(back[..64].iter().all(|&b| b == 0xAB));
        assert!(back[64..128].iter().all(|&b| b == 0));
        assert!(back[128..192].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn drop_with_queued_commands_completes_them() {
        let sim = SimDevice::new(0x1000).unwrap();
        let addr = sim.reserve(64, 64).unwrap();
        let tokens: Vec<_> = (0..16)
            .map(|i| {
                let (token, completer) = InvocationToken::pending();
                sim.submit(Command::word_write(0, addr, i), completer);
                token
            })
            .collect();
        drop(sim);
        assert!(tokens.iter().all(|t| t.is_complete()));
    }
}
