//! Movement of buffer contents across the host/device boundary.
//!
//! The engine never performs cache maintenance. Callers flush a buffer
//! before `copy_to_device` and invalidate it before `copy_from_device`.

use crate::allocator::{BufferAllocator, BufferHandle};
use crate::config::TransferMode;
use crate::device::{DeviceAddr, DeviceMemory};
use crate::invoke::{Command, InvocationGateway};
use crate::{AccelError, Result};
use accel_common::cache::WORD_SIZE;
use std::fmt;
use std::sync::Arc;

/// Core of the word-command system used by the fallback path.
const WORD_CORE: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToDevice => f.write_str("to-device"),
            Direction::FromDevice => f.write_str("from-device"),
        }
    }
}

/// One word in flight on the fallback path.
///
/// Lives for a single synchronous round trip and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWord {
    pub index: usize,
    pub direction: Direction,
    pub value: u32,
}

/// Counters for data moved by a transfer engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Bulk block copies performed.
    pub bulk_copies: u64,
    /// Words moved by the fallback path.
    pub words: u64,
    /// Total bytes moved in either mode.
    pub bytes: u64,
    /// Word commands issued to the accelerator.
    pub commands: u64,
}

/// Copies buffers between host and device memory.
pub struct TransferEngine {
    mode: TransferMode,
    device: Arc<dyn DeviceMemory>,
    stats: TransferStats,
}

impl TransferEngine {
    pub fn new(mode: TransferMode, device: Arc<dyn DeviceMemory>) -> Self {
        Self {
            mode,
            device,
            stats: TransferStats::default(),
        }
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Copies a buffer's host contents to its device memory.
    ///
    /// The whole padded buffer is moved so the device side mirrors every
    /// byte the coherency region covers.
    pub fn copy_to_device(
        &mut self,
        buffers: &BufferAllocator,
        gateway: &InvocationGateway,
        handle: BufferHandle,
    ) -> Result<()> {
        let device = buffers.device_address_of(handle)?;
        match self.mode {
            TransferMode::Bulk => {
                let bytes = buffers.padded_bytes(handle)?;
                self.device.write_block(device, bytes)?;
                self.count_bulk(bytes.len());
                tracing::debug!(%handle, %device, len = bytes.len(), "bulk copy to device");
                Ok(())
            }
            TransferMode::Word => {
                // Only the logical words; padding is never observed by callers.
                let size = buffers.size_of(handle)?;
                let bytes = buffers.padded_bytes(handle)?;
                let words = size.div_ceil(WORD_SIZE) * WORD_SIZE;
                self.write_words(gateway, device, &bytes[..words])?;
                tracing::debug!(%handle, %device, words = words / WORD_SIZE, "word copy to device");
                Ok(())
            }
        }
    }

    /// Copies a buffer's device memory back into its host contents.
    pub fn copy_from_device(
        &mut self,
        buffers: &mut BufferAllocator,
        gateway: &InvocationGateway,
        handle: BufferHandle,
    ) -> Result<()> {
        let device = buffers.device_address_of(handle)?;
        match self.mode {
            TransferMode::Bulk => {
                let bytes = buffers.padded_bytes_mut(handle)?;
                self.device.read_block(device, bytes)?;
                let len = bytes.len();
                self.count_bulk(len);
                tracing::debug!(%handle, %device, len, "bulk copy from device");
                Ok(())
            }
            TransferMode::Word => {
                let size = buffers.size_of(handle)?;
                let words = size.div_ceil(WORD_SIZE) * WORD_SIZE;
                let bytes = buffers.padded_bytes_mut(handle)?;
                self.read_words(gateway, device, &mut bytes[..words])?;
                tracing::debug!(%handle, %device, words = words / WORD_SIZE, "word copy from device");
                Ok(())
            }
        }
    }

    fn count_bulk(&mut self, len: usize) {
        self.stats.bulk_copies += 1;
        self.stats.bytes += len as u64;
    }

    /// Writes `bytes` to device memory at `base` one word at a time.
    ///
    /// Words go out in ascending order and each command completes before
    /// the next is issued. A short tail is zero-extended to a full word.
    pub fn write_words(
        &mut self,
        gateway: &InvocationGateway,
        base: DeviceAddr,
        bytes: &[u8],
    ) -> Result<()> {
        for (index, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            let pending = PendingWord {
                index,
                direction: Direction::ToDevice,
                value: u32::from_ne_bytes(word),
            };
            self.round_trip(gateway, base, pending)?;
            self.stats.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    /// Reads device memory at `base` into `out` one word at a time.
    pub fn read_words(
        &mut self,
        gateway: &InvocationGateway,
        base: DeviceAddr,
        out: &mut [u8],
    ) -> Result<()> {
        for (index, chunk) in out.chunks_mut(WORD_SIZE).enumerate() {
            let pending = PendingWord {
                index,
                direction: Direction::FromDevice,
                value: 0,
            };
            let value = self.round_trip(gateway, base, pending)?;
            chunk.copy_from_slice(&value.to_ne_bytes()[..chunk.len()]);
            self.stats.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    /// Issues the command for one word and blocks until it completes.
    fn round_trip(
        &mut self,
        gateway: &InvocationGateway,
        base: DeviceAddr,
        word: PendingWord,
    ) -> Result<u32> {
        let addr = base.offset((word.index * WORD_SIZE) as u64);
        tracing::trace!(?word, %addr, "word transfer");

        let command = match word.direction {
            Direction::ToDevice => Command::word_write(WORD_CORE, addr, word.value),
            Direction::FromDevice => Command::word_read(WORD_CORE, addr),
        };
        let response = gateway.issue_raw(command).wait();
        self.stats.commands += 1;

        if !response.success {
            return Err(AccelError::Device(format!(
                "word {} {} at {addr} failed",
                word.index, word.direction
            )));
        }
        self.stats.words += 1;

        Ok(match word.direction {
            Direction::ToDevice => word.value,
            Direction::FromDevice => response.payload as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CoherencyDomain;
    use crate::device::Accelerator;
    use crate::invoke::{Completer, Response};
    use accel_common::isa;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Word-addressed device that records the order of word commands.
    #[derive(Default)]
    struct WordDevice {
        words: Mutex<BTreeMap<u64, u32>>,
        log: Mutex<Vec<(u64, u64)>>,
        next: Mutex<u64>,
        fail_at: Option<u64>,
    }

    impl DeviceMemory for WordDevice {
        fn reserve(&self, size: usize, _align: usize) -> Result<DeviceAddr> {
            let mut next = self.next.lock().unwrap();
            let addr = 0x2000_0000 + *next;
            *next += size as u64;
            Ok(DeviceAddr(addr))
        }

        fn release(&self, _addr: DeviceAddr) -> Result<()> {
            Ok(())
        }

        fn write_block(&self, addr: DeviceAddr, data: &[u8]) -> Result<()> {
            let mut words = self.words.lock().unwrap();
            for (i, w) in data.chunks_exact(4).enumerate() {
                let value = u32::from_ne_bytes(w.try_into().unwrap());
                words.insert(addr.raw() + 4 * i as u64, value);
            }
            Ok(())
        }

        fn read_block(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<()> {
            let words = self.words.lock().unwrap();
            for (i, w) in out.chunks_exact_mut(4).enumerate() {
                let value = words.get(&(addr.raw() + 4 * i as u64)).copied().unwrap_or(0);
                w.copy_from_slice(&value.to_ne_bytes());
            }
            Ok(())
        }
    }

    impl Accelerator for WordDevice {
        fn submit(&self, command: Command, completer: Completer) {
            assert_eq!(command.selector.system, isa::DMA_HELPER);
            let addr = command.operands[0].raw();
            let flag = command.scalars[1];
            self.log.lock().unwrap().push((addr, flag));
            if Some(addr) == self.fail_at {
                completer.complete(Response::failed());
                return;
            }
            let mut words = self.words.lock().unwrap();
            let payload = if flag == isa::WORD_WRITE {
                words.insert(addr, command.scalars[0] as u32);
                0
            } else {
                u64::from(words.get(&addr).copied().unwrap_or(0))
            };
            completer.complete(Response::ok(payload));
        }
    }

    fn setup(device: WordDevice) -> (Arc<WordDevice>, BufferAllocator, InvocationGateway) {
        let device = Arc::new(device);
        let buffers = BufferAllocator::new(device.clone(), 64, CoherencyDomain::Coherent).unwrap();
        let gateway = InvocationGateway::new(device.clone());
        (device, buffers, gateway)
    }

    #[test]
    fn word_path_issues_one_command_per_word_in_ascending_order() {
        let (device, mut buffers, gateway) = setup(WordDevice::default());
        let h = buffers.allocate(40).unwrap();
        for (i, w) in buffers.host_slice_mut::<u32>(h).unwrap().iter_mut().enumerate() {
            *w = 100 + i as u32;
        }

        let mut engine = TransferEngine::new(TransferMode::Word, device.clone());
        engine.copy_to_device(&buffers, &gateway, h).unwrap();

        let base = buffers.device_address_of(h).unwrap().raw();
        let log = device.log.lock().unwrap().clone();
        let expected: Vec<_> = (0..10).map(|i| (base + 4 * i, isa::WORD_WRITE)).collect();
        assert_eq!(log, expected);
        assert_eq!(engine.stats().commands, 10);
        assert_eq!(engine.stats().words, 10);
        assert_eq!(engine.stats().bytes, 40);
    }

    #[test]
    fn word_round_trip_restores_host_contents() {
        let (device, mut buffers, gateway) = setup(WordDevice::default());
        let h = buffers.allocate(4 * 17).unwrap();
        let values: Vec<i32> = (0..17).map(|i| i * -3 + 5).collect();
        buffers.host_slice_mut::<i32>(h).unwrap().copy_from_slice(&values);

        let mut engine = TransferEngine::new(TransferMode::Word, device);
        engine.copy_to_device(&buffers, &gateway, h).unwrap();
        buffers.host_bytes_mut(h).unwrap().fill(0);
        engine.copy_from_device(&mut buffers, &gateway, h).unwrap();

        assert_eq!(buffers.host_slice::<i32>(h).unwrap(), &values[..]);
    }

    #[test]
    fn partial_tail_word_is_zero_extended() {
        let (device, mut buffers, gateway) = setup(WordDevice::default());
        let h = buffers.allocate(6).unwrap();
        buffers.host_bytes_mut(h).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6]);

        let mut engine = TransferEngine::new(TransferMode::Word, device.clone());
        engine.copy_to_device(&buffers, &gateway, h).unwrap();

        let base = buffers.device_address_of(h).unwrap().raw();
        let words = device.words.lock().unwrap();
        assert_eq!(words[&(base + 4)], u32::from_ne_bytes([5, 6, 0, 0]));
        assert_eq!(device.log.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_word_sequence_issues_nothing() {
        let (device, _buffers, gateway) = setup(WordDevice::default());
        let mut engine = TransferEngine::new(TransferMode::Word, device.clone());
        engine.write_words(&gateway, DeviceAddr(0x2000_0000), &[]).unwrap();
        engine.read_words(&gateway, DeviceAddr(0x2000_0000), &mut []).unwrap();
        assert!(device.log.lock().unwrap().is_empty());
        assert_eq!(engine.stats(), TransferStats::default());
    }

    #[test]
    fn failed_word_stops_the_copy() {
        let (device, mut buffers, gateway) = setup(WordDevice {
            fail_at: Some(0x2000_0008),
            ..WordDevice::default()
        });
        let h = buffers.allocate(64).unwrap();

        let mut engine = TransferEngine::new(TransferMode::Word, device.clone());
        let err = engine.copy_to_device(&buffers, &gateway, h).unwrap_err();
        assert!(matches!(err, AccelError::Device(_)));
        // Nothing after the failing word was issued.
        assert_eq!(device.log.lock().unwrap().len(), 3);
        assert_eq!(engine.stats().words, 2);
    }

    #[test]
    fn bulk_path_moves_the_padded_buffer_in_one_copy() {
        let (device, mut buffers, gateway) = setup(WordDevice::default());
        let h = buffers.allocate(24).unwrap();
        buffers.host_slice_mut::<u32>(h).unwrap().copy_from_slice(&[9, 8, 7, 6, 5, 4]);

        let mut engine = TransferEngine::new(TransferMode::Bulk, device.clone());
        engine.copy_to_device(&buffers, &gateway, h).unwrap();
        buffers.host_bytes_mut(h).unwrap().fill(0);
        engine.copy_from_device(&mut buffers, &gateway, h).unwrap();

        assert_eq!(buffers.host_slice::<u32>(h).unwrap(), &[9, 8, 7, 6, 5, 4]);
        assert!(device.log.lock().unwrap().is_empty());
        assert_eq!(engine.stats().bulk_copies, 2);
        assert_eq!(engine.stats().bytes, 128);
    }

    #[test]
    fn released_handle_is_rejected_before_any_transfer() {
        let (device, mut buffers, gateway) = setup(WordDevice::default());
        let h = buffers.allocate(16).unwrap();
        buffers.release(h).unwrap();

        let mut engine = TransferEngine::new(TransferMode::Word, device.clone());
        assert!(matches!(
            engine.copy_to_device(&buffers, &gateway, h),
            Err(AccelError::InvalidHandle(_))
        ));
        assert!(device.log.lock().unwrap().is_empty());
    }
}
