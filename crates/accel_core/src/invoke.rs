//! Command issue and completion tokens.
//!
//! A command names a core of an accelerator system and carries the device
//! addresses of its operand buffers plus scalar parameters. Issuing it
//! returns an `InvocationToken` in the pending state; the accelerator holds
//! the matching `Completer` and moves the token to complete exactly once.
//! There is no cancellation and no timeout: `wait` blocks until completion.

use crate::allocator::{BufferAllocator, BufferHandle};
use crate::device::{Accelerator, DeviceAddr};
use crate::Result;
use accel_common::isa;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Addresses one core of one accelerator system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreSelector {
    pub system: u16,
    pub core: u16,
}

impl CoreSelector {
    pub const fn new(system: u16, core: u16) -> Self {
        Self { system, core }
    }
}

impl fmt::Display for CoreSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.system, self.core)
    }
}

/// A command submitted to the accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub selector: CoreSelector,
    pub operands: Vec<DeviceAddr>,
    pub scalars: Vec<u64>,
}

impl Command {
    /// Command for `selector` with no operands or scalars.
    pub fn new(selector: CoreSelector) -> Self {
        Self {
            selector,
            operands: Vec::new(),
            scalars: Vec::new(),
        }
    }

    /// Appends a device buffer operand.
    pub fn operand(mut self, addr: DeviceAddr) -> Self {
        self.operands.push(addr);
        self
    }

    /// Appends a scalar argument.
    pub fn scalar(mut self, value: u64) -> Self {
        self.scalars.push(value);
        self
    }

    /// Word command writing `value` to the 32-bit word at `addr`.
    pub fn word_write(core: u16, addr: DeviceAddr, value: u32) -> Self {
        Self::new(CoreSelector::new(isa::DMA_HELPER, core))
            .operand(addr)
            .scalar(u64::from(value))
            .scalar(isa::WORD_WRITE)
    }

    /// Word command reading the 32-bit word at `addr` into the response
    /// payload.
    pub fn word_read(core: u16, addr: DeviceAddr) -> Self {
        Self::new(CoreSelector::new(isa::DMA_HELPER, core))
            .operand(addr)
            .scalar(0)
            .scalar(isa::WORD_READ)
    }
}

/// Result payload reported by the accelerator on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
    pub payload: u64,
}

impl Response {
    /// Successful response carrying `payload`.
    pub fn ok(payload: u64) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    /// Failed response with an empty payload.
    pub fn failed() -> Self {
        Self {
            success: false,
            payload: 0,
        }
    }
}

/// Lifecycle state of an invocation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Complete,
}

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Completion {
    id: u64,
    result: Mutex<Option<Response>>,
    ready: Condvar,
}

impl Completion {
    /// Stores the response if none is stored yet and wakes all waiters.
    fn fill(&self, response: Response) -> bool {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::warn!(token = self.id, "ignoring second completion");
            return false;
        }
        *slot = Some(response);
        self.ready.notify_all();
        true
    }
}

/// Observation handle for one outstanding accelerator command.
///
/// Clones observe the same completion event.
#[derive(Debug, Clone)]
pub struct InvocationToken {
    inner: Arc<Completion>,
}

impl InvocationToken {
    /// Creates a pending token and the completer that resolves it.
    pub fn pending() -> (InvocationToken, Completer) {
        let inner = Arc::new(Completion {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let completer = Completer {
            inner: Some(Arc::clone(&inner)),
        };
        (InvocationToken { inner }, completer)
    }

    /// Process-unique identifier of this token.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Blocks the calling thread until the accelerator reports completion.
    ///
    /// Waiting again, or from a clone, returns the same response.
    pub fn wait(&self) -> Response {
        let mut slot = self
            .inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(response) = *slot {
                return response;
            }
            slot = self
                .inner
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns the response if the command has completed.
    pub fn try_result(&self) -> Option<Response> {
        *self
            .inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TokenState {
        match self.try_result() {
            Some(_) => TokenState::Complete,
            None => TokenState::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == TokenState::Complete
    }
}

/// Accelerator-side handle that completes one token.
///
/// Completing consumes the completer, so a token moves from pending to
/// complete exactly once. A completer dropped without completing reports a
/// failed response so that waiters are not stranded by a vanished device.
#[derive(Debug)]
pub struct Completer {
    inner: Option<Arc<Completion>>,
}

impl Completer {
    /// Identifier of the token this completer resolves.
    pub fn token_id(&self) -> u64 {
        self.inner.as_ref().map_or(0, |c| c.id)
    }

    pub fn complete(mut self, response: Response) {
        if let Some(inner) = self.inner.take() {
            tracing::trace!(token = inner.id, ?response, "completing token");
            inner.fill(response);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::warn!(token = inner.id, "completer dropped without completion");
            inner.fill(Response::failed());
        }
    }
}

/// Issues commands to the accelerator.
pub struct InvocationGateway {
    accelerator: Arc<dyn Accelerator>,
    issued: AtomicU64,
}

impl InvocationGateway {
    pub fn new(accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            accelerator,
            issued: AtomicU64::new(0),
        }
    }

    /// Issues a command over a set of buffers and scalar parameters.
    ///
    /// Operand buffers are resolved to their device addresses in order. An
    /// unknown or released handle fails with `InvalidHandle` before anything
    /// reaches the accelerator.
    pub fn issue(
        &self,
        buffers: &BufferAllocator,
        selector: CoreSelector,
        operands: &[BufferHandle],
        scalars: &[u64],
    ) -> Result<InvocationToken> {
        let mut command = Command::new(selector);
        for &handle in operands {
            command.operands.push(buffers.device_address_of(handle)?);
        }
        command.scalars.extend_from_slice(scalars);

        tracing::debug!(
            %selector,
            operands = command.operands.len(),
            scalars = command.scalars.len(),
            "issuing command"
        );
        Ok(self.issue_raw(command))
    }

    /// Submits a fully formed command.
    pub fn issue_raw(&self, command: Command) -> InvocationToken {
        let (token, completer) = InvocationToken::pending();
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.accelerator.submit(command, completer);
        token
    }

    /// Number of commands issued through this gateway.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn token_is_pending_until_completed() {
        let (token, completer) = InvocationToken::pending();
        assert_eq!(token.state(), TokenState::Pending);
        assert_eq!(token.try_result(), None);

        completer.complete(Response::ok(7));
        assert_eq!(token.state(), TokenState::Complete);
        assert_eq!(token.try_result(), Some(Response::ok(7)));
    }

    #[test]
    fn wait_is_idempotent_across_clones() {
        let (token, completer) = InvocationToken::pending();
        let observer = token.clone();

        let device = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(Response::ok(42));
        });

        assert_eq!(token.wait(), Response::ok(42));
        assert_eq!(token.wait(), Response::ok(42));
        assert_eq!(observer.wait(), Response::ok(42));
        device.join().unwrap();
    }

    #[test]
    fn dropped_completer_reports_failure() {
        let (token, completer) = InvocationToken::pending();
        drop(completer);
        assert_eq!(token.wait(), Response::failed());
    }

    #[test]
    fn word_commands_target_the_dma_helper() {
        let write = Command::word_write(0, DeviceAddr(0x100), 0xdead_beef);
        assert_eq!(write.selector, CoreSelector::new(isa::DMA_HELPER, 0));
        assert_eq!(write.operands, vec![DeviceAddr(0x100)]);
        assert_eq!(write.scalars, vec![0xdead_beef, isa::WORD_WRITE]);

        let read = Command::word_read(0, DeviceAddr(0x104));
        assert_eq!(read.scalars[1], isa::WORD_READ);
    }
}
