//! Command execution for the simulated accelerator's systems.
//!
//! Every kernel validates its operands against the live device reservations
//! before touching memory. A command that names an unknown system, carries
//! the wrong number of operands, or reaches outside a reservation completes
//! with a failed response instead of faulting the simulator.

use crate::SimMemory;
use accel_common::isa;
use accel_core::{Command, DeviceAddr, Response};

/// Executes one command against device memory.
pub(crate) fn execute(memory: &mut SimMemory, command: &Command) -> Response {
    match command.selector.system {
        isa::DMA_HELPER => word_command(memory, command),
        isa::VECTOR_ADD => vector_add(memory, command),
        system => {
            tracing::warn!(system = format_args!("{system:#x}"), "unknown accelerator system");
            Response::failed()
        }
    }
}

/// Moves one 32-bit word between the command and device memory.
fn word_command(memory: &mut SimMemory, command: &Command) -> Response {
    let (&[addr], &[value, flag]) = (command.operands.as_slice(), command.scalars.as_slice())
    else {
        tracing::warn!(?command, "malformed word command");
        return Response::failed();
    };

    match flag {
        isa::WORD_WRITE => match memory.store_word(addr, value as u32) {
            Some(()) => Response::ok(0),
            None => reject("word write", addr),
        },
        isa::WORD_READ => match memory.load_word(addr) {
            Some(word) => Response::ok(u64::from(word)),
            None => reject("word read", addr),
        },
        other => {
            tracing::warn!(flag = other, "unknown word command direction");
            Response::failed()
        }
    }
}

/// Element-wise `out[i] = a[i] + b[i]` over `n` signed 32-bit integers.
///
/// Addition wraps on overflow.
fn vector_add(memory: &mut SimMemory, command: &Command) -> Response {
    let (&[a, b, out], &[n, ..]) = (command.operands.as_slice(), command.scalars.as_slice())
    else {
        tracing::warn!(?command, "malformed vector add");
        return Response::failed();
    };
    let len = (n as usize).saturating_mul(4);

    let (Some(lhs), Some(rhs)) = (memory.load(a, len), memory.load(b, len)) else {
        return reject("vector add input", a);
    };
    let sum: Vec<u8> = lhs
        .chunks_exact(4)
        .zip(rhs.chunks_exact(4))
        .flat_map(|(x, y)| {
            let x = i32::from_ne_bytes([x[0], x[1], x[2], x[3]]);
            let y = i32::from_ne_bytes([y[0], y[1], y[2], y[3]]);
            x.wrapping_add(y).to_ne_bytes()
        })
        .collect();

    match memory.store(out, &sum) {
        Some(()) => {
            tracing::debug!(n, %a, %b, %out, "vector add complete");
            Response::ok(n)
        }
        None => reject("vector add output", out),
    }
}

fn reject(what: &str, addr: DeviceAddr) -> Response {
    tracing::warn!(%addr, "{what} outside device reservations");
    Response::failed()
}
