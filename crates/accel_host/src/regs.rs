use accel_core::{BusAttributes, PlatformConfig, RegisterAccessor};
use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum RegsOp {
    /// Read the 32-bit register at a byte offset.
    Read {
        #[arg(value_parser = crate::parse_int)]
        offset: u64,
    },
    /// Write a 32-bit register at a byte offset.
    Write {
        #[arg(value_parser = crate::parse_int)]
        offset: u64,
        #[arg(value_parser = crate::parse_int)]
        value: u64,
    },
    /// Show the bus attributes, or program them when a value is given.
    Attrs {
        #[arg(value_parser = crate::parse_int)]
        value: Option<u64>,
    },
}

pub fn run_regs(config: &PlatformConfig, op: RegsOp) -> Result<()> {
    let window = config.register_window.clone().unwrap_or_default();
    // No degraded mode without the window: failure exits here.
    let mut regs = RegisterAccessor::open_or_abort(&window);

    match op {
        RegsOp::Read { offset } => {
            let value = regs.read(usize::try_from(offset)?)?;
            println!("{:#06x}: {:#010x}", offset, value);
        }
        RegsOp::Write { offset, value } => {
            let value = u32::try_from(value)?;
            regs.write(usize::try_from(offset)?, value)?;
            println!("{:#06x} <- {:#010x}", offset, value);
        }
        RegsOp::Attrs { value } => {
            if let Some(raw) = value {
                regs.set_bus_attributes(BusAttributes::from_raw(u32::try_from(raw)?)?)?;
            }
            println!("bus attributes: {}", regs.bus_attributes()?);
        }
    }
    Ok(())
}
