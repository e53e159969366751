use accel_core::{AccelError, PlatformConfig, Region};
use accel_hw::SimOptions;
use anyhow::{Result, bail, ensure};

const PROBE: u8 = 0xA5;

/// Walks a buffer with manual maintenance, then shows that a region that
/// is not line aligned is refused and leaves its neighbour untouched.
pub fn run_cache(config: PlatformConfig, size: usize) -> Result<()> {
    let config = config.with_manual_cache_flush(true);
    let line = config.cache_line_size;
    let mut rt = crate::sim_runtime(config, SimOptions::default())?;

    let data = rt.malloc(size)?;
    let probe = rt.malloc(line)?;
    rt.buffers_mut().host_bytes_mut(probe)?.fill(PROBE);
    for (i, b) in rt.buffers_mut().host_bytes_mut(data)?.iter_mut().enumerate() {
        *b = (i * 7) as u8;
    }

    println!("CACHE PROBE");
    println!("Line size: {} bytes", line);
    println!("Buffer:    {} bytes ({} padded)", size, rt.buffers().padded_size_of(data)?);
    println!("-------------------------------");

    rt.flush(data)?;
    let after_flush = rt.buffers().host_bytes(data)?.to_vec();
    rt.invalidate(data)?;
    ensure!(
        rt.buffers().host_bytes(data)? == after_flush.as_slice(),
        "invalidate after flush changed buffer contents"
    );
    println!("flush + invalidate: {} lines walked", rt.coherency().lines_walked());

    // One byte past a line boundary, so the walk would spill into the next line.
    let bytes = rt.buffers().host_bytes(data)?;
    let unaligned = Region::of_slice(&bytes[..(line + 1).min(bytes.len())]);
    match rt.coherency().flush(unaligned) {
        Err(e @ AccelError::AlignmentViolation { .. }) => println!("rejected: {e}"),
        Err(e) => return Err(e.into()),
        Ok(()) if unaligned.is_line_aligned(line) => {
            println!("buffer too small to straddle a line; nothing to reject");
        }
        Ok(()) => bail!("unaligned flush of {unaligned:?} was accepted"),
    }

    ensure!(
        rt.buffers().host_bytes(probe)?.iter().all(|&b| b == PROBE),
        "probe buffer was modified"
    );
    println!("probe buffer intact");
    Ok(())
}
