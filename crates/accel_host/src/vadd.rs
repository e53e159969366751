use crate::oracle;
use accel_common::isa;
use accel_core::{CoreSelector, PlatformConfig};
use accel_hw::SimOptions;
use accel_io::loader;
use anyhow::{Result, bail, ensure};
use std::path::PathBuf;
use std::time::Instant;

pub fn run_vadd(
    config: PlatformConfig,
    options: SimOptions,
    len: usize,
    a_path: Option<PathBuf>,
    b_path: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let a = match a_path {
        Some(path) => loader::load_words(path)?,
        None => (0..len as i32).map(|i| i + 1).collect(),
    };
    let b = match b_path {
        Some(path) => loader::load_words(path)?,
        None => (0..len as i32).map(|i| i * 2).collect(),
    };
    ensure!(a.len() == b.len(), "input lengths differ: {} vs {}", a.len(), b.len());
    ensure!(!a.is_empty(), "inputs are empty");
    let n = a.len();

    println!("VECTOR ADD");
    println!("Elements:  {}", n);
    println!("Transfer:  {}", config.transfer_mode);
    println!("Coherency: {}", if config.manual_cache_flush { "manual" } else { "coherent" });
    println!("-------------------------------");

    let mut rt = crate::sim_runtime(config, options)?;
    let start = Instant::now();

    let ha = rt.malloc(n * 4)?;
    let hb = rt.malloc(n * 4)?;
    let hout = rt.malloc(n * 4)?;

    rt.buffers_mut().host_slice_mut::<i32>(ha)?.copy_from_slice(&a);
    rt.buffers_mut().host_slice_mut::<i32>(hb)?.copy_from_slice(&b);

    rt.flush_all(&[ha, hb])?;
    rt.copy_to_device(ha)?;
    rt.copy_to_device(hb)?;

    let token = rt.issue(
        CoreSelector::new(isa::VECTOR_ADD, 0),
        &[ha, hb, hout],
        &[n as u64],
    )?;
    let response = token.wait();
    ensure!(response.success, "accelerator reported failure for token {}", token.id());

    rt.invalidate(hout)?;
    rt.copy_from_device(hout)?;
    let out = rt.buffers().host_slice::<i32>(hout)?.to_vec();
    let elapsed = start.elapsed();

    let expected = oracle::vector_add(&a, &b);
    let mismatches: Vec<usize> = (0..n).filter(|&i| out[i] != expected[i]).collect();

    for (i, value) in out.iter().enumerate().take(8) {
        println!("out[{:2}] = {:6} (expected {})", i, value, expected[i]);
    }
    let stats = rt.transfer_stats();
    println!("Time:          {:?}", elapsed);
    println!("Bulk copies:   {}", stats.bulk_copies);
    println!("Word commands: {}", stats.commands);
    println!("Lines walked:  {}", rt.coherency().lines_walked());

    if let Some(path) = output {
        loader::save_words(&path, &out)?;
        println!("Wrote {}", path.display());
    }

    for h in [ha, hb, hout] {
        rt.free(h)?;
    }

    if !mismatches.is_empty() {
        for &i in mismatches.iter().take(4) {
            tracing::error!(index = i, got = out[i], expected = expected[i], "mismatch");
        }
        bail!("{} of {} elements differ from the golden model", mismatches.len(), n);
    }
    println!("PASS");
    Ok(())
}
