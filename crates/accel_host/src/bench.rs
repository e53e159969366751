use crate::stats::LatencyStats;
use accel_core::{PlatformConfig, TransferMode, TransferStats};
use accel_hw::SimOptions;
use anyhow::Result;
use rayon::prelude::*;
use std::time::Instant;

struct ModeReport {
    mode: TransferMode,
    latency: LatencyStats,
    transfer: TransferStats,
    corrupted: usize,
}

/// Times `iterations` host to device to host round trips of one buffer.
fn bench_mode(
    config: PlatformConfig,
    options: SimOptions,
    size: usize,
    iterations: usize,
) -> Result<ModeReport> {
    let mode = config.transfer_mode;
    let bucket_ns = match mode {
        TransferMode::Bulk => 1_000,
        TransferMode::Word => 100_000,
    };
    let mut rt = crate::sim_runtime(config, options)?;
    let handle = rt.malloc(size)?;
    let mut latency = LatencyStats::new(bucket_ns);
    let mut corrupted = 0;

    for iter in 0..iterations {
        let pattern = iter as u8;
        for (i, b) in rt.buffers_mut().host_bytes_mut(handle)?.iter_mut().enumerate() {
            *b = pattern.wrapping_add(i as u8);
        }

        let start = Instant::now();
        rt.flush(handle)?;
        rt.copy_to_device(handle)?;
        rt.buffers_mut().host_bytes_mut(handle)?.fill(0);
        rt.invalidate(handle)?;
        rt.copy_from_device(handle)?;
        latency.update(start.elapsed().as_nanos() as u64);

        let intact = rt
            .buffers()
            .host_bytes(handle)?
            .iter()
            .enumerate()
            .all(|(i, &b)| b == pattern.wrapping_add(i as u8));
        if !intact {
            corrupted += 1;
        }
    }

    rt.free(handle)?;
    Ok(ModeReport {
        mode,
        latency,
        transfer: rt.transfer_stats(),
        corrupted,
    })
}

pub fn run_bench(
    config: PlatformConfig,
    size: usize,
    iterations: usize,
    unreliable_bulk: bool,
) -> Result<()> {
    println!("TRANSFER BENCHMARK");
    println!("Buffer:     {} bytes", size);
    println!("Iterations: {}", iterations);
    println!("Unreliable bulk: {}", unreliable_bulk);
    println!("-------------------------------");

    let options = SimOptions {
        unreliable_bulk,
        ..SimOptions::default()
    };

    // Each mode gets its own runtime and simulated device.
    let reports = [TransferMode::Bulk, TransferMode::Word]
        .par_iter()
        .map(|&mode| {
            bench_mode(
                config.clone().with_transfer_mode(mode),
                options,
                size,
                iterations,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    for report in &reports {
        report.latency.print_report(&format!("{} round trip", report.mode));
        println!(
            "Bytes moved: {}, word commands: {}, corrupted: {}/{}",
            report.transfer.bytes, report.transfer.commands, report.corrupted, iterations
        );
    }

    if let [bulk, word] = reports.as_slice() {
        if bulk.latency.avg() > 0.0 {
            println!(
                "\nWord fallback costs {:.1}x the bulk round trip",
                word.latency.avg() / bulk.latency.avg()
            );
        }
    }
    Ok(())
}
