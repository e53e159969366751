//! Latency statistics for transfer round trips.

const BUCKETS: usize = 20;

/// Running latency summary with a fixed-width histogram.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    /// Width of one histogram bucket in nanoseconds.
    pub bucket_ns: u64,
    pub buckets: [u64; BUCKETS],
}

impl LatencyStats {
    pub fn new(bucket_ns: u64) -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            bucket_ns: bucket_ns.max(1),
            buckets: [0; BUCKETS],
        }
    }

    /// Records one round trip. The last bucket collects everything slower.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = (nanos / self.bucket_ns).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn print_report(&self, label: &str) {
        println!("\n{label}");
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }

        let (scale, unit) = if self.avg() < 1000.0 { (1.0, "ns") } else { (1000.0, "us") };
        println!("Min:   {:.2} {unit}", self.min as f64 / scale);
        println!("Avg:   {:.2} {unit}", self.avg() / scale);
        println!("Max:   {:.2} {unit}", self.max as f64 / scale);

        let width_us = self.bucket_ns as f64 / 1000.0;
        println!("Distribution ({width_us:.0}us buckets):");
        for (i, &count) in self.buckets.iter().enumerate().filter(|(_, c)| **c > 0) {
            let open = if i == BUCKETS - 1 { ">" } else { "" };
            println!(
                "[{:6.0}-{:6.0}{open} us]: {count}",
                i as f64 * width_us,
                (i + 1) as f64 * width_us
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarizes_and_buckets() {
        let mut stats = LatencyStats::new(1_000);
        for ns in [500, 1_500, 2_500, 1_000_000] {
            stats.update(ns);
        }
        assert_eq!(stats.min, 500);
        assert_eq!(stats.max, 1_000_000);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.buckets[0], 1);
        assert_eq!(stats.buckets[1], 1);
        assert_eq!(stats.buckets[BUCKETS - 1], 1);
    }
}
