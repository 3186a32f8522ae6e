// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Transfer statistics
//!
//! Per-direction request counts, byte totals and latency, plus error counts
//! by kind. Rates are computed between consecutive snapshots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use picoevb::control::Op;
use picoevb::{Error, TransferOutcome};

const BUCKETS: usize = 16;

/// Upper bound of each latency bucket in nanoseconds, doubling from 8 µs
const LATENCY_BUCKETS: [u64; BUCKETS] = {
    let mut bounds = [0u64; BUCKETS];
    let mut i = 0;
    while i < BUCKETS - 1 {
        bounds[i] = 8_000 << i;
        i += 1;
    }
    bounds[BUCKETS - 1] = u64::MAX;
    bounds
};

/// Which way a request moved data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    H2c,
    C2h,
    H2c2h,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::H2c, Direction::C2h, Direction::H2c2h];

    pub fn from_op(op: Op) -> Option<Self> {
        match op {
            Op::H2cDma => Some(Direction::H2c),
            Op::C2hDma => Some(Direction::C2h),
            Op::H2c2hDma => Some(Direction::H2c2h),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Direction::H2c => "h2c",
            Direction::C2h => "c2h",
            Direction::H2c2h => "h2c2h",
        }
    }
}

struct DirectionCounters {
    ops: AtomicU64,
    bytes: AtomicU64,
    chunks: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    histogram: [AtomicU64; BUCKETS],
}

impl DirectionCounters {
    const fn new() -> Self {
        Self {
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            histogram: [const { AtomicU64::new(0) }; BUCKETS],
        }
    }

    fn record(&self, outcome: &TransferOutcome) {
        let ns = u64::try_from(outcome.elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(outcome.report.bytes, Ordering::Relaxed);
        self.chunks.fetch_add(outcome.report.chunks, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);

        let bucket = LATENCY_BUCKETS
            .iter()
            .position(|&bound| ns <= bound)
            .unwrap_or(BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket bound holding the percentile, never above the largest sample
    fn percentile(&self, per_mille: u64) -> Duration {
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        let counts: Vec<u64> = self
            .histogram
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let threshold = (total * per_mille).div_ceil(1000);
        let mut cumulative = 0;
        for (i, count) in counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= threshold {
                return Duration::from_nanos(LATENCY_BUCKETS[i].min(max_ns));
            }
        }
        Duration::from_nanos(max_ns)
    }

    fn reset(&self) {
        self.ops.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.chunks.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Copy)]
struct RateMark {
    time: Instant,
    bytes: [u64; 3],
}

/// Request and error counters shared by every client
pub struct DmaStats {
    directions: [DirectionCounters; 3],
    invalid: AtomicU64,
    faults: AtomicU64,
    hardware: AtomicU64,
    interrupted: AtomicU64,
    other: AtomicU64,
    last: Mutex<Option<RateMark>>,
}

/// Counters for one direction at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionReport {
    pub direction: Direction,
    pub ops: u64,
    pub bytes: u64,
    pub chunks: u64,
    pub mib_per_sec: f64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub p50_latency: Duration,
    pub p99_latency: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub directions: Vec<DirectionReport>,
    pub invalid: u64,
    pub faults: u64,
    pub hardware_errors: u64,
    pub interrupted: u64,
    pub other_errors: u64,
}

impl DmaStats {
    pub const fn new() -> Self {
        Self {
            directions: [const { DirectionCounters::new() }; 3],
            invalid: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            hardware: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
            other: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn record_transfer(&self, direction: Direction, outcome: &TransferOutcome) {
        self.directions[direction.index()].record(outcome);
    }

    pub fn record_error(&self, err: &Error) {
        let counter = match err {
            Error::InvalidArgument(_) => &self.invalid,
            Error::Fault => &self.faults,
            Error::Hardware { .. } => &self.hardware,
            Error::Interrupted | Error::Cancelled(_) => &self.interrupted,
            Error::OutOfMemory => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsReport {
        let now = Instant::now();
        let bytes: [u64; 3] =
            std::array::from_fn(|i| self.directions[i].bytes.load(Ordering::Relaxed));

        let rates: [f64; 3] = {
            let mut last = self.last.lock();
            let rates = match *last {
                Some(mark) => {
                    let secs = now.duration_since(mark.time).as_secs_f64();
                    std::array::from_fn(|i| {
                        if secs > 0.0 {
                            bytes[i].saturating_sub(mark.bytes[i]) as f64 / secs / (1024.0 * 1024.0)
                        } else {
                            0.0
                        }
                    })
                }
                None => [0.0; 3],
            };
            *last = Some(RateMark { time: now, bytes });
            rates
        };

        let directions = Direction::ALL
            .iter()
            .map(|&direction| {
                let c = &self.directions[direction.index()];
                let ops = c.ops.load(Ordering::Relaxed);
                let total_ns = c.total_ns.load(Ordering::Relaxed);
                let min_ns = c.min_ns.load(Ordering::Relaxed);
                DirectionReport {
                    direction,
                    ops,
                    bytes: bytes[direction.index()],
                    chunks: c.chunks.load(Ordering::Relaxed),
                    mib_per_sec: rates[direction.index()],
                    avg_latency: if ops > 0 {
                        Duration::from_nanos(total_ns / ops)
                    } else {
                        Duration::ZERO
                    },
                    min_latency: if min_ns == u64::MAX {
                        Duration::ZERO
                    } else {
                        Duration::from_nanos(min_ns)
                    },
                    max_latency: Duration::from_nanos(c.max_ns.load(Ordering::Relaxed)),
                    p50_latency: c.percentile(500),
                    p99_latency: c.percentile(990),
                }
            })
            .collect();

        StatsReport {
            directions,
            invalid: self.invalid.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            hardware_errors: self.hardware.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            other_errors: self.other.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for direction in &self.directions {
            direction.reset();
        }
        for counter in [
            &self.invalid,
            &self.faults,
            &self.hardware,
            &self.interrupted,
            &self.other,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.last.lock() = None;
    }
}

impl Default for DmaStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsReport {
    pub fn total_ops(&self) -> u64 {
        self.directions.iter().map(|d| d.ops).sum()
    }

    pub fn direction(&self, direction: Direction) -> Option<&DirectionReport> {
        self.directions.iter().find(|d| d.direction == direction)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.directions {
            writeln!(
                f,
                "{:<6} ops {:>10} bytes {:>14} chunks {:>10} {:>9.2} MiB/s avg {:?} min {:?} max {:?} p50 {:?} p99 {:?}",
                d.direction.name(),
                d.ops,
                d.bytes,
                d.chunks,
                d.mib_per_sec,
                d.avg_latency,
                d.min_latency,
                d.max_latency,
                d.p50_latency,
                d.p99_latency,
            )?;
        }
        writeln!(
            f,
            "errors invalid {} fault {} hardware {} interrupted {} other {}",
            self.invalid, self.faults, self.hardware_errors, self.interrupted, self.other_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picoevb::regs::Channel;
    use picoevb::TransferReport;

    fn outcome(bytes: u64, micros: u64) -> TransferOutcome {
        TransferOutcome {
            report: TransferReport { chunks: 1, bytes },
            elapsed: Duration::from_micros(micros),
        }
    }

    #[test]
    fn test_bucket_bounds_double() {
        assert_eq!(LATENCY_BUCKETS[0], 8_000);
        assert_eq!(LATENCY_BUCKETS[1], 16_000);
        assert_eq!(LATENCY_BUCKETS[BUCKETS - 2], 8_000 << (BUCKETS - 2));
        assert_eq!(LATENCY_BUCKETS[BUCKETS - 1], u64::MAX);
    }

    #[test]
    fn test_per_direction_totals() {
        let stats = DmaStats::new();
        stats.record_transfer(Direction::H2c, &outcome(4096, 10));
        stats.record_transfer(Direction::H2c, &outcome(8192, 30));
        stats.record_transfer(Direction::H2c2h, &outcome(100, 5));

        let report = stats.snapshot();
        assert_eq!(report.total_ops(), 3);

        let h2c = report.direction(Direction::H2c).unwrap();
        assert_eq!(h2c.ops, 2);
        assert_eq!(h2c.bytes, 12288);
        assert_eq!(h2c.avg_latency, Duration::from_micros(20));
        assert_eq!(h2c.min_latency, Duration::from_micros(10));
        assert_eq!(h2c.max_latency, Duration::from_micros(30));
        assert_eq!(h2c.p50_latency, Duration::from_nanos(16_000));
        assert_eq!(h2c.p99_latency, Duration::from_micros(30));

        let c2h = report.direction(Direction::C2h).unwrap();
        assert_eq!(c2h.ops, 0);
        assert_eq!(c2h.min_latency, Duration::ZERO);
        assert_eq!(c2h.p99_latency, Duration::ZERO);
    }

    #[test]
    fn test_slow_transfer_percentile_capped_at_max() {
        let stats = DmaStats::new();
        stats.record_transfer(Direction::C2h, &outcome(1 << 20, 2_000_000));

        let report = stats.snapshot();
        let c2h = report.direction(Direction::C2h).unwrap();
        assert_eq!(c2h.max_latency, Duration::from_secs(2));
        assert_eq!(c2h.p50_latency, Duration::from_secs(2));
        assert_eq!(c2h.p99_latency, Duration::from_secs(2));
    }

    #[test]
    fn test_error_kinds() {
        let stats = DmaStats::new();
        stats.record_error(&Error::InvalidArgument("flags"));
        stats.record_error(&Error::Fault);
        stats.record_error(&Error::Interrupted);
        stats.record_error(&Error::Cancelled(Channel::C2h));
        stats.record_error(&Error::Hardware {
            channel: Channel::H2c,
            status: 0x200,
        });

        let report = stats.snapshot();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.faults, 1);
        assert_eq!(report.interrupted, 2);
        assert_eq!(report.hardware_errors, 1);
        assert_eq!(report.other_errors, 0);
        assert!(report.to_string().contains("hardware 1"));

        stats.reset();
        let report = stats.snapshot();
        assert_eq!(report.interrupted, 0);
        assert_eq!(report.total_ops(), 0);
    }

    #[test]
    fn test_direction_from_op() {
        assert_eq!(Direction::from_op(Op::H2c2hDma), Some(Direction::H2c2h));
        assert_eq!(Direction::from_op(Op::C2hDma), Some(Direction::C2h));
        assert_eq!(Direction::from_op(Op::Led), None);
    }
}
