//! Append-only latency sample ring
//! Multi-producer writes through an atomic cursor, no per-sample locking

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fixed-capacity array of microsecond samples. Producers reserve a slot with
/// a single atomic increment; samples past the capacity are dropped.
pub struct LatencyRing {
    values: Box<[AtomicU32]>,
    cursor: AtomicU64,
    committed: AtomicU64,
}

impl LatencyRing {
    pub fn new(capacity: u64) -> Self {
        let values = (0..capacity as usize)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            values,
            cursor: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.values.len() as u64
    }

    /// Append one sample, clamped to `u32::MAX` microseconds. Returns false
    /// when the ring is full and the sample was dropped.
    pub fn record(&self, micros: u64) -> bool {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        if index >= self.capacity() {
            return false;
        }
        let sample = micros.min(u64::from(u32::MAX)) as u32;
        self.values[index as usize].store(sample, Ordering::Relaxed);
        self.committed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of committed samples.
    pub fn len(&self) -> u64 {
        self.committed.load(Ordering::Relaxed).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total reservations, including samples dropped past the capacity.
    pub fn reserved(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Snapshot of the committed samples.
    pub fn samples(&self) -> Vec<u32> {
        (0..self.len() as usize)
            .map(|i| self.values[i].load(Ordering::Relaxed))
            .collect()
    }

    /// Serialize `[u64 run time ms][u64 count][count x u32 samples]` into
    /// `out`, little-endian. The exported count is derived from the buffer
    /// capacity. Returns the number of bytes written.
    pub fn write_blob(&self, run_time_ms: u64, out: &mut [u8]) -> usize {
        if out.len() < 16 {
            return 0;
        }
        let count = (((out.len() - 16) / 4) as u64).min(self.len());
        out[..8].copy_from_slice(&run_time_ms.to_le_bytes());
        out[8..16].copy_from_slice(&count.to_le_bytes());
        let mut offset = 16;
        for i in 0..count as usize {
            let sample = self.values[i].load(Ordering::Relaxed);
            out[offset..offset + 4].copy_from_slice(&sample.to_le_bytes());
            offset += 4;
        }
        offset
    }

    /// Parse a blob produced by `write_blob`.
    pub fn read_blob(data: &[u8]) -> Option<(u64, Vec<u32>)> {
        if data.len() < 16 {
            return None;
        }
        let run_time = u64::from_le_bytes(data[..8].try_into().ok()?);
        let count = u64::from_le_bytes(data[8..16].try_into().ok()?) as usize;
        if data.len() < 16 + count * 4 {
            return None;
        }
        let samples = data[16..16 + count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some((run_time, samples))
    }

    /// Sorted percentile summary of the committed samples.
    pub fn summary(&self) -> Option<LatencySummary> {
        let mut samples = self.samples();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let pick = |p: f64| samples[(((samples.len() - 1) as f64) * p).round() as usize];
        Some(LatencySummary {
            p50: pick(0.50),
            p90: pick(0.90),
            p99: pick(0.99),
            p999: pick(0.999),
            max: samples[samples.len() - 1],
            count: samples.len() as u64,
        })
    }
}

/// Percentiles over the recorded samples, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub p50: u32,
    pub p90: u32,
    pub p99: u32,
    pub p999: u32,
    pub max: u32,
    pub count: u64,
}
