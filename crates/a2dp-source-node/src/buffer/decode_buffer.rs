//! Rate-adaptive decode buffer: a single-producer/single-consumer ring of
//! decoded PCM with drift tracking.
//!
//! The ring itself is a `Vec<u8>` arena with `[read_pos..write_pos)` holding
//! valid bytes; the write side is compacted back to the front whenever the
//! remaining tail space can't satisfy a reservation. Both producer (socket
//! reactor) and consumer (`process`) run on the same data-loop thread, so no
//! synchronization is needed for the bytes themselves. `corr` is exposed
//! through an atomic so a control-thread test harness can observe drift
//! convergence without crossing into the data thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{NodeError, Result};

/// Number of graph quanta the controller tries to keep buffered.
const TARGET_FILL_QUANTA: u32 = 2;

/// Proportional gain of the drift controller.
const CORR_GAIN: f64 = 0.05;

/// How many `process()` samples the smoothing window keeps.
const HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, Copy)]
struct FillSample {
    fill_bytes: usize,
    samples_wanted: u32,
    clock_duration: u32,
}

/// Ring of decoded PCM plus drift compensation state.
pub struct DecodeBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    frame_size: u32,
    rate: u32,
    corr_min: f64,
    corr_max: f64,
    /// `corr` stored as bits of an f64, for lock-free cross-thread reads.
    corr_bits: AtomicU64,
    history: VecDeque<FillSample>,
}

impl DecodeBuffer {
    /// Construct an uninitialized buffer. Call [`init`](Self::init) before use.
    pub fn new() -> Self {
        DecodeBuffer {
            data: Vec::new(),
            read_pos: 0,
            write_pos: 0,
            frame_size: 0,
            rate: 0,
            corr_min: 0.95,
            corr_max: 1.05,
            corr_bits: AtomicU64::new(1.0f64.to_bits()),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Allocate capacity sized for the configured rate and scheduler quantum,
    /// and reset drift state to neutral (`corr = 1.0`).
    ///
    /// Capacity holds roughly `quantum_limit_max` frames worth of headroom on
    /// top of the drift target, so a producer running slightly ahead of the
    /// consumer never forces a reallocation mid-stream.
    pub fn init(
        &mut self,
        frame_size: u32,
        rate: u32,
        quantum_limit_min: u32,
        quantum_limit_max: u32,
    ) -> Result<()> {
        if frame_size == 0 || rate == 0 {
            return Err(NodeError::InvalidArg(
                "decode buffer requires frame_size > 0 and rate > 0".into(),
            ));
        }
        let quantum_limit_max = quantum_limit_max.max(quantum_limit_min).max(1);
        let capacity_frames = (quantum_limit_max as usize) * (TARGET_FILL_QUANTA as usize + 2);
        self.data = vec![0u8; capacity_frames * frame_size as usize];
        self.read_pos = 0;
        self.write_pos = 0;
        self.frame_size = frame_size;
        self.rate = rate;
        self.corr_bits.store(1.0f64.to_bits(), Ordering::Relaxed);
        self.history.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Compact valid bytes back to offset 0, freeing tail space.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    /// Reserve a contiguous write region of up to `max_bytes`. Compacts the
    /// ring first if the tail doesn't have enough free space.
    pub fn get_write(&mut self, max_bytes: usize) -> &mut [u8] {
        if self.capacity() - self.write_pos < max_bytes {
            self.compact();
        }
        let end = (self.write_pos + max_bytes).min(self.capacity());
        &mut self.data[self.write_pos..end]
    }

    /// Commit `n_bytes` previously written via [`get_write`](Self::get_write),
    /// updating the fill-level history used by the drift controller.
    pub fn write_packet(&mut self, n_bytes: usize) {
        self.write_pos = (self.write_pos + n_bytes).min(self.capacity());
    }

    /// Inspect the currently readable region (may be shorter than the total
    /// valid length if a compaction hasn't happened; callers should re-check
    /// after a `read`).
    pub fn get_read(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consume `n_bytes` from the front of the readable region.
    pub fn read(&mut self, n_bytes: usize) {
        self.read_pos = (self.read_pos + n_bytes).min(self.write_pos);
    }

    /// Current correction coefficient, `local_sample_rate / remote_sample_rate`.
    pub fn corr(&self) -> f64 {
        f64::from_bits(self.corr_bits.load(Ordering::Relaxed))
    }

    /// Run the drift controller for one graph tick: compare the current
    /// fill level against a target (a small multiple of one graph quantum)
    /// and update `corr` to narrow the gap, clamped to `[corr_min, corr_max]`.
    pub fn process(&mut self, samples_wanted: u32, clock_duration: u32) {
        let fill_bytes = self.len();

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(FillSample {
            fill_bytes,
            samples_wanted,
            clock_duration,
        });

        let target_frames = (TARGET_FILL_QUANTA * clock_duration.max(1)) as i64;
        let target_bytes = target_frames * self.frame_size.max(1) as i64;
        if target_bytes <= 0 {
            return;
        }

        // Smooth the error over the history window so a single bursty
        // packet doesn't whipsaw the correction coefficient.
        let avg_error: f64 = self
            .history
            .iter()
            .map(|s| (s.fill_bytes as f64 - target_bytes as f64) / target_bytes as f64)
            .sum::<f64>()
            / self.history.len() as f64;

        let corr = (1.0 + CORR_GAIN * avg_error).clamp(self.corr_min, self.corr_max);
        self.corr_bits.store(corr.to_bits(), Ordering::Relaxed);
    }

    /// Re-center drift history after a follower-role change or underrun,
    /// without discarding buffered PCM.
    pub fn recover(&mut self) {
        self.history.clear();
        self.corr_bits.store(1.0f64.to_bits(), Ordering::Relaxed);
    }

    /// Drop all buffered PCM and reset drift state to neutral.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.history.clear();
        self.corr_bits.store(1.0f64.to_bits(), Ordering::Relaxed);
    }
}

impl Default for DecodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
