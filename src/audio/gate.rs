use super::meter::peak_amplitude;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Peak amplitude a block must exceed before a segment starts writing audio.
pub const DEFAULT_GATE_THRESHOLD: f32 = 0.02;

const UNSET: u64 = u64::MAX;

/// Latch that opens on the first block whose peak exceeds the threshold.
///
/// One gate is shared by every source of a segment: whichever source speaks
/// first opens it for all of them, and the moment it opened becomes the audio
/// offset used at merge time. It never closes again; a new segment gets a new
/// gate. Lock-free so capture callbacks can call `observe` directly.
#[derive(Debug)]
pub struct SilenceGate {
    threshold: f32,
    capture_started: Instant,
    significant: AtomicBool,
    first_significant_nanos: AtomicU64,
}

impl SilenceGate {
    pub fn new(threshold: f32) -> Self {
        Self::starting_at(threshold, Instant::now())
    }

    pub fn starting_at(threshold: f32, capture_started: Instant) -> Self {
        Self {
            threshold,
            capture_started,
            significant: AtomicBool::new(false),
            first_significant_nanos: AtomicU64::new(UNSET),
        }
    }

    /// Feed one block; returns whether the gate is open after it.
    pub fn observe(&self, samples: &[f32]) -> bool {
        if self.significant.load(Ordering::Acquire) {
            return true;
        }
        if peak_amplitude(samples) <= self.threshold {
            return false;
        }
        self.latch(Instant::now());
        true
    }

    fn latch(&self, at: Instant) {
        let nanos = at
            .saturating_duration_since(self.capture_started)
            .as_nanos()
            .min(u128::from(UNSET - 1)) as u64;
        // First writer wins; later racers keep the earlier timestamp.
        let _ = self.first_significant_nanos.compare_exchange(
            UNSET,
            nanos,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.significant.store(true, Ordering::Release);
    }

    pub fn is_significant(&self) -> bool {
        self.significant.load(Ordering::Acquire)
    }

    /// Time from capture start to the first significant block; zero if the
    /// gate never opened.
    pub fn offset(&self) -> Duration {
        match self.first_significant_nanos.load(Ordering::Acquire) {
            UNSET => Duration::ZERO,
            nanos => Duration::from_nanos(nanos),
        }
    }
}

impl Default for SilenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_THRESHOLD)
    }
}
