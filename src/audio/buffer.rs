//! Per-source SPSC sample buffer between a device callback and the mix worker.

use crossbeam_channel::{bounded, Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Constructor namespace for a bounded, non-discarding sample queue.
///
/// The ring itself is fixed-size. When it is full the writer keeps the
/// overflow in a local spill queue and offers it again, in order, ahead of the
/// next block, so a slow consumer shows up as latency and never as lost audio.
/// Whatever is still spilled when the writer is dropped is handed to the
/// reader, so the capture side never needs a lock.
pub struct SourceBuffer;

impl SourceBuffer {
    pub fn with_capacity(capacity: usize) -> (SourceWriter, SourceReader) {
        let capacity = capacity.max(1);
        let (producer, consumer) = RingBuffer::<f32>::new(capacity);
        let counters = Arc::new(Counters::default());
        let (handoff_tx, handoff_rx) = bounded(1);
        (
            SourceWriter {
                producer,
                spill: VecDeque::with_capacity(capacity),
                counters: Arc::clone(&counters),
                handoff: Some(handoff_tx),
            },
            SourceReader {
                consumer,
                counters,
                handoff: handoff_rx,
            },
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    read: AtomicU64,
}

/// Producer half; lives inside the capture callback.
pub struct SourceWriter {
    producer: Producer<f32>,
    spill: VecDeque<f32>,
    counters: Arc<Counters>,
    handoff: Option<Sender<Vec<f32>>>,
}

impl SourceWriter {
    /// Copy a block in. Never blocks and never discards.
    pub fn push(&mut self, samples: &[f32]) {
        self.counters
            .written
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        if !self.spill.is_empty() {
            self.drain_spill();
        }
        if !self.spill.is_empty() {
            self.spill.extend(samples.iter().copied());
            return;
        }

        let free = self.producer.slots().min(samples.len());
        let accepted = match self.producer.write_chunk_uninit(free) {
            Ok(chunk) => chunk.fill_from_iter(samples[..free].iter().copied()),
            Err(_) => 0,
        };
        if accepted < samples.len() {
            self.spill.extend(samples[accepted..].iter().copied());
        }
    }

    fn drain_spill(&mut self) {
        let free = self.producer.slots().min(self.spill.len());
        if free == 0 {
            return;
        }
        if let Ok(chunk) = self.producer.write_chunk_uninit(free) {
            let moved = chunk.fill_from_iter(self.spill.drain(..free));
            debug_assert_eq!(moved, free);
        }
    }

    #[cfg(test)]
    fn spilled(&self) -> usize {
        self.spill.len()
    }
}

impl Drop for SourceWriter {
    fn drop(&mut self) {
        self.drain_spill();
        if let Some(handoff) = self.handoff.take() {
            let rest: Vec<f32> = self.spill.drain(..).collect();
            let _ = handoff.try_send(rest);
        }
    }
}

/// Consumer half; owned by the mix worker.
pub struct SourceReader {
    consumer: Consumer<f32>,
    counters: Arc<Counters>,
    handoff: Receiver<Vec<f32>>,
}

impl SourceReader {
    /// Samples ready in the ring.
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Append up to `max` samples to `out`; returns how many. Never blocks.
    pub fn read(&mut self, max: usize, out: &mut Vec<f32>) -> usize {
        let n = self.consumer.slots().min(max);
        if n == 0 {
            return 0;
        }
        match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out.extend_from_slice(first);
                out.extend_from_slice(second);
                chunk.commit_all();
                self.counters.read.fetch_add(n as u64, Ordering::Relaxed);
                n
            }
            Err(_) => 0,
        }
    }

    /// Everything left in the ring.
    pub fn read_all(&mut self, out: &mut Vec<f32>) -> usize {
        let mut total = 0;
        loop {
            let n = self.read(usize::MAX, out);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Spill the writer handed over when it was dropped. Empty while the
    /// writer is alive.
    pub fn take_spill(&mut self) -> Vec<f32> {
        self.handoff.try_recv().unwrap_or_default()
    }

    pub fn total_written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    pub fn total_read(&self) -> u64 {
        self.counters.read.load(Ordering::Relaxed)
    }
}
