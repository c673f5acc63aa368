//! Lock-free SPSC sample rings between the engine and realtime callbacks.
//!
//! Thin wrappers over `rtrb` that move whole slices and never block: a
//! producer writes what fits, a consumer reads what is there.

use rtrb::{Consumer, Producer, RingBuffer};

/// Create a connected producer/consumer pair holding up to `capacity` samples.
pub fn audio_ring_pair(capacity: usize) -> (AudioRingProducer, AudioRingConsumer) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (AudioRingProducer { inner: producer }, AudioRingConsumer { inner: consumer })
}

/// Writing half; owned by exactly one thread.
pub struct AudioRingProducer {
    inner: Producer<f32>,
}

impl AudioRingProducer {
    /// Write as many samples as fit, returning the count written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.inner.slots());
        if n == 0 {
            return 0;
        }
        match self.inner.write_chunk(n) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&samples[..split]);
                second.copy_from_slice(&samples[split..n]);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Free slots.
    pub fn space(&self) -> usize {
        self.inner.slots()
    }

    /// True once the consumer has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }
}

/// Reading half; owned by exactly one thread.
pub struct AudioRingConsumer {
    inner: Consumer<f32>,
}

impl AudioRingConsumer {
    /// Read up to `out.len()` samples, returning the count read.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.inner.slots());
        if n == 0 {
            return 0;
        }
        match self.inner.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..n].copy_from_slice(second);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Drop everything queued.
    pub fn clear(&mut self) -> usize {
        let n = self.inner.slots();
        if let Ok(chunk) = self.inner.read_chunk(n) {
            chunk.commit_all();
        }
        n
    }

    /// Samples ready to read.
    pub fn available(&self) -> usize {
        self.inner.slots()
    }

    /// True once the producer has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }
}
