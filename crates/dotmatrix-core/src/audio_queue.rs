use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer/single-consumer ring of interleaved stereo i16 frames.
///
/// The emulation thread pushes, the audio callback pops; neither ever takes
/// a lock. When the ring is full the newest frames are dropped, so a stalled
/// consumer can never wedge emulation.
pub struct PcmProducer {
    ring: Arc<Ring>,
}

#[derive(Clone)]
pub struct PcmConsumer {
    ring: Arc<Ring>,
}

struct Ring {
    // One slot is kept empty so head == tail always means "empty".
    slots: Box<[UnsafeCell<MaybeUninit<[i16; 2]>>]>,
    cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// The producer only writes slots[head] and the consumer only reads
// slots[tail]; the atomics order those accesses.
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

impl Ring {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            self.cap - tail + head
        }
    }

    #[inline]
    fn wrap(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.cap { 0 } else { next }
    }
}

/// Build a connected producer/consumer pair holding `capacity` frames.
pub fn pcm_ring(capacity: usize) -> (PcmProducer, PcmConsumer) {
    let cap = capacity.max(1) + 1;
    let mut slots = Vec::with_capacity(cap);
    slots.resize_with(cap, || UnsafeCell::new(MaybeUninit::uninit()));

    let ring = Arc::new(Ring {
        slots: slots.into_boxed_slice(),
        cap,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });

    (
        PcmProducer {
            ring: Arc::clone(&ring),
        },
        PcmConsumer { ring },
    )
}

impl PcmProducer {
    /// Push one stereo frame. Returns false (dropping the frame) when full.
    #[inline]
    pub fn push(&self, left: i16, right: i16) -> bool {
        let head = self.ring.head.load(Ordering::Relaxed);
        let next = self.ring.wrap(head);
        if next == self.ring.tail.load(Ordering::Acquire) {
            return false;
        }
        unsafe {
            (*self.ring.slots[head].get()).write([left, right]);
        }
        self.ring.head.store(next, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PcmConsumer {
    /// Pop one stereo frame, or None when the ring has drained.
    #[inline]
    pub fn pop(&self) -> Option<(i16, i16)> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        if tail == self.ring.head.load(Ordering::Acquire) {
            return None;
        }
        let frame = unsafe { (*self.ring.slots[tail].get()).assume_init_read() };
        self.ring.tail.store(self.ring.wrap(tail), Ordering::Release);
        Some((frame[0], frame[1]))
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
