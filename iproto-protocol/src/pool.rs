//! Bounded free-list of reusable frames.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of idle frames kept by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Frames whose buffer grew beyond this are dropped instead of pooled.
pub const MAX_POOLED_FRAME_BYTES: usize = 1024 * 1024;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames created because the free-list was empty.
    pub allocated: u64,
    /// Acquisitions served from the free-list.
    pub reused: u64,
    /// Frames currently idle in the free-list.
    pub idle: usize,
}

/// A bounded free-list of [`Frame`]s, safe to share between tasks.
///
/// `acquire` hands out an owned frame and `release` takes it back by value,
/// so a frame is never reachable from two holders at once.
#[derive(Debug)]
pub struct FramePool {
    free: Mutex<Vec<Frame>>,
    capacity: usize,
    frame_capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl FramePool {
    /// Creates a pool retaining at most `capacity` idle frames, each
    /// preallocated with `frame_capacity` bytes.
    pub fn new(capacity: usize, frame_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            frame_capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Returns a reset frame, reusing an idle one when available.
    pub fn acquire(&self) -> Frame {
        if let Some(frame) = self.free.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return frame;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Frame::with_capacity(self.frame_capacity)
    }

    /// Returns `frame` to the pool, or drops it if the pool is full.
    pub fn release(&self, mut frame: Frame) {
        if frame.capacity() > MAX_POOLED_FRAME_BYTES {
            return;
        }
        frame.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(frame);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, 8 * 1024)
    }
}
