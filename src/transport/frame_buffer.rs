//! Single-producer/single-consumer capture buffer for polled frames.
//!
//! The receive path (serial reader task, or a UART interrupt on target)
//! pushes bytes while the scheduler tick polls for completion. The buffer
//! is only re-armed by the consumer, right before the next request.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Capacity of the capture buffer in bytes
pub const FRAME_BUFFER_CAPACITY: usize = 32;

/// Bounded capture buffer shared between the receive path and the tick
#[derive(Debug)]
pub struct FrameBuffer {
    data: [AtomicU8; FRAME_BUFFER_CAPACITY],
    size: AtomicUsize,
    position: AtomicUsize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Create an unarmed buffer (expects zero bytes)
    pub fn new() -> Self {
        Self {
            data: std::array::from_fn(|_| AtomicU8::new(0)),
            size: AtomicUsize::new(0),
            position: AtomicUsize::new(0),
        }
    }

    /// Start expecting `len` bytes, discarding anything captured before
    ///
    /// Lengths above [`FRAME_BUFFER_CAPACITY`] are truncated.
    pub fn arm(&self, len: usize) {
        // Close the window first so a concurrent push cannot land in the old frame
        self.size.store(0, Ordering::Release);
        self.position.store(0, Ordering::Release);
        self.size.store(len.min(FRAME_BUFFER_CAPACITY), Ordering::Release);
    }

    /// Receive one byte. Bytes beyond the armed length are dropped.
    ///
    /// Returns `true` if the byte was stored.
    pub fn push(&self, byte: u8) -> bool {
        let position = self.position.load(Ordering::Acquire);
        if position >= self.size.load(Ordering::Acquire) {
            return false;
        }

        self.commit(position, byte)
    }

    /// Store `byte` at `position` and advance, unless `arm` moved the
    /// position in the meantime
    fn commit(&self, position: usize, byte: u8) -> bool {
        self.data[position].store(byte, Ordering::Relaxed);
        self.position
            .compare_exchange(position, position + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bytes captured since the last `arm`
    pub fn bytes_read(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    /// Armed frame length
    pub fn expected_len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// True once exactly the armed number of bytes has been captured
    pub fn is_complete(&self) -> bool {
        self.bytes_read() == self.expected_len()
    }

    /// Copy out the first `N` captured bytes
    pub fn contents<const N: usize>(&self) -> [u8; N] {
        std::array::from_fn(|i| {
            self.data
                .get(i)
                .map(|b| b.load(Ordering::Relaxed))
                .unwrap_or(0)
        })
    }
}
