//! Frames and the pre-event ring buffer.
//!
//! - `Frame`: RGB8 pixel buffer tagged with its camera and capture time.
//!   Exclusively owned; a second destination gets `Frame::duplicate()`.
//! - `RingBuffer`: fixed-capacity circular buffer of the most recent frames,
//!   drained oldest-first when a recording starts.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// Bytes per pixel of the frame layout (RGB8).
pub const BYTES_PER_PIXEL: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Raw image frame.
///
/// Not `Clone`. `duplicate()` makes an independent copy with its own
/// backing buffer for consumers that keep a frame past the current tick.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    camera: Arc<str>,
}

impl Frame {
    pub fn new(camera: Arc<str>, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::with_timestamp(camera, data, width, height, SystemTime::now())
    }

    pub fn with_timestamp(
        camera: Arc<str>,
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: SystemTime,
    ) -> Self {
        Self {
            data,
            width,
            height,
            captured_at,
            camera,
        }
    }

    /// Deep copy with an independent pixel buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
            camera: Arc::clone(&self.camera),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Empty frames cannot size a sink.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// True when the buffer length matches `width * height * 3`.
    pub fn is_well_formed(&self) -> bool {
        !self.is_empty()
            && self.data.len() == self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

// ----------------------------------------------------------------------------
// RingBuffer: pre-event frames
// ----------------------------------------------------------------------------

/// Computes `round(fps * seconds)`, the number of frames covering a window.
pub fn frames_for(fps: f64, seconds: f64) -> usize {
    if !fps.is_finite() || !seconds.is_finite() || fps <= 0.0 || seconds <= 0.0 {
        return 0;
    }
    (fps * seconds).round() as usize
}

struct Slots {
    slots: Vec<Option<Frame>>,
    /// Next slot to write.
    cursor: usize,
    occupied: usize,
    closed: bool,
}

/// Fixed-capacity circular buffer of the most recent frames.
///
/// Internally synchronized: inserts from the monitor loop and drains at
/// recording start take the same lock.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Slots>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            capacity,
            inner: Mutex::new(Slots {
                slots,
                cursor: 0,
                occupied: 0,
                closed: false,
            }),
        }
    }

    /// Buffer sized for `pre_buffer_seconds` of frames at `fps`.
    pub fn for_window(fps: f64, pre_buffer_seconds: f64) -> Self {
        Self::new(frames_for(fps, pre_buffer_seconds))
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Slot state is updated in single assignments; a panic elsewhere
        // cannot leave it half written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a frame, releasing the oldest occupant when full.
    pub fn insert(&self, frame: Frame) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let cursor = inner.cursor;
        let evicted = inner.slots[cursor].replace(frame);
        if evicted.is_none() {
            inner.occupied += 1;
        }
        inner.cursor = (cursor + 1) % self.capacity;
        drop(inner);
        // Release the evicted frame outside the lock.
        drop(evicted);
    }

    /// Visit occupied slots oldest-first without modifying the buffer.
    ///
    /// The lock is held for the whole visit, so the visitor must not call
    /// back into this buffer.
    pub fn drain_with<F: FnMut(&Frame)>(&self, mut visit: F) {
        let inner = self.lock();
        if self.capacity == 0 {
            return;
        }
        // When the buffer has wrapped, the cursor points at the oldest frame.
        let start = if inner.occupied == self.capacity {
            inner.cursor
        } else {
            0
        };
        for offset in 0..self.capacity {
            if let Some(frame) = &inner.slots[(start + offset) % self.capacity] {
                visit(frame);
            }
        }
    }

    /// Duplicates of every buffered frame, oldest first.
    pub fn drain(&self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(self.len());
        self.drain_with(|frame| frames.push(frame.duplicate()));
        frames
    }

    /// First non-empty frame in chronological order, as `(width, height)`.
    pub fn first_valid_dimensions(&self) -> Option<(u32, u32)> {
        let mut dims = None;
        self.drain_with(|frame| {
            if dims.is_none() && !frame.is_empty() {
                dims = Some((frame.width, frame.height));
            }
        });
        dims
    }

    /// Release every held frame. Later inserts are ignored.
    pub fn close(&self) {
        let released: Vec<Frame> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.occupied = 0;
            inner.cursor = 0;
            inner.slots.iter_mut().filter_map(Option::take).collect()
        };
        log::debug!("ring buffer closed, released {} frames", released.len());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .flatten()
            .map(Frame::byte_len)
            .sum()
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_frame(tag: u8) -> Frame {
        Frame::new(Arc::from("test-cam"), vec![tag; 2 * 2 * 3], 2, 2)
    }

    fn tags(buffer: &RingBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        buffer.drain_with(|frame| out.push(frame.pixels()[0]));
        out
    }

    #[test]
    fn capacity_is_rounded_window() {
        assert_eq!(frames_for(30.0, 2.0), 60);
        assert_eq!(frames_for(29.97, 1.0), 30);
        assert_eq!(frames_for(10.0, 0.0), 0);
        assert_eq!(frames_for(0.0, 5.0), 0);
        assert_eq!(RingBuffer::for_window(10.0, 2.0).capacity(), 20);
    }

    #[test]
    fn drain_returns_last_capacity_frames_in_order() {
        let buffer = RingBuffer::new(4);
        for tag in 0..11u8 {
            buffer.insert(tagged_frame(tag));
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(tags(&buffer), vec![7, 8, 9, 10]);
        // Draining does not consume.
        assert_eq!(tags(&buffer), vec![7, 8, 9, 10]);
    }

    #[test]
    fn partial_fill_drains_in_insertion_order() {
        let buffer = RingBuffer::new(5);
        for tag in [3u8, 1, 4] {
            buffer.insert(tagged_frame(tag));
        }
        assert_eq!(tags(&buffer), vec![3, 1, 4]);
        let copies = buffer.drain();
        assert_eq!(copies.len(), 3);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn zero_capacity_holds_nothing() {
        let buffer = RingBuffer::new(0);
        buffer.insert(tagged_frame(1));
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.first_valid_dimensions(), None);
    }

    #[test]
    fn first_valid_dimensions_skips_empty_frames() {
        let buffer = RingBuffer::new(3);
        buffer.insert(Frame::new(Arc::from("c"), Vec::new(), 0, 0));
        buffer.insert(Frame::new(Arc::from("c"), vec![0; 4 * 3 * 3], 4, 3));
        assert_eq!(buffer.first_valid_dimensions(), Some((4, 3)));
    }

    #[test]
    fn close_releases_and_ignores_later_inserts() {
        let buffer = RingBuffer::new(3);
        buffer.insert(tagged_frame(1));
        buffer.insert(tagged_frame(2));
        assert!(buffer.memory_bytes() > 0);
        buffer.close();
        assert!(buffer.is_closed());
        assert!(buffer.is_empty());
        buffer.insert(tagged_frame(3));
        assert!(buffer.is_empty());
        assert_eq!(buffer.memory_bytes(), 0);
    }

    #[test]
    fn duplicate_owns_its_pixels() {
        let frame = tagged_frame(9);
        let copy = frame.duplicate();
        assert_ne!(frame.pixels().as_ptr(), copy.pixels().as_ptr());
        assert_eq!(frame.pixels(), copy.pixels());
        assert_eq!(copy.camera(), "test-cam");
        assert!(copy.is_well_formed());
    }

    #[test]
    fn concurrent_inserts_keep_slot_accounting() {
        let buffer = Arc::new(RingBuffer::new(64));
        let writers = 8;
        let per_writer = 500;
        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..per_writer {
                        buffer.insert(tagged_frame(((w * per_writer + i) % 251) as u8));
                        if i % 50 == 0 {
                            let _ = buffer.drain();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }
        assert_eq!(buffer.len(), 64);
        let mut visited = 0;
        buffer.drain_with(|_| visited += 1);
        assert_eq!(visited, 64);
        assert_eq!(buffer.memory_bytes(), 64 * 12);
    }
}
