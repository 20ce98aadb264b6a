// User Frame Pool
//
// The fixed pool of physical frames handed out to user pages. It is much
// smaller than the sum of all user address spaces, which is why the frame
// table has to evict.
//
// Key responsibilities:
// - Track free and allocated frames using a compact bitmap
// - Allocate and free single frames (user pages are never contiguous)
// - Give callers exclusive, short-lived access to a frame's contents
// - Expose usage statistics for diagnostics
//
// Implementation details:
// - One bit per frame: 0 = free, 1 = allocated (`mm::bitmap`)
// - Each frame's bytes sit behind their own spinlock; that lock is a leaf
//   and is only held for the duration of one copy
// - The pool never evicts; returning `None` is the frame table's cue to
//   run the clock

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, MutexGuard};

use crate::config::PAGE_SIZE;
use crate::mm::bitmap::Bitmap;
use crate::log_info;

const LOG_ORIGIN: &str = "pmm";

pub type PageBuf = [u8; PAGE_SIZE];

/// A physical frame, identified by its index in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    pub const fn from_index(index: usize) -> Self {
        Frame(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

pub struct FramePool {
    bitmap: Mutex<Bitmap>,
    frames: Vec<Mutex<Box<PageBuf>>>,
}

impl FramePool {
    pub fn new(frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| Mutex::new(Box::new([0u8; PAGE_SIZE])))
            .collect();

        log_info!(
            LOG_ORIGIN,
            "User frame pool initialized: {} frames ({} KiB)",
            frame_count,
            frame_count * PAGE_SIZE / 1024
        );

        Self {
            bitmap: Mutex::new(Bitmap::new(frame_count)),
            frames,
        }
    }

    pub fn alloc_frame(&self) -> Option<Frame> {
        self.bitmap.lock().allocate().map(Frame)
    }

    pub fn alloc_frame_zeroed(&self) -> Option<Frame> {
        let frame = self.alloc_frame()?;
        self.contents(frame).fill(0);
        Some(frame)
    }

    pub fn free_frame(&self, frame: Frame) {
        self.bitmap.lock().release(frame.0);
    }

    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.bitmap.lock().is_set(frame.0)
    }

    /// Locks the frame's contents. Callers must not take a global lock while
    /// holding the returned guard.
    pub fn contents(&self, frame: Frame) -> MutexGuard<'_, Box<PageBuf>> {
        self.frames[frame.0].lock()
    }

    pub fn copy_out(&self, frame: Frame, buf: &mut PageBuf) {
        buf.copy_from_slice(&self.contents(frame)[..]);
    }

    pub fn get_stats(&self) -> (usize, usize) {
        let bitmap = self.bitmap.lock();
        (bitmap.len(), bitmap.free_count())
    }
}
