//! # Ring Buffer
//!
//! Circular bump allocator over `[0, max_size)`. Allocations are released
//! a frame at a time: the tail position at the end of each frame is
//! recorded, and once the frame is known to be complete the head jumps to
//! that position.
//!
//! An allocation is never split across the end of the range. When a
//! request does not fit between the tail and the end, the remaining gap is
//! skipped (and counted as used) and the allocation starts at offset 0.

use alloc::collections::VecDeque;

use ember_core::align_up;

/// Tail position and size recorded when a frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTail {
    /// Frame number (usually a fence value).
    pub frame_num: u64,
    /// Tail offset at the end of the frame.
    pub offset: u64,
    /// Bytes consumed by the frame, including wrap gaps.
    pub size: u64,
}

/// Frame-released circular allocator.
#[derive(Debug)]
pub struct RingBuffer {
    completed_frame_tails: VecDeque<FrameTail>,
    head: u64,
    tail: u64,
    max_size: u64,
    used_size: u64,
    curr_frame_size: u64,
}

impl RingBuffer {
    /// Create an empty ring of `max_size` bytes.
    pub fn new(max_size: u64) -> Self {
        Self {
            completed_frame_tails: VecDeque::new(),
            head: 0,
            tail: 0,
            max_size,
            used_size: 0,
            curr_frame_size: 0,
        }
    }

    /// Allocate `size` contiguous bytes. Returns the offset, or `None` if
    /// the ring has no contiguous room.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        self.allocate_aligned(size, 1)
    }

    /// Allocate `size` contiguous bytes starting at a multiple of
    /// `alignment` (a power of two). Padding in front of the allocation
    /// counts as used and is released with the frame.
    pub fn allocate_aligned(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(alignment.is_power_of_two());
        if self.is_full() {
            return None;
        }

        let aligned_tail = align_up(self.tail, alignment);
        if self.tail >= self.head {
            //                     Head             Tail     MaxSize
            //                     |                |        |
            //  [                  xxxxxxxxxxxxxxxxx         ]
            if aligned_tail + size <= self.max_size {
                return Some(self.bump(aligned_tail, size));
            } else if size <= self.head {
                // Skip the gap at the end and restart at 0
                log::trace!(
                    "Ring buffer wrapped, skipping {} bytes at the end",
                    self.max_size - self.tail
                );
                let add_size = (self.max_size - self.tail) + size;
                self.used_size += add_size;
                self.curr_frame_size += add_size;
                self.tail = size;
                return Some(0);
            }
        } else if aligned_tail + size <= self.head {
            //       Tail          Head
            //       |             |
            //  [xxxx              xxxxxxxxxxxxxxxxxxxxxxxxxx]
            return Some(self.bump(aligned_tail, size));
        }

        None
    }

    fn bump(&mut self, offset: u64, size: u64) -> u64 {
        let add_size = (offset - self.tail) + size;
        self.tail = offset + size;
        self.used_size += add_size;
        self.curr_frame_size += add_size;
        offset
    }

    /// Close the current frame under `frame_num`.
    pub fn finish_current_frame(&mut self, frame_num: u64) {
        self.completed_frame_tails.push_back(FrameTail {
            frame_num,
            offset: self.tail,
            size: self.curr_frame_size,
        });
        self.curr_frame_size = 0;
    }

    /// Release every finished frame whose number is below
    /// `num_completed_frames`.
    pub fn release_completed_frames(&mut self, num_completed_frames: u64) {
        while let Some(oldest) = self.completed_frame_tails.front() {
            if oldest.frame_num >= num_completed_frames {
                break;
            }
            debug_assert!(oldest.size <= self.used_size);
            self.used_size -= oldest.size;
            self.head = oldest.offset;
            self.completed_frame_tails.pop_front();
        }
    }

    /// Capacity in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes in use, including skipped wrap gaps.
    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    /// Offset of the oldest live byte.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Offset where the next allocation starts.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Number of frames finished but not yet released.
    pub fn num_pending_frames(&self) -> usize {
        self.completed_frame_tails.len()
    }

    /// No room left.
    pub fn is_full(&self) -> bool {
        self.used_size == self.max_size
    }

    /// Nothing in use.
    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }
}
