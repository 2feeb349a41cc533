//! # Variable-Size Allocator
//!
//! Best-fit allocator over `[0, max_size)`. Free blocks are indexed twice:
//! by offset, to find neighbours when coalescing, and by `(size, offset)`,
//! to find the smallest block that fits.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};

use ember_core::FenceValue;

// =============================================================================
// VARIABLE-SIZE ALLOCATOR
// =============================================================================

/// Best-fit free-list allocator.
#[derive(Debug, Clone)]
pub struct VariableSizeAllocator {
    /// Total size.
    max_size: u64,
    /// Sum of all free block sizes.
    free_size: u64,
    /// Free blocks: offset -> size.
    by_offset: BTreeMap<u64, u64>,
    /// Free blocks ordered by (size, offset).
    by_size: BTreeSet<(u64, u64)>,
}

impl VariableSizeAllocator {
    /// Create an allocator whose whole range is free.
    pub fn new(max_size: u64) -> Self {
        let mut allocator = Self {
            max_size,
            free_size: 0,
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
        };
        if max_size > 0 {
            allocator.insert_block(0, max_size);
            allocator.free_size = max_size;
        }
        allocator
    }

    /// Allocate `size` units. Returns the offset, or `None` when no free
    /// block is large enough.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size != 0, "Zero-sized allocation");
        if size == 0 || self.free_size < size {
            return None;
        }

        let (block_size, offset) = self.by_size.range((size, 0)..).next().copied()?;
        self.remove_block(offset, block_size);
        if block_size > size {
            self.insert_block(offset + size, block_size - size);
        }

        self.free_size -= size;
        Some(offset)
    }

    /// Return `[offset, offset + size)` to the free list, merging it with
    /// adjacent free blocks.
    pub fn free(&mut self, offset: u64, size: u64) {
        debug_assert!(size != 0, "Zero-sized free");
        debug_assert!(
            offset + size <= self.max_size,
            "Range [{}, {}) is outside of [0, {})",
            offset,
            offset + size,
            self.max_size
        );

        let prev = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let next = self.by_offset.range(offset..).next().map(|(&o, &s)| (o, s));

        debug_assert!(
            prev.map_or(true, |(o, s)| o + s <= offset),
            "Range at {} overlaps the previous free block",
            offset
        );
        debug_assert!(
            next.map_or(true, |(o, _)| offset + size <= o),
            "Range at {} overlaps the next free block",
            offset
        );

        let mut new_offset = offset;
        let mut new_size = size;

        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                self.remove_block(prev_offset, prev_size);
                new_offset = prev_offset;
                new_size += prev_size;
            }
        }

        if let Some((next_offset, next_size)) = next {
            if offset + size == next_offset {
                self.remove_block(next_offset, next_size);
                new_size += next_size;
            }
        }

        self.insert_block(new_offset, new_size);
        self.free_size += size;
    }

    /// Total size.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Sum of free block sizes.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Size handed out and not freed.
    pub fn used_size(&self) -> u64 {
        self.max_size - self.free_size
    }

    /// No free space left.
    pub fn is_full(&self) -> bool {
        self.free_size == 0
    }

    /// Nothing allocated.
    pub fn is_empty(&self) -> bool {
        self.free_size == self.max_size
    }

    /// Number of disjoint free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.by_offset.len()
    }

    /// Check that both indexes describe the same, non-overlapping,
    /// fully coalesced set of blocks.
    pub fn is_consistent(&self) -> bool {
        if self.by_offset.len() != self.by_size.len() {
            return false;
        }

        let mut total = 0;
        let mut prev_end: Option<u64> = None;
        for (&offset, &size) in &self.by_offset {
            if size == 0 || offset + size > self.max_size {
                return false;
            }
            if !self.by_size.contains(&(size, offset)) {
                return false;
            }
            // Touching blocks must have been merged
            if prev_end.map_or(false, |end| end >= offset) {
                return false;
            }
            prev_end = Some(offset + size);
            total += size;
        }

        total == self.free_size
    }

    fn insert_block(&mut self, offset: u64, size: u64) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove_block(&mut self, offset: u64, size: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }
}

// =============================================================================
// FENCED VARIABLE-SIZE ALLOCATOR
// =============================================================================

/// A freed range waiting for its fence value to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleAllocation {
    /// Offset of the range.
    pub offset: u64,
    /// Size of the range.
    pub size: u64,
    /// Fence value that must complete before the range is reused.
    pub fence_value: FenceValue,
}

/// [`VariableSizeAllocator`] whose frees only take effect once the GPU has
/// passed the fence value they were tagged with.
///
/// Stale ranges are queued in free order. Callers tag frees with a
/// non-decreasing fence value, so the queue is also ordered by fence and
/// release can stop at the first range that is still pending.
#[derive(Debug, Clone)]
pub struct FencedVariableSizeAllocator {
    allocator: VariableSizeAllocator,
    stale: VecDeque<StaleAllocation>,
    stale_size: u64,
}

impl FencedVariableSizeAllocator {
    /// Create an allocator whose whole range is free.
    pub fn new(max_size: u64) -> Self {
        Self {
            allocator: VariableSizeAllocator::new(max_size),
            stale: VecDeque::new(),
            stale_size: 0,
        }
    }

    /// Allocate `size` units from ranges that are safe to reuse.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        self.allocator.allocate(size)
    }

    /// Queue `[offset, offset + size)` for release once `fence_value`
    /// completes.
    pub fn free(&mut self, offset: u64, size: u64, fence_value: FenceValue) {
        debug_assert!(
            self.stale
                .back()
                .map_or(true, |last| last.fence_value <= fence_value),
            "Stale allocations must be queued in fence order"
        );
        self.stale.push_back(StaleAllocation {
            offset,
            size,
            fence_value,
        });
        self.stale_size += size;
    }

    /// Return `[offset, offset + size)` for reuse right away. Only valid
    /// when no pending GPU work references the range.
    pub fn free_now(&mut self, offset: u64, size: u64) {
        self.allocator.free(offset, size);
    }

    /// Release every stale range tagged with a fence value up to
    /// `completed_fence_value`.
    pub fn release_stale_allocations(&mut self, completed_fence_value: FenceValue) {
        while let Some(front) = self.stale.front() {
            if front.fence_value > completed_fence_value {
                break;
            }
            let StaleAllocation { offset, size, .. } = *front;
            self.stale.pop_front();
            self.allocator.free(offset, size);
            self.stale_size -= size;
        }
    }

    /// Release every stale range regardless of its fence value.
    ///
    /// Only valid once the GPU is idle.
    pub fn release_all_stale(&mut self) {
        self.release_stale_allocations(FenceValue::MAX);
    }

    /// Total size.
    pub fn max_size(&self) -> u64 {
        self.allocator.max_size()
    }

    /// Size available for allocation now.
    pub fn free_size(&self) -> u64 {
        self.allocator.free_size()
    }

    /// Size freed but not yet reusable.
    pub fn stale_allocations_size(&self) -> u64 {
        self.stale_size
    }

    /// Number of queued stale ranges.
    pub fn num_stale_allocations(&self) -> usize {
        self.stale.len()
    }

    /// No free space left.
    pub fn is_full(&self) -> bool {
        self.allocator.is_full()
    }

    /// Nothing allocated and nothing stale.
    pub fn is_empty(&self) -> bool {
        self.allocator.is_empty()
    }

    /// Number of disjoint free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free_blocks()
    }

    /// See [`VariableSizeAllocator::is_consistent`].
    pub fn is_consistent(&self) -> bool {
        self.allocator.is_consistent()
            && self.stale.iter().map(|s| s.size).sum::<u64>() == self.stale_size
    }
}
