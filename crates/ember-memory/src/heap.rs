//! # Dynamic Heap
//!
//! Per-context bump allocator over pages borrowed from the shared
//! [`DynamicMemoryManager`].

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ember_core::{align_up, Error, FenceValue, Result};

use crate::manager::{DynamicMemoryManager, ReleasedPages};
use crate::page::{DynamicAllocation, DynamicPage};

/// Linear allocator for per-draw GPU data.
///
/// Not thread safe: owned by exactly one context.
pub struct DynamicHeap {
    manager: Arc<DynamicMemoryManager>,
    name: String,
    page_size: u64,
    /// Pages owned since the last frame boundary; the last one is current
    pages: Vec<DynamicPage>,
    /// Next free byte in the current page
    curr_offset: u64,
    /// Bytes left in the current page
    available_size: u64,
    curr_allocated_size: u64,
    curr_used_size: u64,
    curr_aligned_size: u64,
    peak_allocated_size: u64,
    peak_used_size: u64,
    peak_aligned_size: u64,
}

impl DynamicHeap {
    /// Create a heap requesting pages of at least `page_size` bytes.
    pub fn new(manager: Arc<DynamicMemoryManager>, name: impl Into<String>, page_size: u64) -> Self {
        Self {
            manager,
            name: name.into(),
            page_size: page_size.max(1),
            pages: Vec::new(),
            curr_offset: 0,
            available_size: 0,
            curr_allocated_size: 0,
            curr_used_size: 0,
            curr_aligned_size: 0,
            peak_allocated_size: 0,
            peak_used_size: 0,
            peak_aligned_size: 0,
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<DynamicAllocation> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }

        if self.pages.is_empty() || self.padded_size(size, alignment) > self.available_size {
            let mut page_size = self.page_size;
            while page_size < size {
                page_size *= 2;
            }

            let page = self.manager.allocate_page(page_size)?;
            log::trace!(
                "{}: new dynamic page of {} bytes ({} requested)",
                self.name,
                page.size(),
                size
            );
            self.curr_offset = 0;
            self.available_size = page.size();
            self.curr_allocated_size += page.size();
            self.peak_allocated_size = self.peak_allocated_size.max(self.curr_allocated_size);
            self.pages.push(page);
        }

        let padded_size = self.padded_size(size, alignment);
        let Some(page) = self.pages.last() else {
            return Err(Error::AllocationTooLarge);
        };
        if padded_size > self.available_size {
            return Err(Error::AllocationTooLarge);
        }

        let aligned_offset = align_up(self.curr_offset, alignment);
        let allocation = page.suballocate(aligned_offset, size);

        self.available_size -= padded_size;
        self.curr_offset += padded_size;
        self.curr_used_size += size;
        self.curr_aligned_size += padded_size;
        self.peak_used_size = self.peak_used_size.max(self.curr_used_size);
        self.peak_aligned_size = self.peak_aligned_size.max(self.curr_aligned_size);

        Ok(allocation)
    }

    /// Hand every page to the manager, tagged with `fence_value`.
    pub fn finish_frame(&mut self, fence_value: FenceValue) {
        let pages = core::mem::take(&mut self.pages);
        log::trace!(
            "{}: finishing frame at fence {} ({} pages)",
            self.name,
            fence_value,
            pages.len()
        );
        self.manager.discard_pages(pages, fence_value);
        self.reset_frame();
    }

    /// Detach every page. The pages go back to the pool when the result
    /// is dropped, so it must outlive every batch that used them.
    pub fn release_pages(&mut self) -> ReleasedPages {
        let pages = core::mem::take(&mut self.pages);
        log::trace!("{}: releasing {} pages", self.name, pages.len());
        self.reset_frame();
        ReleasedPages::new(self.manager.clone(), pages)
    }

    /// Return every page straight to the pool. Only valid when nothing
    /// allocated since the last frame boundary was submitted.
    pub fn discard_unsubmitted(&mut self) {
        let pages = core::mem::take(&mut self.pages);
        self.manager.return_pages(pages);
        self.reset_frame();
    }

    fn reset_frame(&mut self) {
        self.curr_offset = 0;
        self.available_size = 0;
        self.curr_allocated_size = 0;
        self.curr_used_size = 0;
        self.curr_aligned_size = 0;
    }

    /// Size including the padding needed to align the current offset
    fn padded_size(&self, size: u64, alignment: u64) -> u64 {
        size + (align_up(self.curr_offset, alignment) - self.curr_offset)
    }

    /// Heap name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pages owned in the current frame
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Bytes of pages owned in the current frame
    pub fn current_allocated_size(&self) -> u64 {
        self.curr_allocated_size
    }

    /// Bytes handed out in the current frame
    pub fn current_used_size(&self) -> u64 {
        self.curr_used_size
    }

    /// Bytes handed out in the current frame including alignment padding
    pub fn current_aligned_size(&self) -> u64 {
        self.curr_aligned_size
    }

    /// Peak of `current_allocated_size`
    pub fn peak_allocated_size(&self) -> u64 {
        self.peak_allocated_size
    }

    /// Peak of `current_used_size`
    pub fn peak_used_size(&self) -> u64 {
        self.peak_used_size
    }

    /// Peak of `current_aligned_size`
    pub fn peak_aligned_size(&self) -> u64 {
        self.peak_aligned_size
    }
}

impl Drop for DynamicHeap {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            log::warn!(
                "{}: dropped while holding {} pages; retiring them at the next fence value",
                self.name,
                self.pages.len()
            );
            let pages = core::mem::take(&mut self.pages);
            self.manager.retire_pages(pages);
        }

        log::info!(
            "{} usage stats: peak used/aligned/allocated size: {}/{}/{} bytes",
            self.name,
            self.peak_used_size,
            self.peak_aligned_size,
            self.peak_allocated_size
        );
    }
}

impl fmt::Debug for DynamicHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicHeap")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("pages", &self.pages.len())
            .field("curr_offset", &self.curr_offset)
            .field("available_size", &self.available_size)
            .finish()
    }
}

static_assertions::assert_impl_all!(DynamicHeap: Send);
