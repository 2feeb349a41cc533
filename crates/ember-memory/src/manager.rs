//! # Dynamic Memory Manager
//!
//! Device-wide pool of GPU pages shared by every context's [`DynamicHeap`].
//! Pages come back tagged with a fence value and only become available
//! again once that value has completed.
//!
//! [`DynamicHeap`]: crate::DynamicHeap

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use ember_core::{DeviceBackend, FenceTracker, FenceValue, Result};
use spin::Mutex;

use crate::page::DynamicPage;

/// A page waiting for its fence value to complete
struct StalePage {
    fence_value: FenceValue,
    page: DynamicPage,
}

/// Shared page pool.
pub struct DynamicMemoryManager {
    backend: Arc<dyn DeviceBackend>,
    fences: Arc<dyn FenceTracker>,
    page_size: u64,
    /// Available pages keyed by size
    available: Mutex<BTreeMap<u64, Vec<DynamicPage>>>,
    /// Discarded pages in fence order
    stale: Mutex<VecDeque<StalePage>>,
    /// Pages held by heaps
    pages_in_use: AtomicUsize,
    /// Pages created over the manager's lifetime
    pages_created: AtomicUsize,
}

impl DynamicMemoryManager {
    /// Create a manager and reserve `num_pages_to_reserve` pages of
    /// `page_size` bytes.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        fences: Arc<dyn FenceTracker>,
        num_pages_to_reserve: u32,
        page_size: u64,
    ) -> Result<Self> {
        let mut reserved = Vec::with_capacity(num_pages_to_reserve as usize);
        for _ in 0..num_pages_to_reserve {
            reserved.push(DynamicPage::create(&backend, page_size)?);
        }

        let mut available = BTreeMap::new();
        if !reserved.is_empty() {
            available.insert(page_size, reserved);
        }

        log::debug!(
            "Dynamic memory manager: reserved {} pages of {} bytes",
            num_pages_to_reserve,
            page_size
        );

        Ok(Self {
            backend,
            fences,
            page_size,
            available: Mutex::new(available),
            stale: Mutex::new(VecDeque::new()),
            pages_in_use: AtomicUsize::new(0),
            pages_created: AtomicUsize::new(num_pages_to_reserve as usize),
        })
    }

    /// Take the smallest available page of at least `size` bytes, or
    /// create a new one of exactly `size` bytes.
    pub fn allocate_page(&self, size: u64) -> Result<DynamicPage> {
        let reused = {
            let mut available = self.available.lock();
            let key = available.range(size..).next().map(|(&key, _)| key);
            key.and_then(|key| {
                let bucket = available.get_mut(&key)?;
                let page = bucket.pop();
                if bucket.is_empty() {
                    available.remove(&key);
                }
                page
            })
        };

        let page = match reused {
            Some(page) => page,
            None => {
                let page = DynamicPage::create(&self.backend, size)?;
                self.pages_created.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dynamic memory manager: created page of {} bytes", size);
                page
            }
        };

        self.pages_in_use.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Queue `pages` for reuse once `fence_value` completes.
    pub fn discard_pages<I>(&self, pages: I, fence_value: FenceValue)
    where
        I: IntoIterator<Item = DynamicPage>,
    {
        let mut stale = self.stale.lock();
        let mut count = 0;
        for page in pages {
            stale.push_back(StalePage { fence_value, page });
            count += 1;
        }
        self.pages_in_use.fetch_sub(count, Ordering::Relaxed);
    }

    /// Queue `pages` for reuse once the next submitted batch completes.
    pub fn retire_pages<I>(&self, pages: I)
    where
        I: IntoIterator<Item = DynamicPage>,
    {
        let fence_value = self.fences.next_fence_value();
        self.discard_pages(pages, fence_value);
    }

    /// Make `pages` available immediately. Only valid for pages no
    /// submitted work references.
    pub fn return_pages<I>(&self, pages: I)
    where
        I: IntoIterator<Item = DynamicPage>,
    {
        let mut available = self.available.lock();
        let mut count = 0;
        for page in pages {
            available.entry(page.size()).or_default().push(page);
            count += 1;
        }
        self.pages_in_use.fetch_sub(count, Ordering::Relaxed);
    }

    /// Move pages whose fence value has completed back to the pool.
    pub fn release_stale_pages(&self, completed_fence_value: FenceValue) {
        let mut available = self.available.lock();
        let mut stale = self.stale.lock();
        // Discards from different contexts may interleave out of order;
        // stopping early only delays a page.
        while let Some(front) = stale.front() {
            if front.fence_value > completed_fence_value {
                break;
            }
            if let Some(entry) = stale.pop_front() {
                available
                    .entry(entry.page.size())
                    .or_default()
                    .push(entry.page);
            }
        }
    }

    /// Drop every pooled page. The GPU must be idle.
    pub fn destroy(&self) {
        let mut available = self.available.lock();
        let mut stale = self.stale.lock();
        debug_assert_eq!(
            self.pages_in_use.load(Ordering::Relaxed),
            0,
            "Dynamic pages are still held by heaps"
        );

        let num_available: usize = available.values().map(Vec::len).sum();
        log::info!(
            "Dynamic memory manager: destroying {} available and {} stale pages ({} created in total)",
            num_available,
            stale.len(),
            self.pages_created.load(Ordering::Relaxed)
        );
        available.clear();
        stale.clear();
    }

    /// Default page size
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Pages held by heaps
    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::Relaxed)
    }

    /// Pages ready for reuse
    pub fn num_available_pages(&self) -> usize {
        self.available.lock().values().map(Vec::len).sum()
    }

    /// Pages waiting for their fence value
    pub fn num_stale_pages(&self) -> usize {
        self.stale.lock().len()
    }

    /// Pages created over the manager's lifetime
    pub fn pages_created(&self) -> usize {
        self.pages_created.load(Ordering::Relaxed)
    }
}

impl Drop for DynamicMemoryManager {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.pages_in_use.load(Ordering::Relaxed),
            0,
            "Dynamic memory manager dropped while pages are in use"
        );
    }
}

/// Pages detached from a heap that go back to the pool when dropped.
///
/// Parked in a release queue so the drop happens once every batch that
/// used the pages has completed.
pub struct ReleasedPages {
    manager: Arc<DynamicMemoryManager>,
    pages: Vec<DynamicPage>,
}

impl ReleasedPages {
    pub(crate) fn new(manager: Arc<DynamicMemoryManager>, pages: Vec<DynamicPage>) -> Self {
        Self { manager, pages }
    }

    /// Number of pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// No pages
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for ReleasedPages {
    fn drop(&mut self) {
        self.manager.return_pages(self.pages.drain(..));
    }
}

impl fmt::Debug for ReleasedPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleasedPages")
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl fmt::Debug for DynamicMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMemoryManager")
            .field("page_size", &self.page_size)
            .field("pages_in_use", &self.pages_in_use())
            .field("available", &self.num_available_pages())
            .field("stale", &self.num_stale_pages())
            .finish()
    }
}

static_assertions::assert_impl_all!(DynamicMemoryManager: Send, Sync);
static_assertions::assert_impl_all!(ReleasedPages: Send);
