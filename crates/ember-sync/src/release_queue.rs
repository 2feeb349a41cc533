//! # Resource Release Queue
//!
//! Objects that the GPU may still reference are parked here instead of
//! being dropped. Dropping is the release: once the fence value an object
//! was parked under completes, the queue drops it.
//!
//! Two entry points exist:
//!
//! - [`ResourceReleaseQueue::safe_release`] parks an object under a known
//!   fence value.
//! - [`ResourceReleaseQueue::stage`] parks an object under a command list
//!   number. When that command list is submitted,
//!   [`ResourceReleaseQueue::discard_stale_resources`] moves it to the
//!   release FIFO with the fence value of the submission.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::any::Any;
use core::fmt;

use ember_core::FenceValue;

/// Type-erased object awaiting release
pub type StaleResource = Box<dyn Any + Send>;

/// Two-stage FIFO of objects awaiting GPU completion
pub struct ResourceReleaseQueue<T = StaleResource> {
    /// Staged objects: (command list number, object)
    stale: VecDeque<(u64, T)>,
    /// Objects waiting for a fence: (fence value, object)
    release: VecDeque<(FenceValue, T)>,
}

impl<T> ResourceReleaseQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            stale: VecDeque::new(),
            release: VecDeque::new(),
        }
    }

    /// Park `resource` until `fence_value` completes
    pub fn safe_release(&mut self, resource: T, fence_value: FenceValue) {
        debug_assert!(
            self.release
                .back()
                .map_or(true, |(last, _)| *last <= fence_value),
            "Resources must be released in fence order"
        );
        self.release.push_back((fence_value, resource));
    }

    /// Park `resource` until command list `cmd_list_number` is submitted
    pub fn stage(&mut self, resource: T, cmd_list_number: u64) {
        self.stale.push_back((cmd_list_number, resource));
    }

    /// Move every object staged for a command list up to
    /// `submitted_cmd_list_number` into the release FIFO under
    /// `fence_value`
    pub fn discard_stale_resources(
        &mut self,
        submitted_cmd_list_number: u64,
        fence_value: FenceValue,
    ) -> usize {
        let mut moved = 0;
        while let Some((number, _)) = self.stale.front() {
            if *number > submitted_cmd_list_number {
                break;
            }
            if let Some((_, resource)) = self.stale.pop_front() {
                self.safe_release(resource, fence_value);
                moved += 1;
            }
        }
        moved
    }

    /// Drop every object whose fence value is at most
    /// `completed_fence_value`; returns how many were dropped
    pub fn purge(&mut self, completed_fence_value: FenceValue) -> usize {
        let mut purged = 0;
        while let Some((fence_value, _)) = self.release.front() {
            if *fence_value > completed_fence_value {
                break;
            }
            self.release.pop_front();
            purged += 1;
        }
        purged
    }

    /// Drop everything, staged or not. Only valid once the GPU is idle.
    pub fn drain_all(&mut self) -> usize {
        let count = self.stale.len() + self.release.len();
        self.stale.clear();
        self.release.clear();
        count
    }

    /// Objects staged and not yet submitted
    pub fn stale_resource_count(&self) -> usize {
        self.stale.len()
    }

    /// Objects waiting for their fence value
    pub fn pending_release_count(&self) -> usize {
        self.release.len()
    }

    /// Nothing parked
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.release.is_empty()
    }
}

impl<T> Default for ResourceReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ResourceReleaseQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceReleaseQueue")
            .field("stale", &self.stale.len())
            .field("pending", &self.release.len())
            .finish()
    }
}

impl<T> Drop for ResourceReleaseQueue<T> {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::warn!(
                "Release queue dropped with {} staged and {} pending resources",
                self.stale.len(),
                self.release.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_purge_respects_fence() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut queue = ResourceReleaseQueue::new();
        queue.safe_release(Tracked(dropped.clone()), 3);
        queue.safe_release(Tracked(dropped.clone()), 5);

        assert_eq!(queue.purge(2), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        assert_eq!(queue.purge(4), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_release_count(), 1);

        assert_eq!(queue.purge(5), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_staged_resources_wait_for_submission() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut queue = ResourceReleaseQueue::new();
        queue.stage(Tracked(dropped.clone()), 1);
        queue.stage(Tracked(dropped.clone()), 2);

        // Nothing is released while only staged
        assert_eq!(queue.purge(FenceValue::MAX), 0);
        assert_eq!(queue.stale_resource_count(), 2);

        assert_eq!(queue.discard_stale_resources(1, 10), 1);
        assert_eq!(queue.stale_resource_count(), 1);
        assert_eq!(queue.pending_release_count(), 1);

        assert_eq!(queue.purge(9), 0);
        assert_eq!(queue.purge(10), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        assert_eq!(queue.drain_all(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_type_erased_resources() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut queue: ResourceReleaseQueue = ResourceReleaseQueue::new();
        queue.safe_release(Box::new(Tracked(dropped.clone())), 1);
        queue.safe_release(Box::new(42u32), 1);
        assert_eq!(queue.purge(1), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
