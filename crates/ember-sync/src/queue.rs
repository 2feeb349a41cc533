//! # Command Queue
//!
//! Fence bookkeeping for one hardware queue.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::{FenceTracker, FenceValue, GpuQueue, Result};
use spin::Mutex;

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// CPU-side view of a hardware queue's fence timeline.
///
/// Fence values start at 1. Each submission takes the current
/// `next_fence_value` and signals it on completion; the counter then moves
/// on. `completed_fence_value() < next_fence_value()` always holds.
pub struct CommandQueue {
    /// Hardware queue
    queue: Arc<dyn GpuQueue>,
    /// Value the next submission will signal
    next_fence_value: AtomicU64,
    /// Last value read back from the hardware (cached)
    last_completed_fence_value: AtomicU64,
    /// Serializes submissions so fence values reach the GPU in order
    submit_lock: Mutex<()>,
}

impl CommandQueue {
    /// Wrap a hardware queue
    pub fn new(queue: Arc<dyn GpuQueue>) -> Self {
        Self {
            queue,
            next_fence_value: AtomicU64::new(1),
            last_completed_fence_value: AtomicU64::new(0),
            submit_lock: Mutex::new(()),
        }
    }

    /// Submit pending work; returns the fence value it will signal.
    ///
    /// A failed submission still consumes its fence value.
    pub fn submit(&self) -> Result<FenceValue> {
        let _guard = self.submit_lock.lock();
        let fence_value = self.next_fence_value.fetch_add(1, Ordering::AcqRel);
        self.queue.submit(fence_value)?;
        log::trace!("Submitted command batch with fence value {}", fence_value);
        Ok(fence_value)
    }

    /// Value the next submission will signal
    pub fn next_fence_value(&self) -> FenceValue {
        self.next_fence_value.load(Ordering::Acquire)
    }

    /// Value of the most recent submission (0 before the first one)
    pub fn last_submitted_fence_value(&self) -> FenceValue {
        self.next_fence_value() - 1
    }

    /// Refresh and return the highest completed fence value
    pub fn completed_fence_value(&self) -> FenceValue {
        let hw = self.queue.completed_fence_value();
        let previous = self
            .last_completed_fence_value
            .fetch_max(hw, Ordering::AcqRel);
        let completed = previous.max(hw);
        debug_assert!(
            completed < self.next_fence_value(),
            "Completed fence value {} is ahead of next value {}",
            completed,
            self.next_fence_value()
        );
        completed
    }

    /// Cached completed value without querying the hardware
    pub fn cached_completed_fence_value(&self) -> FenceValue {
        self.last_completed_fence_value.load(Ordering::Acquire)
    }

    /// Check whether `fence_value` has completed
    pub fn is_fence_complete(&self, fence_value: FenceValue) -> bool {
        fence_value <= self.cached_completed_fence_value()
            || fence_value <= self.completed_fence_value()
    }

    /// Block until `fence_value` completes
    pub fn wait_for_fence(&self, fence_value: FenceValue) {
        if !self.is_fence_complete(fence_value) {
            self.queue.wait_for_fence(fence_value);
            self.completed_fence_value();
        }
    }

    /// Submit a signal and wait for all work on the queue to finish.
    ///
    /// Returns the fence value that was waited for.
    pub fn idle(&self) -> Result<FenceValue> {
        let fence_value = self.submit()?;
        self.queue.wait_for_fence(fence_value);
        self.completed_fence_value();
        Ok(fence_value)
    }
}

impl FenceTracker for CommandQueue {
    fn next_fence_value(&self) -> FenceValue {
        CommandQueue::next_fence_value(self)
    }

    fn completed_fence_value(&self) -> FenceValue {
        CommandQueue::completed_fence_value(self)
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("next_fence_value", &self.next_fence_value())
            .field(
                "last_completed_fence_value",
                &self.cached_completed_fence_value(),
            )
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::EmulatedQueue;

    fn queue() -> (Arc<EmulatedQueue>, CommandQueue) {
        let hw = Arc::new(EmulatedQueue::new());
        let queue = CommandQueue::new(hw.clone());
        (hw, queue)
    }

    #[test]
    fn test_fence_values_start_at_one() {
        let (_hw, queue) = queue();
        assert_eq!(queue.next_fence_value(), 1);
        assert_eq!(queue.completed_fence_value(), 0);
        assert_eq!(queue.last_submitted_fence_value(), 0);
    }

    #[test]
    fn test_submit_post_increments() {
        let (hw, queue) = queue();
        assert_eq!(queue.submit().unwrap(), 1);
        assert_eq!(queue.submit().unwrap(), 2);
        assert_eq!(queue.next_fence_value(), 3);
        assert_eq!(hw.submitted_fence_value(), 2);
    }

    #[test]
    fn test_completion_is_monotonic_and_cached() {
        let (hw, queue) = queue();
        queue.submit().unwrap();
        queue.submit().unwrap();
        assert!(!queue.is_fence_complete(1));

        hw.complete_up_to(1);
        assert!(queue.is_fence_complete(1));
        assert!(!queue.is_fence_complete(2));
        assert_eq!(queue.cached_completed_fence_value(), 1);

        hw.complete_all();
        assert_eq!(queue.completed_fence_value(), 2);
        assert!(queue.completed_fence_value() < queue.next_fence_value());
    }

    #[test]
    fn test_idle_waits_for_everything() {
        let (hw, queue) = queue();
        queue.submit().unwrap();
        queue.submit().unwrap();

        let idle_value = queue.idle().unwrap();
        assert_eq!(idle_value, 3);
        assert_eq!(queue.completed_fence_value(), 3);
        assert_eq!(hw.submission_count(), 3);
    }

    #[test]
    fn test_concurrent_submissions_get_unique_values() {
        use std::thread;
        use std::vec::Vec;

        let hw = Arc::new(EmulatedQueue::auto_completing());
        let queue = Arc::new(CommandQueue::new(hw));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| queue.submit().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut values: Vec<FenceValue> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 400);
        assert_eq!(queue.next_fence_value(), 401);
    }
}
