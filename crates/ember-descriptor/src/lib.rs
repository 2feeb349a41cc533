//! # Ember Descriptor Heaps
//!
//! Descriptor allocation for a D3D12-style API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Render device                             │
//! │   CpuDescriptorHeap ×4                 GpuDescriptorHeap ×2      │
//! │   ┌───────────────────────┐            ┌───────────────────────┐ │
//! │   │ manager 0 │ manager 1 │ ...        │ static  │   dynamic   │ │
//! │   │  (heap)   │  (heap)   │            │ (id 0)  │   (id 1)    │ │
//! │   └───────────────────────┘            └───────────────────────┘ │
//! │                                                  ▲ chunks        │
//! │                                  DynamicSuballocationsManager    │
//! │                                       (one per context)          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every allocation is a [`DescriptorHeapAllocation`]: a move-only handle
//! that returns its range to the allocator that produced it when dropped.
//! Returned ranges are tagged with the next fence value and only become
//! reusable after [`release_stale_allocations`] observes that fence value
//! as complete.
//!
//! [`release_stale_allocations`]: CpuDescriptorHeap::release_stale_allocations

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod allocation;
pub mod cpu_heap;
pub mod dynamic;
pub mod gpu_heap;
pub mod manager;

// Re-exports
pub use allocation::{
    DescriptorAllocator, DescriptorHeapAllocation, DescriptorRange, INVALID_MANAGER_ID,
};
pub use cpu_heap::CpuDescriptorHeap;
pub use dynamic::{DynamicSuballocationsManager, RetiredChunks};
pub use gpu_heap::{GpuDescriptorHeap, DYNAMIC_MANAGER_ID, STATIC_MANAGER_ID};
pub use manager::DescriptorHeapAllocationManager;
