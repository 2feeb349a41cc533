//! # Ember Dynamic Memory
//!
//! Transient GPU memory for per-draw data (constants, vertices, uploads).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 DynamicMemoryManager (shared)                │
//! │   available pages (by size)        stale pages (by fence)    │
//! └───────────────▲──────────────────────────────┬───────────────┘
//!                 │ discard_pages(fence)          │ allocate_page
//! ┌───────────────┴──────────┐        ┌───────────▼──────────────┐
//! │ DynamicHeap (context A)  │  ...   │ DynamicHeap (context B)  │
//! │  bump pointer in page    │        │  bump pointer in page    │
//! └──────────────────────────┘        └──────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DynamicUploadHeap (per context): growable list of            │
//! │ GpuRingBuffer, each a RingBuffer over one mapped buffer      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both paths return [`DynamicAllocation`]s: a buffer, an offset and
//! matching CPU/GPU addresses, valid until the frame that produced them
//! is finished and its fence value completes. Nothing stops a handle from
//! outliving that point, so CPU access through it is `unsafe`.
//!
//! Heaps on a queue other than the one the pool follows detach their
//! pages as [`ReleasedPages`] and park them in that queue's release queue.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod gpu_ring;
pub mod heap;
pub mod manager;
pub mod page;
pub mod upload;

// Re-exports
pub use gpu_ring::GpuRingBuffer;
pub use heap::DynamicHeap;
pub use manager::{DynamicMemoryManager, ReleasedPages};
pub use page::{DynamicAllocation, DynamicPage};
pub use upload::DynamicUploadHeap;
