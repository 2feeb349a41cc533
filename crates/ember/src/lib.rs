//! # Ember
//!
//! Descriptor heap and GPU memory management for explicit graphics APIs.
//!
//! Everything the GPU may still read is recycled only after the fence
//! value of the last batch that could reference it has completed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          RenderDevice                            │
//! │  CpuDescriptorHeap x4   GpuDescriptorHeap x2   DynamicMemoryMgr  │
//! │  CommandQueue + ResourceReleaseQueue per queue                   │
//! └───────────────▲───────────────────▲───────────────────▲──────────┘
//!                 │                   │                   │
//! ┌───────────────┴───────────────────┴───────────────────┴──────────┐
//! │                   RenderContext (one per thread)                 │
//! │  DynamicSuballocationsManager x2   DynamicHeap   UploadHeap      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crates
//!
//! - `ember-core`: handles, fence values, backend traits, emulation
//! - `ember-alloc`: variable-size and ring allocators
//! - `ember-sync`: command queues and deferred release
//! - `ember-descriptor`: descriptor heaps
//! - `ember-memory`: dynamic GPU memory
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use ember::{
//!     DescriptorHeapType, DeviceCreateInfo, EmulatedDevice, EmulatedQueue, GpuQueue, RenderDevice,
//! };
//!
//! let queue = Arc::new(EmulatedQueue::auto_completing());
//! let device = RenderDevice::new(
//!     Arc::new(EmulatedDevice::new()),
//!     vec![queue as Arc<dyn GpuQueue>],
//!     DeviceCreateInfo::small(),
//! )
//! .unwrap();
//!
//! let rtv = device.allocate_descriptors(DescriptorHeapType::Rtv, 1).unwrap();
//! assert!(!rtv.is_null());
//!
//! let mut ctx = device.create_context("Main").unwrap();
//! let constants = ctx.allocate_dynamic_memory(256, 256).unwrap();
//! assert_eq!(constants.gpu_address().raw() % 256, 0);
//! ctx.flush().unwrap();
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod config;
pub mod context;
pub mod device;

// Re-exports
pub use config::DeviceCreateInfo;
pub use context::RenderContext;
pub use device::{RenderDevice, PRIMARY_QUEUE};

pub use ember_alloc::{FencedVariableSizeAllocator, RingBuffer, VariableSizeAllocator};
pub use ember_core::{
    queue_bit, BufferDesc, BufferFlags, CommandQueueMask, CpuDescriptorHandle, DescriptorHeapDesc,
    DescriptorHeapFlags, DescriptorHeapType, DeviceBackend, EmulatedDevice, EmulatedQueue, Error,
    FenceTracker, FenceValue, GpuAddr, GpuDescriptorHandle, GpuQueue, NativeBuffer,
    NativeDescriptorHeap, Result, MAX_COMMAND_QUEUES,
};
pub use ember_descriptor::{
    CpuDescriptorHeap, DescriptorAllocator, DescriptorHeapAllocation, DynamicSuballocationsManager,
    GpuDescriptorHeap, RetiredChunks,
};
pub use ember_memory::{
    DynamicAllocation, DynamicHeap, DynamicMemoryManager, DynamicUploadHeap, GpuRingBuffer,
    ReleasedPages,
};
pub use ember_sync::{CommandQueue, ResourceReleaseQueue};
