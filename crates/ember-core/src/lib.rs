//! # Ember Core
//!
//! Foundational types and traits shared by every Ember crate.
//!
//! This crate defines the vocabulary the allocators speak:
//!
//! - Strong handle types (CPU/GPU descriptor handles, GPU addresses)
//! - Fence values and the [`FenceTracker`] trait used to tag deferred frees
//! - The [`DeviceBackend`] / [`GpuQueue`] traits the platform implements
//! - Reference-counted ownership wrappers for native heaps and buffers
//! - A host emulation backend used by tests and headless tooling
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ember-core                            │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────────┐  │
//! │  │   Types    │  │  Backend   │  │   Native ownership     │  │
//! │  │ (handles,  │  │  traits    │  │  (heaps, buffers)      │  │
//! │  │  fences)   │  │            │  │                        │  │
//! │  └────────────┘  └────────────┘  └────────────────────────┘  │
//! │  ┌────────────┐  ┌──────────────────────────────────────────┐│
//! │  │   Error    │  │  Emulation (host device / host queue)    ││
//! │  └────────────┘  └──────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod backend;
pub mod emulation;
pub mod error;
pub mod native;
pub mod types;

// Re-exports for convenience
pub use backend::*;
pub use emulation::{EmulatedDevice, EmulatedQueue};
pub use error::{Error, Result};
pub use native::{NativeBuffer, NativeDescriptorHeap};
pub use types::*;
