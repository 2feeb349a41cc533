//! # Ember Offset Allocators
//!
//! Allocators that hand out integer offsets into a linear range. They know
//! nothing about descriptors or buffers; the heap and memory crates map
//! offsets to handles and addresses.
//!
//! - [`VariableSizeAllocator`]: best-fit free list with neighbour coalescing
//! - [`FencedVariableSizeAllocator`]: the same, with frees deferred until a
//!   fence value completes
//! - [`RingBuffer`]: circular bump allocator released frame by frame
//!
//! None of these types lock. Shared users wrap them in a mutex one level up.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod ring;
pub mod variable_size;

// Re-exports
pub use ring::{FrameTail, RingBuffer};
pub use variable_size::{FencedVariableSizeAllocator, StaleAllocation, VariableSizeAllocator};
