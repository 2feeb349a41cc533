//! # Ember Synchronization
//!
//! GPU timeline bookkeeping on the CPU side.
//!
//! - [`CommandQueue`]: hands out fence values for submissions and caches
//!   the last value the GPU reported complete
//! - [`ResourceReleaseQueue`]: keeps objects alive until the fence value
//!   they were released under has completed
//!
//! Every deferred free in Ember follows the same rule: tag with the fence
//! value of the *next* submission, reclaim once the completed value has
//! reached the tag.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod queue;
pub mod release_queue;

// Re-exports
pub use queue::CommandQueue;
pub use release_queue::{ResourceReleaseQueue, StaleResource};
