//! Host-side command scheduler for a GPU FIFO block, with the buddy allocator that manages
//! GPU virtual address ranges.
//!
//! [`fifo::Fifo`] owns channels, time-slice groups and runlists for one device and drives
//! them through a [`hw::RegisterSpace`]. [`alloc::BuddyAllocator`] and [`alloc::VaSpace`] hand
//! out address ranges independently of the scheduler.

pub mod alloc;
pub mod error;
pub mod fifo;
pub mod hw;
pub mod utils;

pub use error::{FifoError, FifoResult, TargetKind};
