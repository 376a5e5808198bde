//! # Courier
//!
//! Message-transport core for the in-kernel bus: the layer where raw memory
//! ownership crosses a process boundary. A sender hands a message to a
//! receiver by writing it directly into a region the receiver registered,
//! without the receiver being scheduled or aware of the transfer.
//!
//! ## Design
//!
//! - **Receiver-owned buffers**: inbound space is carved out of the
//!   receiver's registered region by a bump allocator that reclaims
//!   everything at once when the last slot is released.
//! - **Scoped pinning**: destination pages are pinned for exactly one
//!   transfer, and every exit path releases the pin.
//! - **One-page windows**: the copy engine maps a single page at a time,
//!   keeping the copy interruptible at page boundaries.
//!
//! Connection lifecycle, naming, metadata, polling and wire encoding live
//! in their own subsystems; this crate only places bytes and accounts for
//! the space they use.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod buffer;
pub mod mem;
pub mod target;
pub mod transfer;

pub use buffer::{AllocError, BufferStats, FreeListBuffer, ReceiverBuffer, Slot, SlotAllocator};
pub use mem::{MemorySpace, Protection, VirtAddr, PAGE_SIZE};
pub use target::{ProcessId, TargetProcess};
pub use transfer::{transfer, MessageSource, PinnedRange, SliceSource, TransferError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the transport core
pub fn init() {
    log::debug!("bus transport core v{VERSION} initialized");
}
