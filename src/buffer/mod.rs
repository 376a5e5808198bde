//! Receiver buffers and slot allocation
//!
//! At send time a message is placed directly into the buffer the receiving
//! process registered at connection setup. The receiver later consumes the
//! message at the returned offset and releases the slot.
//!
//! `ReceiverBuffer` keeps the bump policy the queue was built around: slots
//! are handed out monotonically and all space is reclaimed at once when the
//! last outstanding slot is released. Individually released slots are not
//! reused before that point. `FreeListBuffer` is the out-of-order
//! alternative for callers that cannot tolerate the full-reset behavior.
//!
//! Neither allocator carries a lock. All mutation goes through `&mut self`;
//! the connection holding the buffer serializes access.

mod freelist;

pub use freelist::FreeListBuffer;

use crate::mem::{align_up, VirtAddr};

/// Slot offsets are 8-byte aligned
pub const SLOT_ALIGN: u64 = 8;

/// Errors from slot allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The slot does not fit in the remaining buffer space
    OutOfSpace,
}

/// One reserved byte range in a receiver buffer
///
/// Slots are owned handles: releasing one consumes it, so the same slot
/// cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Slot {
    offset: u64,
    len: u64,
}

impl Slot {
    /// Byte offset of the slot inside its buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Slot length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the slot covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Common contract of the slot allocation policies
///
/// Callers must serialize allocate and release per buffer; the `&mut`
/// receivers make that a compile-checked precondition.
pub trait SlotAllocator {
    /// Reserve an aligned slot of `len` bytes
    fn allocate(&mut self, len: u64) -> Result<Slot, AllocError>;

    /// Return a slot; `None` is a no-op
    ///
    /// Releasing into a buffer with no outstanding slots is a caller bug
    /// and aborts.
    fn release(&mut self, slot: Option<Slot>);

    /// Number of slots allocated but not yet released
    fn outstanding(&self) -> u32;
}

/// Allocation counters of one receiver buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    /// Slots handed out since creation
    pub allocations: u64,
    /// Times the cursor was reset to the start
    pub resets: u64,
    /// Highest cursor position reached
    pub peak_cursor: u64,
}

/// A contiguous region registered by the receiving process for inbound
/// messages
pub struct ReceiverBuffer {
    /// Base address in the receiver's address space
    base: VirtAddr,
    /// Total size in bytes
    size: u64,
    /// Current allocation cursor, always 8-byte aligned after allocation
    pos: u64,
    /// Outstanding (unreleased) slots
    users: u32,
    stats: BufferStats,
}

impl ReceiverBuffer {
    /// Wrap a registered region as a receiver buffer
    pub fn new(base: VirtAddr, size: u64) -> Self {
        Self {
            base,
            size,
            pos: 0,
            users: 0,
            stats: BufferStats::default(),
        }
    }

    /// Base address of the region
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Total size of the region
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current allocation cursor
    pub fn cursor(&self) -> u64 {
        self.pos
    }

    /// Number of outstanding slots
    pub fn outstanding(&self) -> u32 {
        self.users
    }

    /// Allocation counters
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Absolute destination address of a slot
    ///
    /// The send path resolves the slot offset to this address before
    /// handing the range to the transfer engine.
    pub fn slot_address(&self, slot: &Slot) -> VirtAddr {
        VirtAddr::new(self.base.as_u64() + slot.offset)
    }

    /// Reserve a slot of `len` bytes at the aligned cursor
    pub fn allocate(&mut self, len: u64) -> Result<Slot, AllocError> {
        let pos = align_up(self.pos, SLOT_ALIGN);
        let end = pos.checked_add(len).ok_or(AllocError::OutOfSpace)?;
        if end > self.size {
            log::trace!(
                "buffer full: want {} at {} of {}",
                len,
                pos,
                self.size
            );
            return Err(AllocError::OutOfSpace);
        }

        self.pos = end;
        self.users += 1;
        self.stats.allocations += 1;
        self.stats.peak_cursor = self.stats.peak_cursor.max(end);

        Ok(Slot { offset: pos, len })
    }

    /// Release a slot; releasing the last outstanding slot resets the cursor
    ///
    /// All space consumed since the previous reset is reclaimed at once.
    // TODO: switch the send path to FreeListBuffer once receivers tolerate
    // out-of-order reuse.
    pub fn release(&mut self, slot: Option<Slot>) {
        // The handle is consumed here; only the count matters to this policy
        let Some(_slot) = slot else {
            return;
        };

        assert!(self.users > 0, "slot released on an empty buffer");

        self.users -= 1;
        if self.users == 0 {
            self.pos = 0;
            self.stats.resets += 1;
            log::trace!("buffer drained, cursor reset");
        }
    }
}

impl SlotAllocator for ReceiverBuffer {
    fn allocate(&mut self, len: u64) -> Result<Slot, AllocError> {
        ReceiverBuffer::allocate(self, len)
    }

    fn release(&mut self, slot: Option<Slot>) {
        ReceiverBuffer::release(self, slot)
    }

    fn outstanding(&self) -> u32 {
        self.users
    }
}
