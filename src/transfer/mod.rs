//! Cross-process message transfer
//!
//! The send path reserves a slot in the receiver's buffer, resolves the
//! slot offset to an absolute destination address, and hands the range to
//! this module: pin the destination pages, stream the message through a
//! one-page window, release the pin. The receiver is never scheduled for
//! the hand-off.
//!
//! All calls run synchronously in the sending thread's context and may
//! block on memory-management locks. Transfers to the same destination
//! buffer must be serialized by the caller; per-transfer state is owned and
//! shares nothing across destinations.

mod copy;
mod pin;

pub use copy::{MessageSource, SliceSource, SourceFault};
pub use pin::PinnedRange;

use crate::mem::{PinError, VirtAddr};
use crate::target::TargetProcess;

/// Errors surfaced by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Bookkeeping allocation for the page list failed
    OutOfMemory,
    /// The target's memory space no longer exists
    TargetGone,
    /// Fewer pages could be pinned than the range spans
    ShortPin,
    /// The pinning primitive rejected the range
    Pin(PinError),
    /// A chunk could not be copied from the source
    CopyFault,
}

impl From<PinError> for TransferError {
    fn from(err: PinError) -> Self {
        TransferError::Pin(err)
    }
}

/// Copy `len` bytes from `source` into `to` in the target's memory space
///
/// Composed open, write, close. The pin never outlives the call: it is
/// released on success, on a faulted write, and on every open failure.
/// No step is retried; retry policy belongs to the caller.
pub fn transfer(
    target: &TargetProcess,
    to: VirtAddr,
    len: u64,
    source: &mut dyn MessageSource,
) -> Result<(), TransferError> {
    let mut range = PinnedRange::open(target, to, len)?;
    let result = range.write(source, len);
    range.close();

    if let Err(ref err) = result {
        log::debug!(
            "transfer of {} byte(s) to {:#x} failed: {:?}",
            len,
            to.as_u64(),
            err
        );
    }
    result
}
