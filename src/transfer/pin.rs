//! Page-range pinning
//!
//! Before any byte moves, the destination range is pinned: every page
//! spanned by `[to, to + len)` gets a frame reference that keeps it
//! resident until the transfer ends. Pins are all or nothing; a partial pin
//! is released and reported, never written through.
//!
//! Pinning may block while the space faults pages in or while another
//! transfer holds a frame window, so `open` must only be called from a
//! context that is allowed to sleep.

use super::TransferError;
use crate::mem::{pages_spanned, PageRef, VirtAddr, PAGE_SIZE};
use crate::target::TargetProcess;
use alloc::vec::Vec;

/// A pinned destination range with its write cursor
///
/// Exists only between `open` and `close`, never across transfers. Every
/// `open` that got past page-list reservation is paired with exactly one
/// release: `close` consumes the set, and any error path inside `open`
/// unwinds the references it already took.
pub struct PinnedRange {
    /// Pinned pages in address order
    pub(super) pages: Vec<PageRef>,
    /// Index of the page the next write lands in
    pub(super) cur: usize,
    /// Write position inside the current page
    pub(super) pos: u64,
}

impl PinnedRange {
    /// Pin the pages backing `len` bytes at `to` in the target's space
    ///
    /// Fails with `OutOfMemory` if the page list cannot be reserved,
    /// `TargetGone` if the target's memory space is already torn down,
    /// `Pin` if the pinning primitive rejects the range, and `ShortPin` if
    /// fewer pages than the range spans could be pinned. No pin survives a
    /// failed open.
    pub fn open(
        target: &TargetProcess,
        to: VirtAddr,
        len: u64,
    ) -> Result<Self, TransferError> {
        let count = pages_spanned(to, len) as usize;

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| TransferError::OutOfMemory)?;

        let space = target
            .memory_space()
            .ok_or(TransferError::TargetGone)?;

        let first = to.align_down(PAGE_SIZE);
        space.pin_range(first, count, &mut pages)?;

        if pages.len() < count {
            // The short list unwinds its pins as it drops
            log::debug!(
                "short pin at {:#x}: {} of {} page(s)",
                to.as_u64(),
                pages.len(),
                count
            );
            return Err(TransferError::ShortPin);
        }

        log::trace!(
            "pinned {} page(s) for {} byte(s) at {:#x}",
            count,
            len,
            to.as_u64()
        );

        Ok(Self {
            pages,
            cur: 0,
            pos: to.as_u64() - first.as_u64(),
        })
    }

    /// Number of pinned pages
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Unpin every page and release the page list
    pub fn close(self) {
        log::trace!("unpinning {} page(s)", self.pages.len());
        // Each reference unpins its frame as the list drops
    }
}
