//! Windowed copy engine
//!
//! A message may span many pages. The copy walks the pinned list one page
//! at a time: map a window, fill the chunk, unmap, advance. No more than
//! one page is ever mapped for writing, and a fault stops the walk at the
//! chunk it happened in.

use super::{PinnedRange, TransferError};
use crate::mem::PAGE_SIZE;

/// A failed pull from a message source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFault;

/// Sender-side byte source of a transfer
///
/// Models memory that can fault while being read. An implementation either
/// fills the chunk completely or reports a fault; bytes it placed before
/// faulting stay in the destination (best effort, no rollback).
pub trait MessageSource {
    /// Copy the next `chunk.len()` bytes of the message into `chunk`
    fn pull(&mut self, chunk: &mut [u8]) -> Result<(), SourceFault>;
}

/// Adapts an in-kernel byte slice as a message source
///
/// Pulls consume the slice front to back. A pull past the end copies what
/// is left and faults, which is also how tests model a sender whose pages
/// vanish mid-copy.
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    read: usize,
}

impl<'a> SliceSource<'a> {
    /// Wrap a byte slice
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, read: 0 }
    }

    /// Bytes not yet pulled
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.read
    }
}

impl MessageSource for SliceSource<'_> {
    fn pull(&mut self, chunk: &mut [u8]) -> Result<(), SourceFault> {
        let have = self.remaining().min(chunk.len());
        chunk[..have].copy_from_slice(&self.bytes[self.read..self.read + have]);
        self.read += have;

        if have < chunk.len() {
            return Err(SourceFault);
        }
        Ok(())
    }
}

impl PinnedRange {
    /// Stream `len` bytes from `source` into the pinned range
    ///
    /// Chunks are bounded by the space left in the current page. On a
    /// fault the walk stops immediately with `CopyFault`: the cursor does
    /// not advance past the faulted chunk, bytes already placed stay, and
    /// the pin is left intact for the caller to close. Writing more than
    /// the range was opened for is a caller bug.
    pub fn write(
        &mut self,
        source: &mut dyn MessageSource,
        mut len: u64,
    ) -> Result<(), TransferError> {
        while len > 0 {
            let bytes = (PAGE_SIZE - self.pos).min(len);
            let start = self.pos as usize;

            let mut window = self.pages[self.cur].map();
            let faulted = source
                .pull(&mut window[start..start + bytes as usize])
                .is_err();
            drop(window);

            if faulted {
                return Err(TransferError::CopyFault);
            }

            self.pos += bytes;
            if self.pos == PAGE_SIZE {
                self.pos = 0;
                self.cur += 1;
            }
            len -= bytes;
        }

        Ok(())
    }
}
