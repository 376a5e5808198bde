//! Per-process memory spaces and page pinning
//!
//! A `MemorySpace` is the transport core's view of one process's registered
//! pages. The pin primitive walks it and takes per-frame references that keep
//! the backing frames resident while a transfer is in flight; unmapping a
//! pinned page removes it from the space but the frame itself survives until
//! the last pin drops.
//!
//! ## Pinning rules
//!
//! - Pins are taken page by page, front to back. If the first page of a
//!   range cannot be pinned the primitive reports an error; if a later page
//!   cannot, the primitive stops and hands back a short list. The caller
//!   decides whether a short pin is acceptable (the transfer engine never
//!   accepts one).
//! - A pinned page is always writable. Read-only mappings refuse the pin.
//! - Pinning and window mapping may block on the space lock or on a frame
//!   lock held by another transfer, so both must run in a context that is
//!   allowed to sleep.

use super::{PhysAddr, VirtAddr, PAGE_SIZE};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard, RwLock};

const PAGE_LEN: usize = PAGE_SIZE as usize;

/// Monotonic frame tag source; tags identify frames in logs
static NEXT_FRAME: AtomicU64 = AtomicU64::new(PAGE_SIZE);

bitflags! {
    /// Page protection flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Page may be read
        const READ = 1 << 0;
        /// Page may be written
        const WRITE = 1 << 1;
        /// Page is visible to userspace
        const USER = 1 << 2;
    }
}

/// Errors from mapping and reading a memory space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceError {
    /// Region base is not page aligned
    Misaligned,
    /// Region overlaps an existing mapping
    Overlap,
    /// Address not mapped
    NotMapped,
}

/// Errors reported by the pinning primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// The first page of the range is not mapped
    NotMapped,
    /// The first page of the range is not writable
    NotWritable,
}

/// One page frame: its bytes plus pin accounting
///
/// Frames are reference counted. The space holds one reference per mapping
/// and every pin holds another, so a frame outlives its mapping for as long
/// as any transfer still has it pinned.
struct PageFrame {
    /// Frame tag, stable for the lifetime of the frame
    frame: PhysAddr,
    /// Number of outstanding pins
    pins: AtomicU32,
    /// Frame contents, locked while a window maps them
    data: Mutex<[u8; PAGE_LEN]>,
}

impl PageFrame {
    fn new() -> Arc<Self> {
        let frame = PhysAddr::new(NEXT_FRAME.fetch_add(PAGE_SIZE, Ordering::Relaxed));
        Arc::new(Self {
            frame,
            pins: AtomicU32::new(0),
            data: Mutex::new([0; PAGE_LEN]),
        })
    }
}

/// A pinned reference to one page frame
///
/// Holding a `PageRef` keeps the frame resident. The pin is released when
/// the reference drops, so every exit path of a transfer releases exactly
/// once.
pub struct PageRef {
    frame: Arc<PageFrame>,
}

impl PageRef {
    /// Map the page into an addressable window for writing
    ///
    /// Blocks while another transfer holds a window on the same frame.
    pub fn map(&self) -> PageWindow<'_> {
        PageWindow {
            guard: self.frame.data.lock(),
        }
    }

    /// Frame tag, for diagnostics
    pub fn frame(&self) -> PhysAddr {
        self.frame.frame
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let prev = self.frame.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced page unpin");
    }
}

/// A page temporarily mapped for writing; unmaps on drop
pub struct PageWindow<'a> {
    guard: MutexGuard<'a, [u8; PAGE_LEN]>,
}

impl Deref for PageWindow<'_> {
    type Target = [u8; PAGE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageWindow<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// A mapped page inside a space
struct MappedPage {
    frame: Arc<PageFrame>,
    prot: Protection,
}

/// Page table of one process, as seen by the transport core
pub struct MemorySpace {
    /// Page-aligned base address of each resident page
    pages: RwLock<HashMap<VirtAddr, MappedPage>>,
}

impl MemorySpace {
    /// Create an empty space
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
        }
    }

    /// Map `len` bytes of zeroed pages at `base`
    ///
    /// `len` is rounded up to page granularity. The base must be page
    /// aligned and the region must not overlap an existing mapping.
    pub fn map(&self, base: VirtAddr, len: u64, prot: Protection) -> Result<(), SpaceError> {
        if base.page_offset() != 0 {
            return Err(SpaceError::Misaligned);
        }
        let count = (len + PAGE_SIZE - 1) / PAGE_SIZE;

        let mut pages = self.pages.write();
        for i in 0..count {
            let page = VirtAddr::new(base.as_u64() + i * PAGE_SIZE);
            if pages.contains_key(&page) {
                return Err(SpaceError::Overlap);
            }
        }
        for i in 0..count {
            let page = VirtAddr::new(base.as_u64() + i * PAGE_SIZE);
            pages.insert(
                page,
                MappedPage {
                    frame: PageFrame::new(),
                    prot,
                },
            );
        }

        log::trace!("mapped {} page(s) at {:#x}", count, base.as_u64());
        Ok(())
    }

    /// Unmap up to `len` bytes of pages at `base`
    ///
    /// Pages not present are skipped. Frames of pinned pages stay alive
    /// until the last pin drops; only the mapping goes away.
    pub fn unmap(&self, base: VirtAddr, len: u64) -> Result<(), SpaceError> {
        if base.page_offset() != 0 {
            return Err(SpaceError::Misaligned);
        }
        let count = (len + PAGE_SIZE - 1) / PAGE_SIZE;

        let mut pages = self.pages.write();
        for i in 0..count {
            let page = VirtAddr::new(base.as_u64() + i * PAGE_SIZE);
            pages.remove(&page);
        }

        log::trace!("unmapped {} page(s) at {:#x}", count, base.as_u64());
        Ok(())
    }

    /// Pin up to `count` writable pages starting at the page-aligned `first`
    ///
    /// Appends one `PageRef` per pinned page to `out`, in address order.
    /// Fails if the first page refuses the pin; stops early and leaves a
    /// short list if a later page does.
    pub fn pin_range(
        &self,
        first: VirtAddr,
        count: usize,
        out: &mut Vec<PageRef>,
    ) -> Result<(), PinError> {
        let pages = self.pages.read();

        for i in 0..count {
            let page = VirtAddr::new(first.as_u64() + i as u64 * PAGE_SIZE);
            let mapped = match pages.get(&page) {
                Some(mapped) if mapped.prot.contains(Protection::WRITE) => mapped,
                Some(_) if i == 0 => return Err(PinError::NotWritable),
                None if i == 0 => return Err(PinError::NotMapped),
                _ => break,
            };

            mapped.frame.pins.fetch_add(1, Ordering::AcqRel);
            out.push(PageRef {
                frame: mapped.frame.clone(),
            });
        }

        Ok(())
    }

    /// Read `buf.len()` bytes starting at `addr`
    ///
    /// This is the receive-side access path: the receiver consumes a
    /// delivered message from its own registered region.
    pub fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), SpaceError> {
        let pages = self.pages.read();

        let mut page = addr.align_down(PAGE_SIZE);
        let mut pos = addr.page_offset() as usize;
        let mut copied = 0;

        while copied < buf.len() {
            let mapped = pages.get(&page).ok_or(SpaceError::NotMapped)?;
            let bytes = (PAGE_LEN - pos).min(buf.len() - copied);
            let data = mapped.frame.data.lock();
            buf[copied..copied + bytes].copy_from_slice(&data[pos..pos + bytes]);
            copied += bytes;
            pos = 0;
            page = VirtAddr::new(page.as_u64() + PAGE_SIZE);
        }

        Ok(())
    }

    /// Outstanding pin count of the page containing `addr`
    pub fn pin_count(&self, addr: VirtAddr) -> Option<u32> {
        let pages = self.pages.read();
        let mapped = pages.get(&addr.align_down(PAGE_SIZE))?;
        Some(mapped.frame.pins.load(Ordering::Acquire))
    }

    /// Number of resident pages
    pub fn resident(&self) -> usize {
        self.pages.read().len()
    }
}

impl Default for MemorySpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: Protection = Protection::READ.union(Protection::WRITE).union(Protection::USER);

    #[test]
    fn test_map_read_zeroed() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();

        let mut buf = [0xAA; 16];
        space.read(VirtAddr::new(0x1008), &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn test_map_rejects_misaligned_base() {
        let space = MemorySpace::new();
        assert_eq!(
            space.map(VirtAddr::new(0x1008), PAGE_SIZE, RW),
            Err(SpaceError::Misaligned)
        );
    }

    #[test]
    fn test_map_rejects_overlap() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), 2 * PAGE_SIZE, RW).unwrap();
        assert_eq!(
            space.map(VirtAddr::new(0x2000), PAGE_SIZE, RW),
            Err(SpaceError::Overlap)
        );
        // Failed map leaves the space unchanged
        assert_eq!(space.resident(), 2);
    }

    #[test]
    fn test_read_unmapped() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();
        space.unmap(VirtAddr::new(0x1000), PAGE_SIZE).unwrap();

        let mut buf = [0; 4];
        assert_eq!(
            space.read(VirtAddr::new(0x1000), &mut buf),
            Err(SpaceError::NotMapped)
        );
    }

    #[test]
    fn test_pin_and_release() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();

        let mut pins = Vec::new();
        space.pin_range(VirtAddr::new(0x1000), 1, &mut pins).unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(space.pin_count(VirtAddr::new(0x1000)), Some(1));

        {
            let mut window = pins[0].map();
            window[..3].copy_from_slice(b"abc");
        }

        let mut buf = [0; 3];
        space.read(VirtAddr::new(0x1000), &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        pins.clear();
        assert_eq!(space.pin_count(VirtAddr::new(0x1000)), Some(0));
    }

    #[test]
    fn test_pinned_frame_survives_unmap() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();

        let mut pins = Vec::new();
        space.pin_range(VirtAddr::new(0x1000), 1, &mut pins).unwrap();

        space.unmap(VirtAddr::new(0x1000), PAGE_SIZE).unwrap();
        assert_eq!(space.resident(), 0);

        // The pinned frame is still writable through the window
        let mut window = pins[0].map();
        window[0] = 0xFF;
    }

    #[test]
    fn test_pin_first_page_missing() {
        let space = MemorySpace::new();
        let mut pins = Vec::new();
        assert_eq!(
            space.pin_range(VirtAddr::new(0x1000), 1, &mut pins),
            Err(PinError::NotMapped)
        );
        assert!(pins.is_empty());
    }

    #[test]
    fn test_pin_first_page_readonly() {
        let space = MemorySpace::new();
        space
            .map(VirtAddr::new(0x1000), PAGE_SIZE, Protection::READ)
            .unwrap();

        let mut pins = Vec::new();
        assert_eq!(
            space.pin_range(VirtAddr::new(0x1000), 1, &mut pins),
            Err(PinError::NotWritable)
        );
    }

    #[test]
    fn test_pin_stops_short_at_hole() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();
        space.map(VirtAddr::new(0x3000), PAGE_SIZE, RW).unwrap();

        let mut pins = Vec::new();
        space.pin_range(VirtAddr::new(0x1000), 3, &mut pins).unwrap();
        assert_eq!(pins.len(), 1);
    }

    #[test]
    fn test_pin_stops_short_at_readonly() {
        let space = MemorySpace::new();
        space.map(VirtAddr::new(0x1000), PAGE_SIZE, RW).unwrap();
        space
            .map(VirtAddr::new(0x2000), PAGE_SIZE, Protection::READ)
            .unwrap();

        let mut pins = Vec::new();
        space.pin_range(VirtAddr::new(0x1000), 2, &mut pins).unwrap();
        assert_eq!(pins.len(), 1);
    }
}
