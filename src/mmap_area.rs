use std::io;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use errno::errno;
use libc::{
    c_int, c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_POPULATE,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::{is_pow_of_two, page_size};
use crate::xdp::XDP_UMEM_MIN_CHUNK_SIZE;

/// A mapped memory area, split into equal frames, used to move packets between the kernel and
/// userspace.
///
/// Frames are addressed by their byte offset from the start of the area. The area never hands
/// out references on its own; callers go through [`crate::socket::Socket`], which knows which
/// side currently owns a frame.
#[derive(Debug)]
pub struct MmapArea {
    frame_num: usize,
    frame_size: usize,
    ptr: NonNull<u8>,
    huge_tlb: bool,
}

// The area is plain memory. Who may touch which frame is decided by the ring ownership protocol.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("invalid frame geometry: {frame_num} frames of {frame_size} bytes")]
    InvalidGeometry { frame_num: usize, frame_size: usize },

    #[error("mmap of {len} bytes failed: {source}")]
    Failed { len: usize, source: io::Error },
}

/// Configuration options for MmapArea
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAreaOptions {
    /// If set to true, the mmap call is first tried with MAP_HUGETLB
    pub huge_tlb: bool,
}

impl MmapArea {
    /// Allocate a new memory mapped area based on the size and number of frames
    ///
    /// # Arguments
    ///
    /// * frame_num: The number of frames to allocate in the memory mapped area
    /// * frame_size: The length of each frame, a power of two between 2048 and the page size
    /// * options: Configuration options
    pub fn new(
        frame_num: usize,
        frame_size: usize,
        options: MmapAreaOptions,
    ) -> Result<Arc<MmapArea>, MmapError> {
        let geometry_err = MmapError::InvalidGeometry {
            frame_num,
            frame_size,
        };

        if frame_num == 0
            || frame_size < XDP_UMEM_MIN_CHUNK_SIZE
            || frame_size > page_size()
            || frame_size > u32::MAX as usize
            || !is_pow_of_two(frame_size as u32)
        {
            return Err(geometry_err);
        }
        let len = match frame_num.checked_mul(frame_size) {
            Some(len) => len,
            None => return Err(geometry_err),
        };

        let mut huge_tlb = options.huge_tlb;
        let mut ptr = map_anonymous(len, huge_tlb);
        if ptr.is_none() && huge_tlb {
            debug!("MAP_HUGETLB unavailable (errno {}), using regular pages", errno().0);
            huge_tlb = false;
            ptr = map_anonymous(len, false);
        }

        let ptr = match ptr {
            Some(ptr) => ptr,
            None => {
                return Err(MmapError::Failed {
                    len,
                    source: io::Error::last_os_error(),
                })
            }
        };

        info!(
            "mapped {} frames of {} bytes ({} bytes, huge_tlb={})",
            frame_num, frame_size, len, huge_tlb
        );

        Ok(Arc::new(MmapArea {
            frame_num,
            frame_size,
            ptr,
            huge_tlb,
        }))
    }

    pub fn frame_num(&self) -> usize {
        self.frame_num
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Total capacity in bytes.
    pub fn len(&self) -> usize {
        self.frame_num * self.frame_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn huge_tlb(&self) -> bool {
        self.huge_tlb
    }

    /// Offsets of every frame, in ascending order.
    pub fn frame_addrs(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.frame_num).map(move |i| (i * self.frame_size) as u64)
    }

    /// The start of the frame containing `addr`. Descriptors coming back from the kernel may
    /// point past the frame start by the headroom.
    pub fn frame_base(&self, addr: u64) -> u64 {
        addr & !(self.frame_size as u64 - 1)
    }

    /// Index of the frame containing `addr`, if `addr` is inside the area.
    pub fn frame_index(&self, addr: u64) -> Option<usize> {
        if addr >= self.len() as u64 {
            return None;
        }

        Some((addr / self.frame_size as u64) as usize)
    }

    /// Byte range `[addr, addr + len)` if it lies entirely inside a single frame.
    pub fn range(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        self.frame_index(addr)?;

        let start = addr as usize;
        let frame_end = self.frame_base(addr) as usize + self.frame_size;
        let end = start.checked_add(len)?;
        if end > frame_end {
            return None;
        }

        Some(start..end)
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// `range` must come from [`MmapArea::range`] and nothing may write to those bytes while the
    /// returned slice lives.
    pub(crate) unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr().add(range.start), range.len())
    }

    /// # Safety
    ///
    /// `range` must come from [`MmapArea::range`] and the caller must be the only party
    /// accessing those bytes while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(range.start), range.len())
    }
}

fn map_anonymous(len: usize, huge_tlb: bool) -> Option<NonNull<u8>> {
    let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE;
    if huge_tlb {
        flags |= MAP_HUGETLB;
    }

    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return None;
    }

    NonNull::new(ptr as *mut u8)
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let r = unsafe { munmap(self.ptr.as_ptr() as *mut c_void, self.len()) };

        if r != 0 {
            warn!("munmap failed errno: {}", errno().0);
        }
    }
}
