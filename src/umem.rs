use std::cmp::min;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::mmap_area::MmapArea;
use crate::ring::{RingCons, RingError, RingProd};
use crate::util::setsockopt;
use crate::xdp::{
    XdpRingOffset, XdpUmemReg, SOL_XDP, XDP_UMEM_COMPLETION_RING, XDP_UMEM_FILL_RING,
    XDP_UMEM_PGOFF_COMPLETION_RING, XDP_UMEM_PGOFF_FILL_RING, XDP_UMEM_REG,
};

/// AF_XDP Umem: the frame area as seen by the device, plus the headroom the device leaves in
/// front of received packets.
#[derive(Debug)]
pub struct Umem {
    area: Arc<MmapArea>,
    headroom: u32,
}

/// Completion queue per Umem
#[derive(Debug)]
pub struct UmemCompletionQueue {
    cq: RingCons<u64>,
}

/// Fill queue per Umem
#[derive(Debug)]
pub struct UmemFillQueue {
    fq: RingProd<u64>,
}

#[derive(Debug, Error)]
pub enum UmemError {
    #[error("UMEM registration failed: {0}")]
    Register(io::Error),

    #[error("sizing the {ring} ring failed: {source}")]
    RingSize {
        ring: &'static str,
        source: io::Error,
    },

    #[error("mapping the {ring} ring failed: {source}")]
    Ring {
        ring: &'static str,
        source: RingError,
    },
}

impl Umem {
    /// Register `area` with the AF_XDP socket `fd` and size its fill and completion rings.
    pub(crate) fn register(
        fd: RawFd,
        area: Arc<MmapArea>,
        headroom: u32,
        fill_size: u32,
        comp_size: u32,
    ) -> Result<Umem, UmemError> {
        let reg = XdpUmemReg {
            addr: area.as_ptr() as u64,
            len: area.len() as u64,
            chunk_size: area.frame_size() as u32,
            headroom,
            flags: 0,
        };

        setsockopt(fd, SOL_XDP, XDP_UMEM_REG, &reg).map_err(UmemError::Register)?;

        setsockopt(fd, SOL_XDP, XDP_UMEM_FILL_RING, &fill_size).map_err(|source| {
            UmemError::RingSize {
                ring: "fill",
                source,
            }
        })?;
        setsockopt(fd, SOL_XDP, XDP_UMEM_COMPLETION_RING, &comp_size).map_err(|source| {
            UmemError::RingSize {
                ring: "completion",
                source,
            }
        })?;

        info!(
            "umem registered: frames={} frame_size={} headroom={} fill={} comp={}",
            area.frame_num(),
            area.frame_size(),
            headroom,
            fill_size,
            comp_size
        );

        Ok(Umem { area, headroom })
    }

    /// A Umem that is never registered with the kernel, for in-process links.
    pub(crate) fn local(area: Arc<MmapArea>, headroom: u32) -> Umem {
        Umem { area, headroom }
    }

    pub fn area(&self) -> &Arc<MmapArea> {
        &self.area
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }
}

impl UmemCompletionQueue {
    pub(crate) fn new(cq: RingCons<u64>) -> UmemCompletionQueue {
        UmemCompletionQueue { cq }
    }

    /// # Safety
    ///
    /// `fd` must carry a registered Umem whose completion ring was sized to `size`.
    pub(crate) unsafe fn map(
        fd: RawFd,
        off: &XdpRingOffset,
        size: u32,
    ) -> Result<UmemCompletionQueue, UmemError> {
        let cq = RingCons::from_socket(fd, XDP_UMEM_PGOFF_COMPLETION_RING, off, size).map_err(
            |source| UmemError::Ring {
                ring: "completion",
                source,
            },
        )?;

        Ok(UmemCompletionQueue { cq })
    }

    /// After packets have been transmitted, the frame is returned via the completion queue. The
    /// service method moves up to `batch_size` completed frame offsets into `bufs`.
    #[inline]
    pub fn service(&mut self, bufs: &mut Vec<u64>, batch_size: usize) -> usize {
        let mut idx: u32 = 0;
        let batch_size = min(batch_size, u32::MAX as usize) as u32;

        let ready = self.cq.peek(batch_size, &mut idx);
        if ready == 0 {
            return 0;
        }

        for i in 0..ready {
            bufs.push(self.cq.get(idx.wrapping_add(i)));
        }

        self.cq.release(ready);

        ready as usize
    }

    pub fn capacity(&self) -> u32 {
        self.cq.capacity()
    }
}

impl UmemFillQueue {
    pub(crate) fn new(fq: RingProd<u64>) -> UmemFillQueue {
        UmemFillQueue { fq }
    }

    /// # Safety
    ///
    /// `fd` must carry a registered Umem whose fill ring was sized to `size`.
    pub(crate) unsafe fn map(
        fd: RawFd,
        off: &XdpRingOffset,
        size: u32,
    ) -> Result<UmemFillQueue, UmemError> {
        let fq = RingProd::from_socket(fd, XDP_UMEM_PGOFF_FILL_RING, off, size).map_err(
            |source| UmemError::Ring {
                ring: "fill",
                source,
            },
        )?;

        Ok(UmemFillQueue { fq })
    }

    /// Free slots in the fill ring, refreshed from the device only if fewer than `wanted`.
    #[inline]
    pub fn free(&mut self, wanted: usize) -> usize {
        let wanted = min(wanted, u32::MAX as usize) as u32;

        self.fq.free(wanted) as usize
    }

    /// In order to receive packets, the link needs frames to write the packets to. These frames
    /// are sent from userspace to the device via the fill queue. Frames are taken from the back
    /// of `bufs`; returns how many were submitted, 0 if the ring had no room for the batch.
    #[inline]
    pub fn fill(&mut self, bufs: &mut Vec<u64>, batch_size: usize) -> usize {
        let mut idx: u32 = 0;
        let batch_size = min(bufs.len(), batch_size);
        let batch_size = min(batch_size, u32::MAX as usize) as u32;

        let ready = self.fq.reserve(batch_size, &mut idx);
        if ready == 0 {
            return 0;
        }

        let start = bufs.len() - ready as usize;
        for (i, addr) in bufs.drain(start..).rev().enumerate() {
            self.fq.set(idx.wrapping_add(i as u32), addr);
        }

        self.fq.submit(ready);

        ready as usize
    }

    #[inline]
    pub fn needs_wakeup(&self) -> bool {
        self.fq.needs_wakeup()
    }

    pub fn capacity(&self) -> u32 {
        self.fq.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_pair;

    #[test]
    fn fill_takes_from_back() {
        let (prod, mut cons) = ring_pair::<u64>(4).unwrap();
        let mut fq = UmemFillQueue::new(prod);

        let mut bufs = vec![0, 2048, 4096, 6144, 8192];
        assert_eq!(fq.fill(&mut bufs, 8), 0, "batch larger than the ring is refused whole");
        assert_eq!(fq.fill(&mut bufs, 3), 3);
        assert_eq!(bufs, vec![0, 2048]);

        let mut idx = 0;
        assert_eq!(cons.peek(8, &mut idx), 3);
        let got: Vec<u64> = (0..3).map(|i| cons.get(idx + i)).collect();
        assert_eq!(got, vec![8192, 6144, 4096]);
        cons.release(3);

        assert_eq!(fq.free(4), 4);
    }

    #[test]
    fn service_drains_in_ring_order() {
        let (mut prod, cons) = ring_pair::<u64>(8).unwrap();
        let mut cq = UmemCompletionQueue::new(cons);

        let mut idx = 0;
        prod.reserve(3, &mut idx);
        for (i, addr) in [4096u64, 0, 2048].iter().enumerate() {
            prod.set(idx + i as u32, *addr);
        }
        prod.submit(3);

        let mut bufs = Vec::new();
        assert_eq!(cq.service(&mut bufs, 2), 2);
        assert_eq!(cq.service(&mut bufs, 64), 1);
        assert_eq!(cq.service(&mut bufs, 64), 0);
        assert_eq!(bufs, vec![4096, 0, 2048]);
    }
}
