use std::cmp::min;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use errno::errno;
use libc::{
    poll, pollfd, recvfrom, sendto, EAGAIN, EBUSY, EINTR, ENETDOWN, ENOBUFS, MSG_DONTWAIT,
    POLLERR, POLLHUP, POLLIN, POLLNVAL, SOCK_RAW,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buf_pool::BufPool;
use crate::buf_pool_vec::{BufPoolVec, FrameCounts, FrameState};
use crate::loopback::LoopbackLink;
use crate::mmap_area::{MmapArea, MmapAreaOptions, MmapError};
use crate::ring::{RingCons, RingError, RingProd};
use crate::umem::{Umem, UmemCompletionQueue, UmemError, UmemFillQueue};
use crate::util::{getsockopt, if_index, is_pow_of_two, page_size, setsockopt};
use crate::xdp::{
    SockaddrXdp, XdpDesc, XdpMmapOffsets, XdpStatistics, AF_XDP, SOL_XDP, XDP_COPY,
    XDP_MMAP_OFFSETS, XDP_PGOFF_RX_RING, XDP_PGOFF_TX_RING, XDP_RX_RING, XDP_STATISTICS,
    XDP_TX_RING, XDP_UMEM_MIN_CHUNK_SIZE, XDP_USE_NEED_WAKEUP, XDP_ZEROCOPY,
};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid socket configuration: {0}")]
    InvalidConfig(String),

    #[error("no such interface: {0}")]
    NoSuchInterface(String),

    #[error("bind to {if_name} queue {queue} failed: {source}")]
    DeviceBind {
        if_name: String,
        queue: u32,
        source: io::Error,
    },

    #[error("{what} failed: {source}")]
    Resource {
        what: &'static str,
        source: io::Error,
    },

    #[error(transparent)]
    Mmap(#[from] MmapError),

    #[error("mapping the {ring} ring failed: {source}")]
    Ring {
        ring: &'static str,
        source: RingError,
    },

    #[error(transparent)]
    Umem(#[from] UmemError),

    #[error("descriptor addr={addr} len={len} does not refer to a frame owned by the application")]
    InvalidDescriptor { addr: u64, len: u32 },

    #[error("wakeup failed: {0}")]
    Wakeup(io::Error),

    #[error("poll failed: {0}")]
    Poll(io::Error),

    #[error("socket closed")]
    Closed,
}

/// Configuration options for Socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// Bytes per frame, a power of two between 2048 and the page size
    pub frame_size: usize,

    /// Number of frames in the area
    pub frame_num: usize,

    pub fill_size: u32,
    pub comp_size: u32,
    pub rx_size: u32,
    pub tx_size: u32,

    /// Bytes the device leaves free in front of each received packet
    pub frame_headroom: u32,

    /// Most descriptors moved per ring operation
    pub batch_size: usize,

    /// Try to back the area with huge pages
    pub huge_tlb: bool,

    /// Force XDP zero copy mode (XDP_ZEROCOPY flag)
    pub zero_copy: bool,

    /// Force XDP copy mode (XDP_COPY flag)
    pub copy: bool,

    /// Let the device ask for wakeups instead of kicking it on every transmit
    pub need_wakeup: bool,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            frame_size: 4096,
            frame_num: 4096,
            fill_size: 2048,
            comp_size: 2048,
            rx_size: 2048,
            tx_size: 2048,
            frame_headroom: 0,
            batch_size: 64,
            huge_tlb: false,
            zero_copy: false,
            copy: false,
            need_wakeup: true,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<(), SocketError> {
        let invalid = |msg: String| Err(SocketError::InvalidConfig(msg));

        if self.frame_num == 0 {
            return invalid("frame_num must be non-zero".into());
        }
        if self.frame_size < XDP_UMEM_MIN_CHUNK_SIZE
            || self.frame_size > page_size()
            || !is_pow_of_two(self.frame_size as u32)
        {
            return invalid(format!(
                "frame_size {} must be a power of two between {} and {}",
                self.frame_size,
                XDP_UMEM_MIN_CHUNK_SIZE,
                page_size()
            ));
        }
        if self.frame_headroom as usize >= self.frame_size {
            return invalid(format!(
                "frame_headroom {} leaves no room in a {} byte frame",
                self.frame_headroom, self.frame_size
            ));
        }

        let rings = [
            ("fill_size", self.fill_size),
            ("comp_size", self.comp_size),
            ("rx_size", self.rx_size),
            ("tx_size", self.tx_size),
        ];
        for (name, size) in rings.iter() {
            if !is_pow_of_two(*size) {
                return invalid(format!("{} {} is not a power of two", name, size));
            }
        }

        if self.batch_size == 0 {
            return invalid("batch_size must be non-zero".into());
        }
        if self.copy && self.zero_copy {
            return invalid("copy and zero_copy are mutually exclusive".into());
        }

        Ok(())
    }

    fn bind_flags(&self) -> u16 {
        let mut flags = 0;

        if self.need_wakeup {
            flags |= XDP_USE_NEED_WAKEUP;
        }
        if self.zero_copy {
            flags |= XDP_ZEROCOPY;
        }
        if self.copy {
            flags |= XDP_COPY;
        }

        flags
    }
}

/// Outcome of [`Socket::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The receive ring holds at least one descriptor.
    Ready,
    Timeout,
}

/// Userspace counters, kept per socket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketStats {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub filled: u64,
    pub reclaimed: u64,
    pub rx_wakeups: u64,
    pub tx_wakeups: u64,
    /// Wakeups that failed after frames were already queued
    pub wakeup_errors: u64,
    pub invalid_descs: u64,
}

/// An owned AF_XDP socket file descriptor, closed on drop.
#[derive(Debug)]
pub struct SocketFd(RawFd);

impl SocketFd {
    fn new() -> io::Result<SocketFd> {
        let fd = unsafe { libc::socket(AF_XDP, SOCK_RAW, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(SocketFd(fd))
    }
}

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        let r = unsafe { libc::close(self.0) };
        if r != 0 {
            warn!("close of socket fd {} failed errno: {}", self.0, errno().0);
        }
    }
}

/// Receive ring of a socket
#[derive(Debug)]
pub(crate) struct SocketRx {
    rx: RingCons<XdpDesc>,
}

/// Transmit ring of a socket
#[derive(Debug)]
pub(crate) struct SocketTx {
    tx: RingProd<XdpDesc>,
}

impl SocketRx {
    pub(crate) fn new(rx: RingCons<XdpDesc>) -> SocketRx {
        SocketRx { rx }
    }

    /// Append up to `batch_size` received descriptors to `descs`.
    #[inline]
    fn try_recv(&mut self, descs: &mut Vec<XdpDesc>, batch_size: usize) -> usize {
        let mut idx: u32 = 0;
        let batch_size = min(batch_size, u32::MAX as usize) as u32;

        let rcvd = self.rx.peek(batch_size, &mut idx);
        if rcvd == 0 {
            // Note that the caller needs to check if the queue needs to be woken up
            return 0;
        }

        for i in 0..rcvd {
            descs.push(self.rx.get(idx.wrapping_add(i)));
        }

        self.rx.release(rcvd);

        rcvd as usize
    }

    fn available(&mut self) -> u32 {
        self.rx.available(1)
    }
}

impl SocketTx {
    pub(crate) fn new(tx: RingProd<XdpDesc>) -> SocketTx {
        SocketTx { tx }
    }

    fn free(&mut self, wanted: usize) -> usize {
        let wanted = min(wanted, u32::MAX as usize) as u32;

        self.tx.free(wanted) as usize
    }

    /// Submit all of `descs`, or nothing if the ring lacks room for all of them.
    #[inline]
    fn try_send(&mut self, descs: &[XdpDesc]) -> usize {
        let mut idx: u32 = 0;
        let batch_size = min(descs.len(), u32::MAX as usize) as u32;

        let ready = self.tx.reserve(batch_size, &mut idx);
        if ready == 0 {
            return 0;
        }

        for (i, desc) in descs.iter().enumerate() {
            self.tx.set(idx.wrapping_add(i as u32), *desc);
        }

        self.tx.submit(ready);

        ready as usize
    }

    #[inline]
    fn needs_wakeup(&self) -> bool {
        self.tx.needs_wakeup()
    }
}

#[derive(Debug)]
enum Link {
    Xdp {
        if_name: String,
        queue: u32,
        fd: SocketFd,
    },
    Loopback(Arc<LoopbackLink>),
}

/// An AF_XDP socket together with its Umem, its four rings and the ownership state of every
/// frame.
///
/// Frames move between the application and the device only through the methods below, which
/// refuse any transition the ownership protocol does not allow.
#[derive(Debug)]
pub struct Socket {
    #[cfg(feature = "libbpf")]
    registration: Option<crate::program::Registration>,
    rx: SocketRx,
    tx: SocketTx,
    fq: UmemFillQueue,
    cq: UmemCompletionQueue,
    umem: Umem,
    pool: BufPoolVec,
    config: SocketConfig,
    stats: SocketStats,
    scratch: Vec<u64>,
    link: Link,
}

impl Socket {
    /// Create a socket bound to queue `queue` of the interface `if_name`.
    pub fn open(if_name: &str, queue: u32, config: &SocketConfig) -> Result<Socket, SocketError> {
        config.validate()?;

        let ifindex = match if_index(if_name) {
            Some(idx) => idx,
            None => return Err(SocketError::NoSuchInterface(if_name.to_string())),
        };

        let area = MmapArea::new(
            config.frame_num,
            config.frame_size,
            MmapAreaOptions {
                huge_tlb: config.huge_tlb,
            },
        )?;

        let fd = SocketFd::new().map_err(|source| SocketError::Resource {
            what: "AF_XDP socket",
            source,
        })?;
        let raw = fd.as_raw_fd();

        let umem = Umem::register(
            raw,
            area,
            config.frame_headroom,
            config.fill_size,
            config.comp_size,
        )?;

        setsockopt(raw, SOL_XDP, XDP_RX_RING, &config.rx_size).map_err(|source| {
            SocketError::Resource {
                what: "sizing the rx ring",
                source,
            }
        })?;
        setsockopt(raw, SOL_XDP, XDP_TX_RING, &config.tx_size).map_err(|source| {
            SocketError::Resource {
                what: "sizing the tx ring",
                source,
            }
        })?;

        let off: XdpMmapOffsets =
            getsockopt(raw, SOL_XDP, XDP_MMAP_OFFSETS).map_err(|source| SocketError::Resource {
                what: "reading ring offsets",
                source,
            })?;

        // The ring sizes above were accepted by the kernel for this fd
        let (fq, cq, rx, tx) = unsafe {
            let fq = UmemFillQueue::map(raw, &off.fr, config.fill_size)?;
            let cq = UmemCompletionQueue::map(raw, &off.cr, config.comp_size)?;
            let rx = RingCons::from_socket(raw, XDP_PGOFF_RX_RING, &off.rx, config.rx_size)
                .map_err(|source| SocketError::Ring { ring: "rx", source })?;
            let tx = RingProd::from_socket(raw, XDP_PGOFF_TX_RING, &off.tx, config.tx_size)
                .map_err(|source| SocketError::Ring { ring: "tx", source })?;
            (fq, cq, rx, tx)
        };

        let sxdp = SockaddrXdp {
            sxdp_family: AF_XDP as u16,
            sxdp_flags: config.bind_flags(),
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue,
            sxdp_shared_umem_fd: 0,
        };
        let r = unsafe {
            libc::bind(
                raw,
                &sxdp as *const SockaddrXdp as *const libc::sockaddr,
                std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if r != 0 {
            return Err(SocketError::DeviceBind {
                if_name: if_name.to_string(),
                queue,
                source: io::Error::last_os_error(),
            });
        }

        info!(
            "bound {} queue {} (ifindex {}) flags={:#x} rx={} tx={}",
            if_name,
            queue,
            ifindex,
            sxdp.sxdp_flags,
            config.rx_size,
            config.tx_size
        );

        Ok(Socket::from_parts(
            umem,
            fq,
            cq,
            SocketRx::new(rx),
            SocketTx::new(tx),
            *config,
            Link::Xdp {
                if_name: if_name.to_string(),
                queue,
                fd,
            },
        ))
    }

    pub(crate) fn loopback(
        umem: Umem,
        fq: UmemFillQueue,
        cq: UmemCompletionQueue,
        rx: SocketRx,
        tx: SocketTx,
        config: SocketConfig,
        link: Arc<LoopbackLink>,
    ) -> Socket {
        Socket::from_parts(umem, fq, cq, rx, tx, config, Link::Loopback(link))
    }

    fn from_parts(
        umem: Umem,
        fq: UmemFillQueue,
        cq: UmemCompletionQueue,
        rx: SocketRx,
        tx: SocketTx,
        config: SocketConfig,
        link: Link,
    ) -> Socket {
        let area = umem.area();
        let pool = BufPoolVec::new(area.frame_num(), area.frame_size());
        let scratch = Vec::with_capacity(area.frame_num());

        Socket {
            #[cfg(feature = "libbpf")]
            registration: None,
            rx,
            tx,
            fq,
            cq,
            umem,
            pool,
            config,
            stats: SocketStats::default(),
            scratch,
            link,
        }
    }

    /// The socket fd, or None on an in-process link.
    pub fn fd(&self) -> Option<RawFd> {
        match &self.link {
            Link::Xdp { fd, .. } => Some(fd.as_raw_fd()),
            Link::Loopback(_) => None,
        }
    }

    /// Queue index the socket is bound to, or None on an in-process link.
    pub fn queue(&self) -> Option<u32> {
        match &self.link {
            Link::Xdp { queue, .. } => Some(*queue),
            Link::Loopback(_) => None,
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    pub fn frame_size(&self) -> usize {
        self.umem.area().frame_size()
    }

    /// Number of frames in each ownership state.
    pub fn frame_counts(&self) -> FrameCounts {
        self.pool.counts()
    }

    #[cfg(feature = "libbpf")]
    pub(crate) fn set_registration(&mut self, registration: crate::program::Registration) {
        self.registration = Some(registration);
    }

    /// Push free frames into the fill ring, as many as it has room for. Returns 0 when the ring
    /// is full or no frame is free.
    pub fn fill_reserve(&mut self) -> usize {
        let free = self.pool.len();
        let want = min(self.fq.free(free), free);
        if want == 0 {
            return 0;
        }

        self.scratch.clear();
        self.pool.get(&mut self.scratch, want);
        for addr in &self.scratch {
            self.pool.mark(*addr, FrameState::Owned, FrameState::Fill);
        }

        let filled = self.fq.fill(&mut self.scratch, want);

        // Room was checked above, this only runs if the device raced us
        for addr in self.scratch.drain(..) {
            self.pool.put_buf(addr);
        }

        self.stats.filled += filled as u64;
        filled
    }

    /// Notify the device if the fill ring or the transmit ring asks for it. Returns the number
    /// of notifications issued, 0 when no flag was set.
    pub fn wake_if_needed(&mut self) -> Result<usize, SocketError> {
        let mut kicks = 0;

        if self.fq.needs_wakeup() {
            self.kick_rx()?;
            kicks += 1;
        }
        if self.tx.needs_wakeup() {
            self.kick_tx()?;
            kicks += 1;
        }

        Ok(kicks)
    }

    /// Take up to `max` received descriptors, appending them to `descs`. Returns how many were
    /// appended. Every returned frame is held by the application until [`Socket::recycle`] or
    /// [`Socket::claim`].
    pub fn read(&mut self, descs: &mut Vec<XdpDesc>, max: usize) -> usize {
        let start = descs.len();
        if self.rx.try_recv(descs, max) == 0 {
            return 0;
        }

        let area = self.umem.area();
        let mut kept = start;
        for i in start..descs.len() {
            let desc = descs[i];
            let base = area.frame_base(desc.addr);

            if !self.pool.mark(base, FrameState::Fill, FrameState::Received) {
                warn!(
                    "rx descriptor addr={} len={} for a frame not in the fill ring",
                    desc.addr, desc.len
                );
                self.stats.invalid_descs += 1;
                continue;
            }
            if area.range(desc.addr, desc.len as usize).is_none() {
                warn!(
                    "rx descriptor addr={} len={} exceeds its frame",
                    desc.addr, desc.len
                );
                self.pool.put_buf(base);
                self.stats.invalid_descs += 1;
                continue;
            }

            descs[kept] = desc;
            kept += 1;
        }
        descs.truncate(kept);

        let rcvd = kept - start;
        self.stats.rx_frames += rcvd as u64;
        rcvd
    }

    /// Bytes of a received frame, or None if `desc` is not a frame returned by [`Socket::read`].
    pub fn packet(&self, desc: &XdpDesc) -> Option<&[u8]> {
        let area = self.umem.area();
        if self.pool.state(area.frame_base(desc.addr)) != Some(FrameState::Received) {
            return None;
        }

        let range = area.range(desc.addr, desc.len as usize)?;

        // The frame was received and not yet recycled, the device no longer touches it
        Some(unsafe { area.slice(range) })
    }

    /// Give a received frame back to the free pool.
    pub fn recycle(&mut self, addr: u64) -> Result<(), SocketError> {
        self.release(addr, FrameState::Received)
    }

    /// Keep a received frame to reuse it, e.g. to send a reply built in place.
    pub fn claim(&mut self, addr: u64) -> Result<(), SocketError> {
        let base = self.umem.area().frame_base(addr);
        if !self.pool.mark(base, FrameState::Received, FrameState::Owned) {
            return Err(self.invalid(addr, 0));
        }

        Ok(())
    }

    /// Take a free frame for the application to fill in. Returns its offset, or None if every
    /// frame is in use.
    pub fn alloc_frame(&mut self) -> Option<u64> {
        self.scratch.clear();
        if self.pool.get(&mut self.scratch, 1) == 0 {
            return None;
        }

        self.scratch.pop()
    }

    /// Give a frame from [`Socket::alloc_frame`] or [`Socket::claim`] back unused.
    pub fn release_frame(&mut self, addr: u64) -> Result<(), SocketError> {
        self.release(addr, FrameState::Owned)
    }

    fn release(&mut self, addr: u64, expected: FrameState) -> Result<(), SocketError> {
        let base = self.umem.area().frame_base(addr);
        if self.pool.state(base) != Some(expected) {
            return Err(self.invalid(addr, 0));
        }

        self.pool.put_buf(base);
        Ok(())
    }

    /// Writable bytes of an application owned frame, from `addr` to the end of its frame.
    pub fn frame_mut(&mut self, addr: u64) -> Option<&mut [u8]> {
        let area = self.umem.area();
        let base = area.frame_base(addr);
        if self.pool.state(base) != Some(FrameState::Owned) {
            return None;
        }

        let len = (base + area.frame_size() as u64 - addr) as usize;
        let range = area.range(addr, len)?;

        // Owned frames are touched by nobody but the application, and &mut self keeps the
        // slice unique
        Some(unsafe { area.slice_mut(range) })
    }

    /// Queue descriptors for transmit. Returns how many were queued, which may be fewer than
    /// `descs.len()` when the transmit ring is short of room; the caller retries the rest.
    /// Fails without queueing anything if a descriptor in the queued prefix does not refer to
    /// an application owned frame.
    ///
    /// A failed wakeup does not fail the call, since the frames are queued by then. It is
    /// logged and counted in [`SocketStats::wakeup_errors`]; the next wakeup retries.
    pub fn write(&mut self, descs: &[XdpDesc]) -> Result<usize, SocketError> {
        let n = min(self.tx.free(descs.len()), descs.len());
        if n == 0 {
            return Ok(0);
        }
        let batch = &descs[..n];

        let area = self.umem.area();
        for (i, desc) in batch.iter().enumerate() {
            let ok = desc.len > 0
                && area.range(desc.addr, desc.len as usize).is_some()
                && self.pool.mark(
                    area.frame_base(desc.addr),
                    FrameState::Owned,
                    FrameState::Transmit,
                );

            if !ok {
                for prev in &batch[..i] {
                    self.pool.mark(
                        area.frame_base(prev.addr),
                        FrameState::Transmit,
                        FrameState::Owned,
                    );
                }
                return Err(self.invalid(desc.addr, desc.len));
            }
        }

        let sent = self.tx.try_send(batch);
        for desc in &batch[sent..] {
            self.pool.mark(
                area.frame_base(desc.addr),
                FrameState::Transmit,
                FrameState::Owned,
            );
        }
        self.stats.tx_frames += sent as u64;

        if self.tx.needs_wakeup() || !self.config.need_wakeup {
            if let Err(err) = self.kick_tx() {
                warn!("{} frames queued but {}", sent, err);
                self.stats.wakeup_errors += 1;
            }
        }

        Ok(sent)
    }

    /// Drain the completion ring, returning the transmitted frames to the free pool. Returns how
    /// many frames were reclaimed.
    pub fn reclaim(&mut self) -> usize {
        self.scratch.clear();
        let capacity = self.cq.capacity() as usize;
        if self.cq.service(&mut self.scratch, capacity) == 0 {
            return 0;
        }

        let area = self.umem.area();
        let mut reclaimed = 0;
        for addr in self.scratch.drain(..) {
            let base = area.frame_base(addr);
            if self.pool.state(base) == Some(FrameState::Transmit) {
                self.pool.put_buf(base);
                reclaimed += 1;
            } else {
                warn!("completion for frame {} that was not transmitted", addr);
                self.stats.invalid_descs += 1;
            }
        }

        self.stats.reclaimed += reclaimed as u64;
        reclaimed
    }

    /// Wait up to `timeout` for the receive ring to hold a descriptor.
    pub fn poll(&mut self, timeout: Duration) -> Result<Readiness, SocketError> {
        if self.rx.available() > 0 {
            return Ok(Readiness::Ready);
        }

        match &self.link {
            Link::Xdp { fd, .. } => {
                let mut fds = [pollfd {
                    fd: fd.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                }];
                let ms = min(timeout.as_millis(), i32::MAX as u128) as i32;

                let ret = unsafe { poll(fds.as_mut_ptr(), 1, ms) };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(EINTR) {
                        return Ok(Readiness::Timeout);
                    }
                    return Err(SocketError::Poll(err));
                }
                if ret == 0 {
                    return Ok(Readiness::Timeout);
                }
                if fds[0].revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
                    return Err(SocketError::Closed);
                }

                Ok(Readiness::Ready)
            }
            Link::Loopback(link) => {
                let deadline = Instant::now() + timeout;
                let link = link.clone();
                loop {
                    if self.rx.available() > 0 {
                        return Ok(Readiness::Ready);
                    }
                    if link.is_closed() {
                        return Err(SocketError::Closed);
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Readiness::Timeout);
                    }
                    std::thread::sleep(min(deadline - now, Duration::from_millis(1)));
                }
            }
        }
    }

    /// Drop and error counters kept by the kernel. None on an in-process link.
    pub fn kernel_stats(&self) -> Result<Option<XdpStatistics>, SocketError> {
        match &self.link {
            Link::Xdp { fd, .. } => {
                let stats = getsockopt(fd.as_raw_fd(), SOL_XDP, XDP_STATISTICS).map_err(
                    |source| SocketError::Resource {
                        what: "reading XDP statistics",
                        source,
                    },
                )?;
                Ok(Some(stats))
            }
            Link::Loopback(_) => Ok(None),
        }
    }

    /// Unbind the socket and release its rings and frame area.
    pub fn close(self) {
        match &self.link {
            Link::Xdp { if_name, queue, .. } => info!("closing {} queue {}", if_name, queue),
            Link::Loopback(_) => debug!("closing loopback socket"),
        }
    }

    fn invalid(&mut self, addr: u64, len: u32) -> SocketError {
        self.stats.invalid_descs += 1;
        SocketError::InvalidDescriptor { addr, len }
    }

    fn kick_rx(&mut self) -> Result<(), SocketError> {
        self.stats.rx_wakeups += 1;

        match &self.link {
            Link::Xdp { fd, .. } => {
                let ret = unsafe {
                    recvfrom(
                        fd.as_raw_fd(),
                        std::ptr::null_mut(),
                        0,
                        MSG_DONTWAIT,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                    )
                };
                if ret < 0 {
                    return check_wakeup_errno(errno().0);
                }
            }
            Link::Loopback(link) => {
                if let Some(errno) = link.kick_rx() {
                    return check_wakeup_errno(errno);
                }
            }
        }

        debug!("rx wakeup");
        Ok(())
    }

    fn kick_tx(&mut self) -> Result<(), SocketError> {
        self.stats.tx_wakeups += 1;

        match &self.link {
            Link::Xdp { fd, .. } => {
                let ret = unsafe {
                    sendto(
                        fd.as_raw_fd(),
                        std::ptr::null(),
                        0,
                        MSG_DONTWAIT,
                        std::ptr::null(),
                        0,
                    )
                };
                if ret < 0 {
                    return check_wakeup_errno(errno().0);
                }
            }
            Link::Loopback(link) => {
                if let Some(errno) = link.kick_tx() {
                    return check_wakeup_errno(errno);
                }
            }
        }

        debug!("tx wakeup");
        Ok(())
    }
}

fn check_wakeup_errno(errno: i32) -> Result<(), SocketError> {
    match errno {
        // The device is busy or the link is down, the next wakeup retries
        ENOBUFS | EAGAIN | EBUSY | ENETDOWN => Ok(()),
        _ => Err(SocketError::Wakeup(io::Error::from_raw_os_error(errno))),
    }
}
