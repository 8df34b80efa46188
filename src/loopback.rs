//! An in-process link that plays the device side of all four rings.
//!
//! [`pair`] returns a [`Socket`] wired to a [`Driver`]. The socket behaves exactly as on a real
//! interface, while the driver consumes its fill and transmit rings and produces its receive
//! and completion rings under the caller's control. Inbound frames go through
//! [`crate::filter::classify`] when the driver has a rule table, standing in for the XDP
//! program that would run in the kernel.
use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::filter::{classify, PassReason, RuleTable, Verdict};
use crate::mmap_area::{MmapArea, MmapAreaOptions};
use crate::ring::{ring_pair, RingCons, RingProd};
use crate::socket::{Socket, SocketConfig, SocketError, SocketRx, SocketTx};
use crate::umem::{Umem, UmemCompletionQueue, UmemFillQueue};
use crate::xdp::XdpDesc;

/// Wakeups issued by the socket and whether the driver is still attached.
#[derive(Debug, Default)]
pub(crate) struct LoopbackLink {
    rx_kicks: AtomicU64,
    tx_kicks: AtomicU64,
    /// errno returned by wakeups, 0 for none
    kick_errno: AtomicI32,
    closed: AtomicBool,
}

impl LoopbackLink {
    /// Count an rx wakeup. Returns the errno the device fails it with, if any.
    pub(crate) fn kick_rx(&self) -> Option<i32> {
        self.rx_kicks.fetch_add(1, Ordering::Relaxed);
        self.kick_error()
    }

    pub(crate) fn kick_tx(&self) -> Option<i32> {
        self.tx_kicks.fetch_add(1, Ordering::Relaxed);
        self.kick_error()
    }

    fn kick_error(&self) -> Option<i32> {
        match self.kick_errno.load(Ordering::Relaxed) {
            0 => None,
            errno => Some(errno),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What happened to a frame handed to [`Driver::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written into the frame at this offset and posted on the receive ring.
    Redirected(u64),
    /// Left to the network stack; no frame was used.
    Passed(PassReason),
    /// The fill ring was empty.
    NoFillBuffer,
    /// The receive ring was full.
    RxRingFull,
    /// The frame does not fit in a frame after the headroom.
    TooLarge,
}

/// Counters kept by the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub redirected: u64,
    pub passed: u64,
    pub no_fill_buffer: u64,
    pub rx_ring_full: u64,
    pub too_large: u64,
    pub transmitted: u64,
    pub completed: u64,
}

/// Device side of a loopback link.
#[derive(Debug)]
pub struct Driver {
    area: Arc<MmapArea>,
    headroom: u32,
    fill: RingCons<u64>,
    comp: RingProd<u64>,
    rx: RingProd<XdpDesc>,
    tx: RingCons<XdpDesc>,
    link: Arc<LoopbackLink>,
    rules: Option<RuleTable>,
    queue: u32,
    stats: DriverStats,
}

/// Create a socket on an in-process link and the driver for its device side.
pub fn pair(config: &SocketConfig) -> Result<(Socket, Driver), SocketError> {
    config.validate()?;

    let area = MmapArea::new(
        config.frame_num,
        config.frame_size,
        MmapAreaOptions {
            huge_tlb: config.huge_tlb,
        },
    )?;

    let ring_err = |ring: &'static str| move |source| SocketError::Ring { ring, source };
    let (fq, fill) = ring_pair::<u64>(config.fill_size).map_err(ring_err("fill"))?;
    let (comp, cq) = ring_pair::<u64>(config.comp_size).map_err(ring_err("completion"))?;
    let (rx_prod, rx_cons) = ring_pair::<XdpDesc>(config.rx_size).map_err(ring_err("rx"))?;
    let (tx_prod, tx_cons) = ring_pair::<XdpDesc>(config.tx_size).map_err(ring_err("tx"))?;

    let link = Arc::new(LoopbackLink::default());

    let socket = Socket::loopback(
        Umem::local(area.clone(), config.frame_headroom),
        UmemFillQueue::new(fq),
        UmemCompletionQueue::new(cq),
        SocketRx::new(rx_cons),
        SocketTx::new(tx_prod),
        *config,
        link.clone(),
    );

    let driver = Driver {
        area,
        headroom: config.frame_headroom,
        fill,
        comp,
        rx: rx_prod,
        tx: tx_cons,
        link,
        rules: None,
        queue: 0,
        stats: DriverStats::default(),
    };

    Ok((socket, driver))
}

impl Driver {
    /// Classify inbound frames against `rules` as arriving on `queue`. Without a rule table
    /// every frame is redirected.
    pub fn set_filter(&mut self, rules: RuleTable, queue: u32) {
        self.rules = Some(rules);
        self.queue = queue;
    }

    pub fn rules_mut(&mut self) -> Option<&mut RuleTable> {
        self.rules.as_mut()
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Receive `frame` from the wire.
    pub fn deliver(&mut self, frame: &[u8]) -> Delivery {
        if let Some(rules) = &self.rules {
            if let Verdict::Pass(reason) = classify(frame, rules, self.queue) {
                debug!("loopback pass: {:?}", reason);
                self.stats.passed += 1;
                return Delivery::Passed(reason);
            }
        }

        if frame.len() + self.headroom as usize > self.area.frame_size() {
            self.stats.too_large += 1;
            return Delivery::TooLarge;
        }
        if self.rx.free(1) == 0 {
            self.stats.rx_ring_full += 1;
            return Delivery::RxRingFull;
        }

        let mut idx = 0;
        if self.fill.peek(1, &mut idx) == 0 {
            self.stats.no_fill_buffer += 1;
            return Delivery::NoFillBuffer;
        }
        let base = self.fill.get(idx);
        self.fill.release(1);

        let addr = base + self.headroom as u64;
        let range = match self.area.range(addr, frame.len()) {
            Some(range) => range,
            None => {
                // The socket only fills frame starts, so this is never hit
                self.stats.too_large += 1;
                return Delivery::TooLarge;
            }
        };

        // Frames taken off the fill ring belong to the device until posted on the rx ring
        unsafe { self.area.slice_mut(range) }.copy_from_slice(frame);

        self.rx.reserve(1, &mut idx);
        self.rx.set(idx, XdpDesc::new(addr, frame.len() as u32));
        self.rx.submit(1);

        self.stats.redirected += 1;
        Delivery::Redirected(addr)
    }

    /// Take up to `max` descriptors queued for transmit. The frames stay with the driver until
    /// [`Driver::complete`].
    pub fn take_tx(&mut self, max: usize) -> Vec<XdpDesc> {
        let mut idx = 0;
        let n = self.tx.peek(min(max, u32::MAX as usize) as u32, &mut idx);

        let descs: Vec<XdpDesc> = (0..n).map(|i| self.tx.get(idx.wrapping_add(i))).collect();
        if n > 0 {
            self.tx.release(n);
        }

        self.stats.transmitted += n as u64;
        descs
    }

    /// Bytes of a frame taken with [`Driver::take_tx`].
    pub fn tx_frame(&self, desc: &XdpDesc) -> Option<Vec<u8>> {
        let range = self.area.range(desc.addr, desc.len as usize)?;

        // The socket handed this frame over and does not write it until it is completed
        Some(unsafe { self.area.slice(range) }.to_vec())
    }

    /// Post `addrs` on the completion ring, in the order given. Returns how many were posted:
    /// all of them, or 0 if the ring lacks room.
    pub fn complete(&mut self, addrs: &[u64]) -> usize {
        let mut idx = 0;
        let n = self
            .comp
            .reserve(min(addrs.len(), u32::MAX as usize) as u32, &mut idx);
        if n == 0 {
            return 0;
        }

        for (i, addr) in addrs.iter().enumerate() {
            self.comp.set(idx.wrapping_add(i as u32), *addr);
        }
        self.comp.submit(n);

        self.stats.completed += n as u64;
        n as usize
    }

    /// Frames the socket has offered on the fill ring and the driver has not used yet.
    pub fn fill_pending(&mut self) -> u32 {
        self.fill.available(u32::MAX)
    }

    /// Ask the socket for a wakeup before more frames are received.
    pub fn set_fill_needs_wakeup(&self, needed: bool) {
        self.fill.set_needs_wakeup(needed);
    }

    /// Ask the socket for a wakeup before more frames are transmitted.
    pub fn set_tx_needs_wakeup(&self, needed: bool) {
        self.tx.set_needs_wakeup(needed);
    }

    /// Fail every following wakeup with `errno`, or accept them again with None.
    pub fn set_wakeup_error(&self, errno: Option<i32>) {
        self.link
            .kick_errno
            .store(errno.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn rx_wakeups(&self) -> u64 {
        self.link.rx_kicks.load(Ordering::Relaxed)
    }

    pub fn tx_wakeups(&self) -> u64 {
        self.link.tx_kicks.load(Ordering::Relaxed)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.link.closed.store(true, Ordering::Release);
    }
}
