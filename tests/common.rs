//
// Test infrastructure which wires two loopback links back to back, like the two ends of a veth.
// It then passes traffic between them as defined by the passed in test instance.
//
#![allow(dead_code)]

use std::cmp::min;
use std::fmt::Display;
use std::time;

use arraydeque::{ArrayDeque, Wrapping};
use rand::seq::SliceRandom;

use afxdp_ping::loopback::{pair, Delivery, Driver};
use afxdp_ping::proto::echo_reply_in_place;
use afxdp_ping::socket::{Socket, SocketConfig};
use afxdp_ping::xdp::XdpDesc;

pub const PENDING_LEN: usize = 1024;

pub const RING_SIZE: u32 = 512;
pub const FRAME_SIZE: usize = 2048;
pub const FRAME_NUM: usize = 2048;
pub const BATCH_SIZE: usize = 64;

pub fn config() -> SocketConfig {
    SocketConfig {
        frame_size: FRAME_SIZE,
        frame_num: FRAME_NUM,
        fill_size: RING_SIZE,
        comp_size: RING_SIZE,
        rx_size: RING_SIZE,
        tx_size: RING_SIZE,
        batch_size: BATCH_SIZE,
        ..Default::default()
    }
}

/// One end of the wire: a socket and the driver playing its device.
pub struct Port {
    pub socket: Socket,
    pub driver: Driver,
}

impl Port {
    pub fn new(config: &SocketConfig) -> Port {
        let r = pair(config);
        match r {
            Ok((socket, driver)) => Port { socket, driver },
            Err(err) => panic!("Failed to create loopback link: {:?}", err),
        }
    }

    /// A port with all frames it can take offered on the fill ring.
    pub fn filled(config: &SocketConfig) -> Port {
        let mut port = Port::new(config);
        port.socket.fill_reserve();
        port
    }
}

/// Order in which the wire posts transmit completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completions {
    InOrder,
    Reversed,
    Shuffled,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WireStats {
    pub carried: usize,
    pub passed: usize,
    pub dropped: usize,
}

/// Copies frames transmitted on one port into the receive side of the other.
pub struct Wire {
    completions: Completions,
    unposted: [Vec<u64>; 2],
    pub stats: [WireStats; 2],
}

impl Wire {
    pub fn new(completions: Completions) -> Wire {
        Wire {
            completions,
            unposted: [Vec::new(), Vec::new()],
            stats: Default::default(),
        }
    }

    /// Move everything queued for transmit on `from` to `to`. `dir` (0 or 1) selects the
    /// counters. Returns the number of frames taken off the transmit ring.
    pub fn carry(&mut self, from: &mut Port, to: &mut Port, dir: usize) -> usize {
        let descs = from.driver.take_tx(usize::MAX);

        for desc in &descs {
            let frame = match from.driver.tx_frame(desc) {
                Some(frame) => frame,
                None => panic!("tx descriptor {:?} outside the frame area", desc),
            };
            match to.driver.deliver(&frame) {
                Delivery::Redirected(_) => self.stats[dir].carried += 1,
                Delivery::Passed(_) => self.stats[dir].passed += 1,
                _ => self.stats[dir].dropped += 1,
            }
        }

        let unposted = &mut self.unposted[dir];
        unposted.extend(descs.iter().map(|d| d.addr));
        match self.completions {
            Completions::InOrder => {}
            Completions::Reversed => unposted.reverse(),
            Completions::Shuffled => unposted.shuffle(&mut rand::thread_rng()),
        }

        // Post what fits; the rest waits until the socket has reclaimed more of the ring
        let mut chunk = unposted.len();
        while chunk > 0 && !unposted.is_empty() {
            let n = min(chunk, unposted.len());
            if from.driver.complete(&unposted[..n]) > 0 {
                unposted.drain(..n);
            } else {
                chunk /= 2;
            }
        }

        descs.len()
    }

    /// Completions not yet posted to the sending port.
    pub fn unposted(&self, dir: usize) -> usize {
        self.unposted[dir].len()
    }
}

/// Answer every echo request received on `port` with a reply built in the same frame. Frames
/// that are not echo requests are recycled. Returns the number of replies queued.
pub fn respond(port: &mut Port) -> usize {
    let socket = &mut port.socket;
    socket.reclaim();

    let mut descs = Vec::new();
    socket.read(&mut descs, BATCH_SIZE);

    let mut replies = Vec::new();
    for desc in descs {
        socket.claim(desc.addr).unwrap();

        let frame = socket.frame_mut(desc.addr).unwrap();
        let r = echo_reply_in_place(&mut frame[..desc.len as usize]);
        match r {
            Ok(len) => replies.push(XdpDesc::new(desc.addr, len as u32)),
            Err(_) => socket.release_frame(desc.addr).unwrap(),
        }
    }

    let sent = socket.write(&replies).unwrap();
    for desc in &replies[sent..] {
        socket.release_frame(desc.addr).unwrap();
    }

    socket.fill_reserve();
    sent
}

pub trait TrafficTest {
    fn done(&mut self, now: time::Instant) -> bool;

    /// Queue frames to send on `port`, taking them from `socket.alloc_frame()`.
    fn transmit(
        &mut self,
        now: time::Instant,
        port: usize,
        socket: &mut Socket,
        pending: &mut ArrayDeque<XdpDesc, PENDING_LEN, Wrapping>,
    ) -> usize;

    /// Inspect frames received on `port`. The harness recycles them afterwards.
    fn receive(&mut self, now: time::Instant, port: usize, socket: &Socket, descs: &[XdpDesc])
        -> usize;

    fn finalize(&self);
}

#[derive(Default, Debug, Clone, Copy)]
pub struct Stats {
    pub rx_packets: usize,
    pub tx_packets: usize,
    pub reclaimed: usize,
    pub filled: usize,
}

fn do_port<T>(
    test: &mut T,
    now: time::Instant,
    index: usize,
    port: &mut Port,
    pending: &mut ArrayDeque<XdpDesc, PENDING_LEN, Wrapping>,
    rx: &mut Vec<XdpDesc>,
    stats: &mut Stats,
) where
    T: TrafficTest,
{
    let socket = &mut port.socket;

    //
    // Service completion queue
    //
    stats.reclaimed += socket.reclaim();

    //
    // Receive
    //
    rx.clear();
    let n = socket.read(rx, BATCH_SIZE);
    if n > 0 {
        stats.rx_packets += n;
        test.receive(now, index, socket, rx);
        for desc in rx.iter() {
            socket.recycle(desc.addr).unwrap();
        }
    }

    //
    // Fill buffers before new frames are taken for transmit
    //
    stats.filled += socket.fill_reserve();

    //
    // Ask the test for packets and send them
    //
    test.transmit(now, index, socket, pending);

    let batch: Vec<XdpDesc> = pending.iter().take(BATCH_SIZE).copied().collect();
    let r = socket.write(&batch);
    match r {
        Ok(n) => {
            for _ in 0..n {
                pending.pop_front();
            }
            stats.tx_packets += n;
        }
        Err(err) => panic!("error: {:?}", err),
    }
}

/// Run `test` over two connected ports until it reports done, then let the wire drain.
pub fn run<T>(mut test: T, completions: Completions) -> (T, [Stats; 2], Wire)
where
    T: TrafficTest + Display,
{
    let config = config();
    let mut ports = [Port::filled(&config), Port::filled(&config)];
    let mut pending = [ArrayDeque::new(), ArrayDeque::new()];
    let mut rx = Vec::with_capacity(BATCH_SIZE);
    let mut stats = [Stats::default(); 2];
    let mut wire = Wire::new(completions);

    loop {
        let now = time::Instant::now();
        if test.done(now) {
            break;
        }

        for i in 0..2 {
            do_port(
                &mut test,
                now,
                i,
                &mut ports[i],
                &mut pending[i],
                &mut rx,
                &mut stats[i],
            );
        }

        let (a, b) = ports.split_at_mut(1);
        wire.carry(&mut a[0], &mut b[0], 0);
        wire.carry(&mut b[0], &mut a[0], 1);
    }

    println!("{}", test);
    for (i, port) in ports.iter().enumerate() {
        let counts = port.socket.frame_counts();
        println!("port{} frames: {:?} stats: {:?}", i, counts, stats[i]);
        assert_eq!(counts.total(), FRAME_NUM);
    }

    test.finalize();

    (test, stats, wire)
}
