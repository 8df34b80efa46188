//
// Frame accounting across the socket and a loopback driver: every frame is in exactly one place
// whatever order the device hands frames back in.
//
use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use afxdp_ping::loopback::{pair, Delivery};
use afxdp_ping::socket::{Readiness, SocketConfig, SocketError};
use afxdp_ping::xdp::XdpDesc;

fn small_config() -> SocketConfig {
    SocketConfig {
        frame_size: 2048,
        frame_num: 64,
        fill_size: 16,
        comp_size: 16,
        rx_size: 16,
        tx_size: 16,
        batch_size: 8,
        ..Default::default()
    }
}

#[test]
fn completions_out_of_order() {
    let (mut socket, mut driver) = pair(&small_config()).unwrap();

    let a = socket.alloc_frame().unwrap();
    let b = socket.alloc_frame().unwrap();
    let c = socket.alloc_frame().unwrap();
    assert_eq!(socket.frame_counts().owned, 3);

    let descs = [XdpDesc::new(a, 60), XdpDesc::new(b, 60), XdpDesc::new(c, 60)];
    assert_eq!(socket.write(&descs).unwrap(), 3);
    assert_eq!(socket.frame_counts().transmit, 3);

    let taken = driver.take_tx(16);
    assert_eq!(taken, descs.to_vec());
    assert_eq!(driver.complete(&[c, a, b]), 3);

    assert_eq!(socket.reclaim(), 3);
    let counts = socket.frame_counts();
    assert_eq!(counts.transmit, 0);
    assert_eq!(counts.free, 64);
    for addr in [a, b, c].iter() {
        assert_eq!(socket.frame_counts().total(), 64);
        assert!(socket.frame_mut(*addr).is_none());
    }

    // All three can be handed out again, once each
    let mut again = HashSet::new();
    while let Some(addr) = socket.alloc_frame() {
        assert!(again.insert(addr));
    }
    assert_eq!(again.len(), 64);
    assert!(again.contains(&a) && again.contains(&b) && again.contains(&c));
}

#[test]
fn stray_completion_is_ignored() {
    let (mut socket, mut driver) = pair(&small_config()).unwrap();

    let addr = socket.alloc_frame().unwrap();
    assert_eq!(driver.complete(&[addr]), 1);

    assert_eq!(socket.reclaim(), 0);
    assert_eq!(socket.stats().invalid_descs, 1);
    assert!(socket.frame_mut(addr).is_some());
}

#[test]
fn invalid_descriptors_are_rejected() {
    let config = small_config();
    let (mut socket, mut driver) = pair(&config).unwrap();

    let owned = socket.alloc_frame().unwrap();
    let free = owned + config.frame_size as u64;
    assert!(socket.frame_mut(free).is_none());

    let bad = [
        // Not handed out
        XdpDesc::new(free, 60),
        // Empty
        XdpDesc::new(owned, 0),
        // Runs past the end of its frame
        XdpDesc::new(owned + 100, 2000),
        // Outside the area
        XdpDesc::new(64 * 2048, 60),
    ];
    for desc in bad.iter() {
        match socket.write(&[*desc]) {
            Err(SocketError::InvalidDescriptor { addr, .. }) => assert_eq!(addr, desc.addr),
            other => panic!("{:?} accepted: {:?}", desc, other),
        }
    }

    // A bad descriptor later in the batch leaves the earlier ones with the application
    match socket.write(&[XdpDesc::new(owned, 60), XdpDesc::new(free, 60)]) {
        Err(SocketError::InvalidDescriptor { addr, .. }) => assert_eq!(addr, free),
        other => panic!("{:?}", other),
    }
    assert!(driver.take_tx(16).is_empty());
    assert_eq!(socket.frame_counts().owned, 1);
    assert_eq!(socket.frame_counts().transmit, 0);

    // Double release and recycling a frame that was not received fail
    assert!(socket.recycle(owned).is_err());
    socket.release_frame(owned).unwrap();
    assert!(socket.release_frame(owned).is_err());
    assert!(socket.claim(owned).is_err());

    assert_eq!(socket.stats().invalid_descs, 8);
}

#[test]
fn transmit_kicks_without_need_wakeup() {
    let config = SocketConfig {
        need_wakeup: false,
        ..small_config()
    };
    let (mut socket, driver) = pair(&config).unwrap();

    for i in 1..=3 {
        let addr = socket.alloc_frame().unwrap();
        socket.write(&[XdpDesc::new(addr, 60)]).unwrap();
        assert_eq!(driver.tx_wakeups(), i);
    }
    assert_eq!(socket.wake_if_needed().unwrap(), 0);
}

#[test]
fn wake_only_when_flagged() {
    let (mut socket, driver) = pair(&small_config()).unwrap();

    assert_eq!(socket.wake_if_needed().unwrap(), 0);
    assert_eq!(driver.rx_wakeups() + driver.tx_wakeups(), 0);

    driver.set_fill_needs_wakeup(true);
    assert_eq!(socket.wake_if_needed().unwrap(), 1);
    assert_eq!(driver.rx_wakeups(), 1);
    assert_eq!(driver.tx_wakeups(), 0);

    driver.set_fill_needs_wakeup(false);
    driver.set_tx_needs_wakeup(true);
    assert_eq!(socket.wake_if_needed().unwrap(), 1);
    assert_eq!(driver.tx_wakeups(), 1);

    driver.set_fill_needs_wakeup(true);
    assert_eq!(socket.wake_if_needed().unwrap(), 2);
    assert_eq!(socket.stats().rx_wakeups, 2);
    assert_eq!(socket.stats().tx_wakeups, 2);
}

#[test]
fn failed_wakeup_still_reports_queued_frames() {
    let config = SocketConfig {
        need_wakeup: false,
        ..small_config()
    };
    let (mut socket, mut driver) = pair(&config).unwrap();
    driver.set_wakeup_error(Some(libc::EIO));

    let addr = socket.alloc_frame().unwrap();
    assert_eq!(socket.write(&[XdpDesc::new(addr, 60)]).unwrap(), 1);
    assert_eq!(socket.stats().wakeup_errors, 1);
    assert_eq!(socket.stats().tx_frames, 1);
    assert_eq!(socket.frame_counts().transmit, 1);
    assert_eq!(socket.frame_counts().owned, 0);

    // The frame went out and comes back through the completion ring
    assert_eq!(driver.take_tx(16), vec![XdpDesc::new(addr, 60)]);
    assert_eq!(driver.complete(&[addr]), 1);
    assert_eq!(socket.reclaim(), 1);
    assert_eq!(socket.stats().invalid_descs, 0);

    // Explicit wakeups still report the failure
    driver.set_tx_needs_wakeup(true);
    match socket.wake_if_needed() {
        Err(SocketError::Wakeup(_)) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn transient_wakeup_errors_are_ignored() {
    let (mut socket, driver) = pair(&small_config()).unwrap();

    for errno in [libc::EAGAIN, libc::EBUSY, libc::ENOBUFS, libc::ENETDOWN].iter() {
        driver.set_wakeup_error(Some(*errno));
        driver.set_tx_needs_wakeup(true);
        let addr = socket.alloc_frame().unwrap();
        assert_eq!(socket.write(&[XdpDesc::new(addr, 60)]).unwrap(), 1);
        assert_eq!(socket.wake_if_needed().unwrap(), 1);
    }
    assert_eq!(socket.stats().wakeup_errors, 0);
}

#[test]
fn poll_times_out_on_an_empty_ring() {
    let (mut socket, _driver) = pair(&small_config()).unwrap();
    let timeout = Duration::from_millis(20);

    let start = Instant::now();
    assert_eq!(socket.poll(timeout).unwrap(), Readiness::Timeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
}

#[test]
fn poll_is_ready_once_a_frame_arrives() {
    let (mut socket, mut driver) = pair(&small_config()).unwrap();
    socket.fill_reserve();

    assert!(matches!(driver.deliver(&[0u8; 64]), Delivery::Redirected(_)));
    let start = Instant::now();
    assert_eq!(
        socket.poll(Duration::from_secs(5)).unwrap(),
        Readiness::Ready
    );
    assert!(start.elapsed() < Duration::from_secs(1));

    // Still ready until the frame is read
    assert_eq!(socket.poll(Duration::ZERO).unwrap(), Readiness::Ready);
    let mut descs = Vec::new();
    assert_eq!(socket.read(&mut descs, 8), 1);
    socket.recycle(descs[0].addr).unwrap();
    assert_eq!(socket.poll(Duration::ZERO).unwrap(), Readiness::Timeout);
}

// Drive the socket and driver through a random mix of operations, checking after each step that
// the frames in each state add up to what each side holds.
#[test]
fn frame_conservation() {
    let config = small_config();
    let frame_num = config.frame_num;
    let (mut socket, mut driver) = pair(&config).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // Frames the test holds, by the state it expects them in
    let mut received: Vec<u64> = Vec::new();
    let mut owned: Vec<u64> = Vec::new();
    // Frames the driver holds between take_tx and complete
    let mut in_device: Vec<u64> = Vec::new();
    let mut rx_queued = 0u32;
    let mut comp_queued = 0usize;

    let mut descs = Vec::new();
    for step in 0..20_000 {
        match rng.gen_range(0..8) {
            0 => {
                socket.fill_reserve();
            }
            1 => {
                let len = rng.gen_range(1..1500);
                if let Delivery::Redirected(_) = driver.deliver(&vec![0xab; len]) {
                    rx_queued += 1;
                }
            }
            2 => {
                descs.clear();
                let n = socket.read(&mut descs, rng.gen_range(1..8));
                rx_queued -= n as u32;
                received.extend(descs.iter().map(|d| d.addr));
            }
            3 => {
                if !received.is_empty() {
                    let addr = received.swap_remove(rng.gen_range(0..received.len()));
                    if rng.gen_bool(0.5) {
                        socket.recycle(addr).unwrap();
                    } else {
                        socket.claim(addr).unwrap();
                        owned.push(addr);
                    }
                }
            }
            4 => {
                if let Some(addr) = socket.alloc_frame() {
                    owned.push(addr);
                }
            }
            5 => {
                let n = rng.gen_range(0..=owned.len().min(8));
                let batch: Vec<XdpDesc> = owned[..n]
                    .iter()
                    .map(|addr| XdpDesc::new(*addr, 64))
                    .collect();
                let sent = socket.write(&batch).unwrap();
                owned.drain(..sent);
            }
            6 => {
                let taken = driver.take_tx(rng.gen_range(1..8));
                in_device.extend(taken.iter().map(|d| d.addr));

                in_device.shuffle(&mut rng);
                let n = rng.gen_range(0..=in_device.len());
                if n > 0 && driver.complete(&in_device[..n]) == n {
                    in_device.drain(..n);
                    comp_queued += n;
                }
            }
            _ => {
                comp_queued -= socket.reclaim();
                if let Some(addr) = owned.pop() {
                    socket.release_frame(addr).unwrap();
                }
            }
        }

        let counts = socket.frame_counts();
        assert_eq!(counts.total(), frame_num, "step {}", step);
        assert_eq!(
            counts.fill as u32,
            driver.fill_pending() + rx_queued,
            "step {}",
            step
        );
        assert_eq!(counts.received, received.len(), "step {}", step);
        assert_eq!(counts.owned, owned.len(), "step {}", step);
        let stats = socket.stats();
        assert_eq!(
            counts.transmit as u64,
            stats.tx_frames - stats.reclaimed,
            "step {}",
            step
        );
        assert!(in_device.len() + comp_queued <= counts.transmit);
    }

    // No frame is in two places at once
    let mut seen = HashSet::new();
    for addr in received.iter().chain(owned.iter()).chain(in_device.iter()) {
        assert!(seen.insert(*addr), "frame {} held twice", addr);
    }
    for addr in received.iter() {
        assert_eq!(socket.packet(&XdpDesc::new(*addr, 1)).map(|p| p.len()), Some(1));
    }
}
