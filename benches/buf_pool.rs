use afxdp_ping::buf_pool::BufPool;
use afxdp_ping::buf_pool_vec::{BufPoolVec, FrameState};
use afxdp_ping::loopback::pair;
use afxdp_ping::socket::SocketConfig;
use afxdp_ping::xdp::XdpDesc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

const FRAME_NUM: usize = 4096;
const FRAME_SIZE: usize = 2048;
const BATCH: usize = 64;

/// One transmit batch through the pool: take frames, queue them, take them back in reverse
/// completion order.
fn transmit_batch(pool: &mut BufPoolVec, bufs: &mut Vec<u64>) -> usize {
    pool.get(bufs, BATCH);
    for addr in bufs.iter() {
        pool.mark(*addr, FrameState::Owned, FrameState::Transmit);
    }

    let mut returned = 0;
    while let Some(addr) = bufs.pop() {
        returned += pool.put_buf(addr);
    }
    returned
}

fn pool(c: &mut Criterion) {
    let mut pool = BufPoolVec::new(FRAME_NUM, FRAME_SIZE);
    let mut bufs = Vec::with_capacity(BATCH);

    c.bench_function("pool_transmit_batch", |b| {
        b.iter(|| transmit_batch(&mut pool, &mut bufs))
    });
}

fn socket(c: &mut Criterion) {
    let config = SocketConfig {
        frame_size: FRAME_SIZE,
        frame_num: FRAME_NUM,
        batch_size: BATCH,
        ..Default::default()
    };
    let (mut socket, mut driver) = match pair(&config) {
        Ok(pair) => pair,
        Err(err) => panic!("{:?}", err),
    };

    c.bench_function("socket_write_reclaim", |b| {
        b.iter_batched_ref(
            || Vec::with_capacity(BATCH),
            |descs| {
                while descs.len() < BATCH {
                    match socket.alloc_frame() {
                        Some(addr) => descs.push(XdpDesc::new(addr, 64)),
                        None => break,
                    }
                }
                let sent = match socket.write(descs) {
                    Ok(sent) => sent,
                    Err(err) => panic!("{:?}", err),
                };

                let addrs: Vec<u64> = driver.take_tx(sent).iter().rev().map(|d| d.addr).collect();
                driver.complete(&addrs);
                socket.reclaim()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, pool, socket);
criterion_main!(benches);
