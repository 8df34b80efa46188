//
// Random interleavings of producer and consumer operations on one ring, checked against a model
// queue.
//
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use afxdp_ping::ring::ring_pair;

#[test]
fn fifo_and_capacity_hold() {
    for &size in [1u32, 2, 8, 64].iter() {
        let (mut prod, mut cons) = ring_pair::<u64>(size).unwrap();
        let mut rng = StdRng::seed_from_u64(size as u64);

        let mut next = 0u64;
        let mut expected = 0u64;
        // Reserved and not yet submitted
        let mut reserved: VecDeque<u64> = VecDeque::new();
        // In the ring: submitted and not yet released
        let mut in_ring = 0u32;
        // Peeked and not yet released
        let mut peeked = 0u32;

        for _ in 0..50_000 {
            match rng.gen_range(0..4) {
                0 => {
                    let n = rng.gen_range(1..=size);
                    let mut idx = 0;
                    let used = in_ring + reserved.len() as u32;
                    let got = prod.reserve(n, &mut idx);
                    if n <= size - used {
                        assert_eq!(got, n);
                        for i in 0..n {
                            prod.set(idx.wrapping_add(i), next);
                            reserved.push_back(next);
                            next += 1;
                        }
                    } else {
                        assert_eq!(got, 0, "reserved {} with {} of {} used", n, used, size);
                    }
                }
                1 => {
                    if !reserved.is_empty() {
                        let n = rng.gen_range(1..=reserved.len() as u32);
                        prod.submit(n);
                        reserved.drain(..n as usize);
                        in_ring += n;
                    }
                }
                2 => {
                    let mut idx = 0;
                    let max = rng.gen_range(1..=size);
                    let got = cons.peek(max, &mut idx);
                    // Everything already submitted is visible
                    assert_eq!(got, max.min(in_ring - peeked));
                    for i in 0..got {
                        assert_eq!(cons.get(idx.wrapping_add(i)), expected);
                        expected += 1;
                    }
                    peeked += got;
                }
                _ => {
                    if peeked > 0 {
                        let n = rng.gen_range(1..=peeked);
                        let before = prod.free(size);
                        cons.release(n);
                        peeked -= n;
                        in_ring -= n;
                        assert_eq!(prod.free(size), before + n);
                    }
                }
            }

            assert!(prod.free(size) <= size);
            assert_eq!(prod.pending(), in_ring);
        }

        assert!(next > 0 && expected > 0);
    }
}
