use std::cmp::min;

use crate::buf_pool::BufPool;

/// Where a frame currently is. Indexed by frame offset, never by submission order, since the
/// device may complete transmits in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// In the free pool.
    Free,
    /// Handed to the device through the fill ring.
    Fill,
    /// Came back on the receive ring and is held by the application.
    Received,
    /// Taken from the pool by the application, e.g. to build a packet.
    Owned,
    /// Handed to the device through the transmit ring.
    Transmit,
}

/// Number of frames in each state. The sum always equals the frame count of the area.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounts {
    pub free: usize,
    pub fill: usize,
    pub received: usize,
    pub owned: usize,
    pub transmit: usize,
}

impl FrameCounts {
    pub fn total(&self) -> usize {
        self.free + self.fill + self.received + self.owned + self.transmit
    }
}

/// Vector backed free list plus a state per frame.
#[derive(Debug)]
pub struct BufPoolVec {
    frame_size: u64,
    bufs: Vec<u64>,
    states: Vec<FrameState>,
}

impl BufPoolVec {
    /// Create a pool of `frame_num` frames of `frame_size` bytes, all of them free.
    pub fn new(frame_num: usize, frame_size: usize) -> BufPoolVec {
        let frame_size = frame_size as u64;

        // Reverse so that get() hands out the lowest offsets first
        let bufs = (0..frame_num as u64).rev().map(|i| i * frame_size).collect();

        BufPoolVec {
            frame_size,
            bufs,
            states: vec![FrameState::Free; frame_num],
        }
    }

    fn index(&self, addr: u64) -> Option<usize> {
        if addr % self.frame_size != 0 {
            return None;
        }

        let idx = (addr / self.frame_size) as usize;
        if idx >= self.states.len() {
            return None;
        }

        Some(idx)
    }

    /// State of the frame starting at `addr`, or None if `addr` is not a frame start.
    pub fn state(&self, addr: u64) -> Option<FrameState> {
        self.index(addr).map(|idx| self.states[idx])
    }

    /// Move the frame at `addr` from `from` to `to`. Returns false, leaving the frame untouched,
    /// if it is not currently in `from`. Use `put_buf` to make a frame free again.
    pub fn mark(&mut self, addr: u64, from: FrameState, to: FrameState) -> bool {
        debug_assert!(to != FrameState::Free && from != FrameState::Free);

        let r = self.index(addr);
        match r {
            Some(idx) if self.states[idx] == from => {
                self.states[idx] = to;
                true
            }
            _ => false,
        }
    }

    pub fn counts(&self) -> FrameCounts {
        let mut counts = FrameCounts::default();

        for state in &self.states {
            match state {
                FrameState::Free => counts.free += 1,
                FrameState::Fill => counts.fill += 1,
                FrameState::Received => counts.received += 1,
                FrameState::Owned => counts.owned += 1,
                FrameState::Transmit => counts.transmit += 1,
            }
        }

        counts
    }
}

impl BufPool for BufPoolVec {
    /// Frames moved out of the pool are in [`FrameState::Owned`].
    fn get(&mut self, bufs: &mut Vec<u64>, num: usize) -> usize {
        let ready = min(num, self.bufs.len());

        for _ in 0..ready {
            let Some(buf) = self.bufs.pop() else { break };
            let idx = (buf / self.frame_size) as usize;
            self.states[idx] = FrameState::Owned;
            bufs.push(buf);
        }

        ready
    }

    fn put(&mut self, bufs: &mut Vec<u64>, num: usize) -> usize {
        let ready = min(num, bufs.len());
        let mut accepted = 0;

        for _ in 0..ready {
            if let Some(buf) = bufs.pop() {
                accepted += self.put_buf(buf);
            }
        }

        accepted
    }

    fn put_buf(&mut self, buf: u64) -> usize {
        let r = self.index(buf);
        match r {
            Some(idx) if self.states[idx] != FrameState::Free => {
                self.states[idx] = FrameState::Free;
                self.bufs.push(buf);

                1
            }
            _ => 0,
        }
    }

    fn len(&self) -> usize {
        self.bufs.len()
    }

    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_put() {
        let mut pool = BufPoolVec::new(4, 2048);
        assert_eq!(pool.len(), 4);

        let mut bufs = Vec::new();
        assert_eq!(pool.get(&mut bufs, 3), 3);
        assert_eq!(bufs, vec![0, 2048, 4096]);
        assert_eq!(pool.state(2048), Some(FrameState::Owned));
        assert_eq!(pool.len(), 1);

        // Only one left
        assert_eq!(pool.get(&mut bufs, 3), 1);
        assert!(pool.is_empty());

        assert_eq!(pool.put(&mut bufs, 10), 4);
        assert!(bufs.is_empty());
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn rejects_double_free_and_bad_addrs() {
        let mut pool = BufPoolVec::new(4, 2048);
        let mut bufs = Vec::new();
        pool.get(&mut bufs, 1);

        assert_eq!(pool.put_buf(0), 1);
        assert_eq!(pool.put_buf(0), 0);
        assert_eq!(pool.put_buf(100), 0);
        assert_eq!(pool.put_buf(4 * 2048), 0);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn transitions() {
        let mut pool = BufPoolVec::new(2, 2048);
        let mut bufs = Vec::new();
        pool.get(&mut bufs, 2);

        assert!(pool.mark(0, FrameState::Owned, FrameState::Fill));
        assert!(!pool.mark(0, FrameState::Owned, FrameState::Transmit));
        assert!(pool.mark(0, FrameState::Fill, FrameState::Received));
        assert!(pool.mark(2048, FrameState::Owned, FrameState::Transmit));
        assert!(!pool.mark(4096, FrameState::Owned, FrameState::Transmit));

        let counts = pool.counts();
        assert_eq!(counts.received, 1);
        assert_eq!(counts.transmit, 1);
        assert_eq!(counts.total(), 2);
    }
}
