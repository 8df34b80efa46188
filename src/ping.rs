//! ICMP echo sessions over a [`Socket`].
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use arraydeque::{ArrayDeque, Wrapping};
use thiserror::Error;
use tracing::debug;

use crate::proto::{
    decode_icmp_reply_with, encode_icmp_echo_request, CodecError, DecodeOptions, EchoRequest,
    MacAddr, Rejected, ECHO_HDRS_LEN,
};
use crate::socket::{Socket, SocketError};
use crate::xdp::XdpDesc;

/// Most requests awaiting a reply at once. Older ones are counted lost when the window wraps.
pub const PENDING_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum PingError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingParams {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ident: u16,
    /// ICMP payload bytes per request
    pub payload_size: usize,
    /// How long a request waits for its reply
    pub timeout: Duration,
    /// Check checksums, identifier and source of replies
    pub strict: bool,
}

impl PingParams {
    /// Parameters with a 56 byte payload and a one second timeout.
    pub fn new(
        eth_src: MacAddr,
        eth_dst: MacAddr,
        ip_src: Ipv4Addr,
        ip_dst: Ipv4Addr,
    ) -> PingParams {
        PingParams {
            eth_src,
            eth_dst,
            ip_src,
            ip_dst,
            ident: std::process::id() as u16,
            payload_size: 56,
            timeout: Duration::from_secs(1),
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    pub seq: u16,
    pub ttl: u8,
    pub rtt: Duration,
    pub from: Ipv4Addr,
    /// ICMP payload length of the reply
    pub bytes: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingStats {
    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    /// Replies to a request that was already answered
    pub duplicates: u64,
    /// Replies to a request that had already timed out
    pub late: u64,
    /// Received frames that were not one of our replies
    pub rejected: u64,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    pub total_rtt: Duration,
}

impl PingStats {
    pub fn avg_rtt(&self) -> Option<Duration> {
        if self.received == 0 {
            return None;
        }

        Some(self.total_rtt / self.received as u32)
    }

    /// Lost requests as a percentage of those sent.
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }

        self.lost as f64 * 100.0 / self.sent as f64
    }

    fn record(&mut self, rtt: Duration) {
        self.received += 1;
        self.total_rtt += rtt;
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |min| min.min(rtt)));
        self.max_rtt = Some(self.max_rtt.map_or(rtt, |max| max.max(rtt)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outstanding {
    seq: u16,
    sent_at: Instant,
}

/// One echo session: sequence numbering, the window of unanswered requests and statistics.
#[derive(Debug)]
pub struct Pinger {
    params: PingParams,
    decode: DecodeOptions,
    payload: Vec<u8>,
    next_seq: u16,
    outstanding: ArrayDeque<Outstanding, PENDING_LEN, Wrapping>,
    answered: ArrayDeque<u16, PENDING_LEN, Wrapping>,
    expired: ArrayDeque<u16, PENDING_LEN, Wrapping>,
    rx: Vec<XdpDesc>,
    stats: PingStats,
}

impl Pinger {
    pub fn new(params: PingParams) -> Pinger {
        let decode = if params.strict {
            DecodeOptions::strict(params.ident, params.ip_dst)
        } else {
            DecodeOptions::default()
        };
        let payload = (0..params.payload_size).map(|i| i as u8).collect();

        Pinger {
            params,
            decode,
            payload,
            next_seq: 0,
            outstanding: ArrayDeque::new(),
            answered: ArrayDeque::new(),
            expired: ArrayDeque::new(),
            rx: Vec::new(),
            stats: PingStats::default(),
        }
    }

    pub fn params(&self) -> &PingParams {
        &self.params
    }

    pub fn stats(&self) -> &PingStats {
        &self.stats
    }

    /// Requests sent and neither answered nor expired.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Frame length of one request.
    pub fn frame_len(&self) -> usize {
        ECHO_HDRS_LEN + self.payload.len()
    }

    /// Send the next request. Returns its sequence number, or None if no frame or transmit slot
    /// was free; nothing is consumed in that case.
    pub fn send(&mut self, socket: &mut Socket, now: Instant) -> Result<Option<u16>, PingError> {
        socket.reclaim();

        let addr = match socket.alloc_frame() {
            Some(addr) => addr,
            None => return Ok(None),
        };

        let seq = self.next_seq;
        let req = EchoRequest {
            eth_src: self.params.eth_src,
            eth_dst: self.params.eth_dst,
            ip_src: self.params.ip_src,
            ip_dst: self.params.ip_dst,
            ident: self.params.ident,
            seq,
            ip_id: seq,
            payload: &self.payload,
        };

        let r = socket
            .frame_mut(addr)
            .map(|frame| encode_icmp_echo_request(frame, &req));
        let len = match r {
            Some(Ok(len)) => len,
            Some(Err(err)) => {
                socket.release_frame(addr)?;
                return Err(err.into());
            }
            None => {
                socket.release_frame(addr)?;
                return Ok(None);
            }
        };

        let sent = socket.write(&[XdpDesc::new(addr, len as u32)]);
        match sent {
            Ok(1) => {}
            Ok(_) => {
                socket.release_frame(addr)?;
                return Ok(None);
            }
            Err(err) => {
                // Nothing was queued
                socket.release_frame(addr)?;
                return Err(err.into());
            }
        }

        if let Some(evicted) = self.outstanding.push_back(Outstanding { seq, sent_at: now }) {
            debug!("seq={} pushed out of the window", evicted.seq);
            self.stats.lost += 1;
            self.expired.push_back(evicted.seq);
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        self.stats.sent += 1;

        Ok(Some(seq))
    }

    /// Drain the receive ring, matching replies to outstanding requests, then return every
    /// received frame to the fill ring.
    pub fn receive(
        &mut self,
        socket: &mut Socket,
        now: Instant,
    ) -> Result<Vec<PingReply>, PingError> {
        let mut replies = Vec::new();

        self.rx.clear();
        let batch = socket.config().batch_size;
        socket.read(&mut self.rx, batch);

        for i in 0..self.rx.len() {
            let desc = self.rx[i];
            let r = match socket.packet(&desc) {
                Some(frame) => decode_icmp_reply_with(frame, &self.decode),
                None => Err(Rejected::TooShort),
            };
            socket.recycle(desc.addr)?;

            let reply = match r {
                Ok(reply) if reply.ident == self.params.ident => reply,
                Ok(reply) => {
                    debug!("reply for ident {} ignored", reply.ident);
                    self.stats.rejected += 1;
                    continue;
                }
                Err(reason) => {
                    debug!("frame rejected: {}", reason);
                    self.stats.rejected += 1;
                    continue;
                }
            };

            let pos = self.outstanding.iter().position(|o| o.seq == reply.seq);
            match pos.and_then(|pos| self.outstanding.remove(pos)) {
                Some(req) => {
                    let rtt = now.saturating_duration_since(req.sent_at);
                    self.stats.record(rtt);
                    self.answered.push_back(req.seq);
                    replies.push(PingReply {
                        seq: reply.seq,
                        ttl: reply.ttl,
                        rtt,
                        from: reply.src,
                        bytes: reply.payload_len,
                    });
                }
                None if self.answered.iter().any(|s| *s == reply.seq) => {
                    self.stats.duplicates += 1;
                }
                None if self.expired.iter().any(|s| *s == reply.seq) => {
                    self.stats.late += 1;
                }
                None => {
                    debug!("reply seq={} matches no request", reply.seq);
                    self.stats.rejected += 1;
                }
            }
        }

        socket.fill_reserve();
        socket.wake_if_needed()?;

        Ok(replies)
    }

    /// Count requests older than the timeout as lost. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;

        while let Some(front) = self.outstanding.front() {
            if now.saturating_duration_since(front.sent_at) < self.params.timeout {
                break;
            }
            if let Some(req) = self.outstanding.pop_front() {
                debug!("seq={} timed out", req.seq);
                self.expired.push_back(req.seq);
                self.stats.lost += 1;
                expired += 1;
            }
        }

        expired
    }

    /// End the session: every request still outstanding is lost.
    pub fn finish(mut self) -> PingStats {
        while let Some(req) = self.outstanding.pop_front() {
            debug!("seq={} unanswered", req.seq);
            self.stats.lost += 1;
        }

        self.stats
    }
}
