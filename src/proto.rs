//! Ethernet, IPv4 and ICMP echo encoding and decoding on raw frame bytes.
//!
//! Decoding checks that each header fits in the buffer before reading any of its fields, so
//! any truncated or garbage frame yields a [`Rejected`] reason.
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

use crate::checksum::{checksum16, ipv4_header_checksum};

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const ICMP_HDR_LEN: usize = 8;
/// Ethernet + IPv4 + ICMP headers of an echo frame without options.
pub const ECHO_HDRS_LEN: usize = ETH_HDR_LEN + IPV4_HDR_LEN + ICMP_HDR_LEN;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const IPPROTO_ICMP: u8 = 1;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<MacAddr, ParseMacError> {
        let err = || ParseMacError(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || part.len() > 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer of {have} bytes cannot hold a {need} byte frame")]
    BufferTooSmall { need: usize, have: usize },

    #[error("payload of {0} bytes does not fit in an IPv4 packet")]
    PayloadTooLarge(usize),
}

/// Why a frame is not the reply being looked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    TooShort,
    WrongEtherType,
    BadIpHeader,
    WrongIpProto,
    WrongIcmpType,
    BadChecksum,
    Unexpected,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejected::TooShort => "too short",
            Rejected::WrongEtherType => "not IPv4",
            Rejected::BadIpHeader => "bad IPv4 header",
            Rejected::WrongIpProto => "not ICMP",
            Rejected::WrongIcmpType => "not an echo reply",
            Rejected::BadChecksum => "bad checksum",
            Rejected::Unexpected => "unexpected sender or identifier",
        };
        f.write_str(s)
    }
}

/// Everything needed to build one echo request frame.
#[derive(Debug, Clone, Copy)]
pub struct EchoRequest<'a> {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ident: u16,
    pub seq: u16,
    pub ip_id: u16,
    pub payload: &'a [u8],
}

/// Fields of a decoded echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub ident: u16,
    pub seq: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub eth_src: MacAddr,
    pub payload_len: usize,
}

/// Extra checks applied when decoding. All off by default.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Verify the IPv4 header and ICMP checksums and the IPv4 header fields.
    pub verify_checksums: bool,
    /// Reject replies carrying a different echo identifier.
    pub expect_ident: Option<u16>,
    /// Reject replies from any other address.
    pub expect_source: Option<Ipv4Addr>,
}

impl DecodeOptions {
    pub fn strict(ident: u16, source: Ipv4Addr) -> DecodeOptions {
        DecodeOptions {
            verify_checksums: true,
            expect_ident: Some(ident),
            expect_source: Some(source),
        }
    }
}

/// Write an echo request frame at the start of `buf`. Returns the frame length.
pub fn encode_icmp_echo_request(
    buf: &mut [u8],
    req: &EchoRequest<'_>,
) -> Result<usize, CodecError> {
    let ip_len = IPV4_HDR_LEN + ICMP_HDR_LEN + req.payload.len();
    if ip_len > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge(req.payload.len()));
    }
    let len = ETH_HDR_LEN + ip_len;
    if buf.len() < len {
        return Err(CodecError::BufferTooSmall {
            need: len,
            have: buf.len(),
        });
    }

    //
    // Ethernet
    //
    let (eth, rest) = buf[..len].split_at_mut(ETH_HDR_LEN);
    eth[0..6].copy_from_slice(&req.eth_dst.0);
    eth[6..12].copy_from_slice(&req.eth_src.0);
    eth[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());

    //
    // IPv4
    //
    let (ip, icmp) = rest.split_at_mut(IPV4_HDR_LEN);
    ip[0] = 0x45;
    ip[1] = 0;
    ip[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    ip[4..6].copy_from_slice(&req.ip_id.to_be_bytes());
    ip[6..8].copy_from_slice(&[0, 0]);
    ip[8] = DEFAULT_TTL;
    ip[9] = IPPROTO_ICMP;
    ip[10..12].copy_from_slice(&[0, 0]);
    ip[12..16].copy_from_slice(&req.ip_src.octets());
    ip[16..20].copy_from_slice(&req.ip_dst.octets());
    let csum = ipv4_header_checksum(ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());

    //
    // ICMP
    //
    icmp[0] = ICMP_ECHO_REQUEST;
    icmp[1] = 0;
    icmp[2..4].copy_from_slice(&[0, 0]);
    icmp[4..6].copy_from_slice(&req.ident.to_be_bytes());
    icmp[6..8].copy_from_slice(&req.seq.to_be_bytes());
    icmp[ICMP_HDR_LEN..].copy_from_slice(req.payload);
    let csum = checksum16(icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    Ok(len)
}

/// Header positions of a parsed echo frame.
struct EchoLayout {
    /// Start of the ICMP header
    l4: usize,
    /// End of the IP packet, before any Ethernet padding
    end: usize,
}

fn parse_echo(buf: &[u8], icmp_type: u8, opts: &DecodeOptions) -> Result<EchoLayout, Rejected> {
    if buf.len() < ETH_HDR_LEN {
        return Err(Rejected::TooShort);
    }
    if u16::from_be_bytes([buf[12], buf[13]]) != ETH_P_IPV4 {
        return Err(Rejected::WrongEtherType);
    }

    if buf.len() < ETH_HDR_LEN + IPV4_HDR_LEN {
        return Err(Rejected::TooShort);
    }
    let ip = &buf[ETH_HDR_LEN..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ip[0] >> 4 != 4 || ihl < IPV4_HDR_LEN {
        return Err(Rejected::BadIpHeader);
    }
    if ip.len() < ihl {
        return Err(Rejected::TooShort);
    }
    if ip[9] != IPPROTO_ICMP {
        return Err(Rejected::WrongIpProto);
    }

    let l4 = ETH_HDR_LEN + ihl;
    if buf.len() < l4 + ICMP_HDR_LEN {
        return Err(Rejected::TooShort);
    }
    if buf[l4] != icmp_type {
        return Err(Rejected::WrongIcmpType);
    }

    // The frame may carry Ethernet padding past the IP packet
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let declared_end = ETH_HDR_LEN + total_len;
    let end = if total_len >= ihl + ICMP_HDR_LEN && declared_end <= buf.len() {
        declared_end
    } else if opts.verify_checksums {
        return Err(Rejected::BadIpHeader);
    } else {
        buf.len()
    };

    if opts.verify_checksums {
        if checksum16(&buf[ETH_HDR_LEN..l4]) != 0 || checksum16(&buf[l4..end]) != 0 {
            return Err(Rejected::BadChecksum);
        }
    }

    Ok(EchoLayout { l4, end })
}

/// Decode an echo reply.
///
/// Besides frames that are too short or are not IPv4 ICMP echo replies, frames whose IP
/// header has a version other than 4 or an IHL below 5 are rejected as
/// [`Rejected::BadIpHeader`]. This check applies without [`DecodeOptions`] too.
pub fn decode_icmp_reply(buf: &[u8]) -> Result<EchoReply, Rejected> {
    decode_icmp_reply_with(buf, &DecodeOptions::default())
}

/// Decode an echo reply, applying the extra checks in `opts`.
pub fn decode_icmp_reply_with(buf: &[u8], opts: &DecodeOptions) -> Result<EchoReply, Rejected> {
    let layout = parse_echo(buf, ICMP_ECHO_REPLY, opts)?;
    let ip = &buf[ETH_HDR_LEN..];
    let icmp = &buf[layout.l4..];

    let mut eth_src = [0u8; 6];
    eth_src.copy_from_slice(&buf[6..12]);

    let reply = EchoReply {
        ident: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
        src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
        ttl: ip[8],
        eth_src: MacAddr(eth_src),
        payload_len: layout.end - layout.l4 - ICMP_HDR_LEN,
    };

    if let Some(ident) = opts.expect_ident {
        if reply.ident != ident {
            return Err(Rejected::Unexpected);
        }
    }
    if let Some(source) = opts.expect_source {
        if reply.src != source {
            return Err(Rejected::Unexpected);
        }
    }

    Ok(reply)
}

/// Turn the echo request in `frame` into its reply: addresses swapped, type set to echo reply,
/// checksums recomputed. Returns the length of the reply frame.
pub fn echo_reply_in_place(frame: &mut [u8]) -> Result<usize, Rejected> {
    let layout = parse_echo(frame, ICMP_ECHO_REQUEST, &DecodeOptions::default())?;
    let l4 = layout.l4;
    let end = layout.end;

    for i in 0..6 {
        frame.swap(i, 6 + i);
    }

    let ip = &mut frame[ETH_HDR_LEN..l4];
    for i in 0..4 {
        ip.swap(12 + i, 16 + i);
    }
    ip[8] = DEFAULT_TTL;
    let csum = ipv4_header_checksum(ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());

    let icmp = &mut frame[l4..end];
    icmp[0] = ICMP_ECHO_REPLY;
    icmp[2..4].copy_from_slice(&[0, 0]);
    let csum = checksum16(icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    Ok(end)
}
