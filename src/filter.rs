//! Packet classification against a two-level rule table.
//!
//! A rule matches a subset of the fields of a [`RuleKey`]: which subset is given by its mask.
//! The table keeps one hash map from `(mask, key & mask)` to rule markers, plus the short
//! ordered list of distinct masks in use. A frame is classified by building its raw key and
//! looking it up in the map under each mask in turn. Rules of different shapes share one map
//! without matching each other's lookups, and the lookups per frame are bounded by the number
//! of masks.
//!
//! [`classify`] is the logic of the XDP program; the same key layout is written into the
//! program's maps by `program::XdpProgram::sync_rules`. On the in-process link it runs at the
//! driver's receive boundary instead.
use std::cmp::min;
use std::collections::HashMap;

use thiserror::Error;

use crate::xdp::{XDP_PASS, XDP_REDIRECT};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Most masks an XDP program checks per frame.
pub const MAX_MASKS: usize = 16;
pub const MAX_RULES: usize = 1024;

const ETH_HDR_LEN: usize = 14;
const ETH_P_IPV4: u16 = 0x0800;
const IPV4_MIN_HDR_LEN: usize = 20;

/// Lookup key, laid out as the program's map key: protocol, ICMP type, destination port in
/// network order.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub protocol: u8,
    pub secondary: u8,
    pub dst_port: [u8; 2],
}

impl RuleKey {
    pub fn new(protocol: u8, secondary: u8, dst_port: u16) -> RuleKey {
        RuleKey {
            protocol,
            secondary,
            dst_port: dst_port.to_be_bytes(),
        }
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }

    pub fn masked(&self, mask: &RuleKey) -> RuleKey {
        RuleKey {
            protocol: self.protocol & mask.protocol,
            secondary: self.secondary & mask.secondary,
            dst_port: [
                self.dst_port[0] & mask.dst_port[0],
                self.dst_port[1] & mask.dst_port[1],
            ],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.to_bytes() == [0; 4]
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.protocol,
            self.secondary,
            self.dst_port[0],
            self.dst_port[1],
        ]
    }
}

/// Map key of one rule: the mask of its shape and its key under that mask. Laid out as the
/// program's rule map key.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskedKey {
    pub mask: RuleKey,
    pub key: RuleKey,
}

impl MaskedKey {
    pub fn new(key: &RuleKey, mask: &RuleKey) -> MaskedKey {
        MaskedKey {
            mask: *mask,
            key: key.masked(mask),
        }
    }
}

/// A rule in terms of header fields. The protocol always takes part in the match; the ICMP
/// type and destination port only when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rule {
    pub protocol: u8,
    pub icmp_type: Option<u8>,
    pub dst_port: Option<u16>,
}

impl Rule {
    pub fn icmp(icmp_type: u8) -> Rule {
        Rule {
            protocol: IPPROTO_ICMP,
            icmp_type: Some(icmp_type),
            dst_port: None,
        }
    }

    pub fn udp(dst_port: u16) -> Rule {
        Rule {
            protocol: IPPROTO_UDP,
            icmp_type: None,
            dst_port: Some(dst_port),
        }
    }

    pub fn tcp(dst_port: u16) -> Rule {
        Rule {
            protocol: IPPROTO_TCP,
            icmp_type: None,
            dst_port: Some(dst_port),
        }
    }

    /// Every frame of this IP protocol.
    pub fn protocol(protocol: u8) -> Rule {
        Rule {
            protocol,
            icmp_type: None,
            dst_port: None,
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(
            self.protocol,
            self.icmp_type.unwrap_or(0),
            self.dst_port.unwrap_or(0),
        )
    }

    pub fn mask(&self) -> RuleKey {
        RuleKey {
            protocol: 0xff,
            secondary: if self.icmp_type.is_some() { 0xff } else { 0 },
            dst_port: if self.dst_port.is_some() {
                [0xff, 0xff]
            } else {
                [0, 0]
            },
        }
    }
}

/// Opaque value stored for a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleMarker(pub u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("mask limit of {0} reached")]
    TooManyMasks(usize),

    #[error("rule limit of {0} reached")]
    TooManyRules(usize),

    #[error("an all-zero mask matches nothing")]
    EmptyMask,
}

/// Read-only view of a rule table, as seen by the classifier.
pub trait RuleView {
    /// Masks in lookup order. A zero mask ends the list.
    fn masks(&self) -> &[RuleKey];

    fn lookup(&self, key: &MaskedKey) -> Option<RuleMarker>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    NotIpv4,
    Truncated,
    Malformed,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Leave the frame to the kernel network stack.
    Pass(PassReason),
    /// Hand the frame to the socket registered for this queue.
    Redirect(u32),
}

impl Verdict {
    /// The XDP action code for this verdict.
    pub fn action(&self) -> u32 {
        match self {
            Verdict::Pass(_) => XDP_PASS,
            Verdict::Redirect(_) => XDP_REDIRECT,
        }
    }
}

/// The rule table.
///
/// Each rule has its own entry and marker. Masks are appended the first time a rule of that
/// shape is added and dropped when the last such rule is removed.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: HashMap<MaskedKey, RuleMarker>,
    masks: Vec<RuleKey>,
    mask_refs: Vec<usize>,
    max_masks: usize,
    max_rules: usize,
    next_marker: u32,
}

impl Default for RuleTable {
    fn default() -> RuleTable {
        RuleTable::new(MAX_MASKS, MAX_RULES)
    }
}

impl RuleTable {
    /// `max_masks` is capped at [`MAX_MASKS`], the number of masks the program checks.
    pub fn new(max_masks: usize, max_rules: usize) -> RuleTable {
        RuleTable {
            rules: HashMap::new(),
            masks: Vec::new(),
            mask_refs: Vec::new(),
            max_masks: min(max_masks, MAX_MASKS),
            max_rules,
            next_marker: 1,
        }
    }

    pub fn max_masks(&self) -> usize {
        self.max_masks
    }

    pub fn max_rules(&self) -> usize {
        self.max_rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn insert(&mut self, rule: Rule) -> Result<RuleMarker, FilterError> {
        self.insert_masked(rule.key(), rule.mask())
    }

    /// Add a rule given as a raw key and mask. Adding a rule that is already present returns
    /// its marker.
    pub fn insert_masked(
        &mut self,
        key: RuleKey,
        mask: RuleKey,
    ) -> Result<RuleMarker, FilterError> {
        if mask.is_zero() {
            return Err(FilterError::EmptyMask);
        }

        let entry = MaskedKey::new(&key, &mask);
        if let Some(marker) = self.rules.get(&entry) {
            return Ok(*marker);
        }

        if self.rules.len() >= self.max_rules {
            return Err(FilterError::TooManyRules(self.max_rules));
        }
        let mask_pos = self.masks.iter().position(|m| *m == mask);
        if mask_pos.is_none() && self.masks.len() >= self.max_masks {
            return Err(FilterError::TooManyMasks(self.max_masks));
        }

        match mask_pos {
            Some(pos) => self.mask_refs[pos] += 1,
            None => {
                self.masks.push(mask);
                self.mask_refs.push(1);
            }
        }

        let marker = RuleMarker(self.next_marker);
        self.next_marker = self.next_marker.wrapping_add(1);
        self.rules.insert(entry, marker);

        Ok(marker)
    }

    pub fn remove(&mut self, rule: &Rule) -> Option<RuleMarker> {
        self.remove_masked(rule.key(), rule.mask())
    }

    pub fn remove_masked(&mut self, key: RuleKey, mask: RuleKey) -> Option<RuleMarker> {
        let marker = self.rules.remove(&MaskedKey::new(&key, &mask))?;

        if let Some(pos) = self.masks.iter().position(|m| *m == mask) {
            self.mask_refs[pos] -= 1;
            if self.mask_refs[pos] == 0 {
                self.masks.remove(pos);
                self.mask_refs.remove(pos);
            }
        }

        Some(marker)
    }

    /// Rule entries and their markers, as stored in the program's rule map.
    pub fn entries(&self) -> impl Iterator<Item = (&MaskedKey, RuleMarker)> + '_ {
        self.rules.iter().map(|(key, marker)| (key, *marker))
    }
}

impl RuleView for RuleTable {
    fn masks(&self) -> &[RuleKey] {
        &self.masks
    }

    fn lookup(&self, key: &MaskedKey) -> Option<RuleMarker> {
        self.rules.get(key).copied()
    }
}

/// Build the lookup key of an Ethernet frame. Every field is bounds checked before it is read.
pub fn frame_key(frame: &[u8]) -> Result<RuleKey, PassReason> {
    if frame.len() < ETH_HDR_LEN {
        return Err(PassReason::Truncated);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IPV4 {
        return Err(PassReason::NotIpv4);
    }

    let ip = &frame[ETH_HDR_LEN..];
    if ip.len() < IPV4_MIN_HDR_LEN {
        return Err(PassReason::Truncated);
    }
    if ip[0] >> 4 != 4 {
        return Err(PassReason::Malformed);
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HDR_LEN {
        return Err(PassReason::Malformed);
    }
    if ip.len() < ihl {
        return Err(PassReason::Truncated);
    }

    let protocol = ip[9];
    let frag_offset = u16::from_be_bytes([ip[6], ip[7]]) & 0x1fff;
    let l4 = &ip[ihl..];

    // Only the first fragment carries the L4 header
    if frag_offset != 0 {
        return Ok(RuleKey::new(protocol, 0, 0));
    }

    match protocol {
        IPPROTO_ICMP => {
            if l4.is_empty() {
                return Err(PassReason::Truncated);
            }
            Ok(RuleKey::new(protocol, l4[0], 0))
        }
        IPPROTO_TCP | IPPROTO_UDP => {
            if l4.len() < 4 {
                return Err(PassReason::Truncated);
            }
            Ok(RuleKey {
                protocol,
                secondary: 0,
                dst_port: [l4[2], l4[3]],
            })
        }
        _ => Ok(RuleKey::new(protocol, 0, 0)),
    }
}

/// Decide what happens to `frame` arriving on `queue`.
pub fn classify<V: RuleView + ?Sized>(frame: &[u8], rules: &V, queue: u32) -> Verdict {
    let key = match frame_key(frame) {
        Ok(key) => key,
        Err(reason) => return Verdict::Pass(reason),
    };

    for mask in rules.masks().iter().take(MAX_MASKS) {
        if mask.is_zero() {
            break;
        }
        if rules.lookup(&MaskedKey::new(&key, mask)).is_some() {
            return Verdict::Redirect(queue);
        }
    }

    Verdict::Pass(PassReason::NoMatch)
}
