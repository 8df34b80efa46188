//! Masked rule lookup run on every inbound frame. Matching frames are redirected to the
//! AF_XDP socket registered for the receiving queue, everything else goes to the stack.
//!
//! The map names and layouts are the ones `afxdp_ping::program::XdpProgram` writes.
#![no_std]
#![no_main]

use core::mem;

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, HashMap, XskMap},
    programs::XdpContext,
};

const MAX_MASKS: u32 = 16;
const MAX_RULES: u32 = 1024;
const MAX_QUEUES: u32 = 64;

const ETH_HDR_LEN: usize = 14;
const IPV4_MIN_HDR_LEN: usize = 20;
const ETH_P_IPV4: u16 = 0x0800;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuleKey {
    pub protocol: u8,
    pub secondary: u8,
    /// Network order
    pub dst_port: [u8; 2],
}

impl RuleKey {
    #[inline(always)]
    fn masked(&self, mask: &RuleKey) -> RuleKey {
        RuleKey {
            protocol: self.protocol & mask.protocol,
            secondary: self.secondary & mask.secondary,
            dst_port: [
                self.dst_port[0] & mask.dst_port[0],
                self.dst_port[1] & mask.dst_port[1],
            ],
        }
    }

    #[inline(always)]
    fn is_zero(&self) -> bool {
        self.protocol == 0 && self.secondary == 0 && self.dst_port == [0, 0]
    }
}

/// Rule map key: the mask, then the key with the mask applied
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MaskedKey {
    pub mask: RuleKey,
    pub key: RuleKey,
}

#[map(name = "rules")]
static RULES: HashMap<MaskedKey, u32> = HashMap::with_max_entries(MAX_RULES, 0);

/// Masks in first-use order, an all-zero mask ends the list
#[map(name = "masks")]
static MASKS: Array<RuleKey> = Array::with_max_entries(MAX_MASKS, 0);

#[map(name = "xsks_map")]
static XSKS: XskMap = XskMap::with_max_entries(MAX_QUEUES, 0);

#[xdp]
pub fn xdp_filter(ctx: XdpContext) -> u32 {
    match frame_key(&ctx) {
        Ok(key) => steer(&ctx, &key),
        Err(()) => xdp_action::XDP_PASS,
    }
}

/// Read a `T` at `offset`, or fail if it runs past the end of the frame.
#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();

    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }

    Ok((start + offset) as *const T)
}

#[inline(always)]
fn byte_at(ctx: &XdpContext, offset: usize) -> Result<u8, ()> {
    let ptr = ptr_at::<u8>(ctx, offset)?;
    Ok(unsafe { *ptr })
}

#[inline(always)]
fn frame_key(ctx: &XdpContext) -> Result<RuleKey, ()> {
    let ether_type = ptr_at::<[u8; 2]>(ctx, 12)?;
    if u16::from_be_bytes(unsafe { *ether_type }) != ETH_P_IPV4 {
        return Err(());
    }

    let vihl = byte_at(ctx, ETH_HDR_LEN)?;
    let ihl = (vihl & 0x0f) as usize * 4;
    if vihl >> 4 != 4 || ihl < IPV4_MIN_HDR_LEN {
        return Err(());
    }
    // The whole header, options included, must be in the frame
    ptr_at::<[u8; IPV4_MIN_HDR_LEN]>(ctx, ETH_HDR_LEN)?;
    byte_at(ctx, ETH_HDR_LEN + ihl - 1)?;

    let protocol = byte_at(ctx, ETH_HDR_LEN + 9)?;
    let frag = ptr_at::<[u8; 2]>(ctx, ETH_HDR_LEN + 6)?;
    let frag_offset = u16::from_be_bytes(unsafe { *frag }) & 0x1fff;
    let l4 = ETH_HDR_LEN + ihl;

    let mut key = RuleKey {
        protocol,
        secondary: 0,
        dst_port: [0, 0],
    };
    // Only the first fragment carries the L4 header
    if frag_offset != 0 {
        return Ok(key);
    }

    match protocol {
        IPPROTO_ICMP => key.secondary = byte_at(ctx, l4)?,
        IPPROTO_TCP | IPPROTO_UDP => {
            let ports = ptr_at::<[u8; 4]>(ctx, l4)?;
            let ports = unsafe { *ports };
            key.dst_port = [ports[2], ports[3]];
        }
        _ => {}
    }

    Ok(key)
}

#[inline(always)]
fn steer(ctx: &XdpContext, key: &RuleKey) -> u32 {
    for slot in 0..MAX_MASKS {
        let mask = match MASKS.get(slot) {
            Some(mask) if !mask.is_zero() => *mask,
            _ => break,
        };

        let entry = MaskedKey {
            mask,
            key: key.masked(&mask),
        };
        if unsafe { RULES.get(&entry) }.is_some() {
            let queue = unsafe { (*ctx.ctx).rx_queue_index };
            return match XSKS.redirect(queue, xdp_action::XDP_PASS as u64) {
                Ok(action) => action,
                Err(_) => xdp_action::XDP_PASS,
            };
        }
    }

    xdp_action::XDP_PASS
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
