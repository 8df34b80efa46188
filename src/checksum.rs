//! Internet checksum (RFC 1071).

/// Offset of the checksum field in an IPv4 header.
const IPV4_CHECKSUM_OFFSET: usize = 10;

/// One's complement sum of `data` as big-endian 16-bit words, added to `initial`. An odd
/// trailing byte is summed as if followed by a zero byte.
pub fn sum(data: &[u8], initial: u64) -> u64 {
    let mut acc = initial;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }

    acc
}

/// Fold a wide accumulator down to 16 bits, adding each carry back in until none is left.
pub fn fold(mut acc: u64) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }

    acc as u16
}

/// Checksum of `data`, ready to be stored big-endian. Summing a buffer that already holds its
/// correct checksum gives 0.
pub fn checksum16(data: &[u8]) -> u16 {
    !fold(sum(data, 0))
}

/// Checksum of an IPv4 header, ignoring whatever its checksum field currently holds.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    if header.len() < IPV4_CHECKSUM_OFFSET + 2 {
        return checksum16(header);
    }

    let acc = sum(&header[..IPV4_CHECKSUM_OFFSET], 0);
    let acc = sum(&header[IPV4_CHECKSUM_OFFSET + 2..], acc);

    !fold(acc)
}
