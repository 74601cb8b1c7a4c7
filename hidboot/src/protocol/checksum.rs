//! Two's-complement checksums used by HEX lines and program frames.

/// 8-bit checksum: appending it makes the byte sum zero modulo 256.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Sum of all bytes modulo 2^16.
pub fn sum16(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// 16-bit checksum: `(frame_checksum(data) + sum16(data)) mod 2^16 == 0`.
pub fn frame_checksum(data: &[u8]) -> u16 {
    sum16(data).wrapping_neg()
}
