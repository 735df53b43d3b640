//! CRC-8 Dallas/Maxim, computed bit-serially without a lookup table.
//!
//! The device firmware computes the checksum LSB-first with the reflected
//! polynomial `0x8C`; the same routine validates incoming payloads and
//! terminates outgoing commands.

/// Reflected Dallas/Maxim polynomial (x^8 + x^5 + x^4 + 1).
const POLY: u8 = 0x8C;

/// CRC-8 over the whole slice.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= POLY;
            }
            b >>= 1;
        }
    }
    crc
}

/// CRC-8 over `bytes[start..end]`.
///
/// Out-of-range bounds are clamped to the slice.
pub fn crc8_range(bytes: &[u8], start: usize, end: usize) -> u8 {
    let end = end.min(bytes.len());
    let start = start.min(end);
    crc8(&bytes[start..end])
}

/// Append the CRC of everything from `from` to the end of `buf`.
pub fn append_crc8(buf: &mut Vec<u8>, from: usize) {
    let crc = crc8_range(buf, from, buf.len());
    buf.push(crc);
}
