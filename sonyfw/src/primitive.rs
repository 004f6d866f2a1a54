//! Byte primitives: CRC-32 over one or more streams, and the small
//! checksum variants used by the block-cipher envelope and the ancillary
//! readers (§3/§4 of the format notes).

use std::io::Read;

/// CRC-32 (IEEE 802.3 polynomial, as used by zlib/gzip) over the
/// concatenation of every reader passed in, in order.
///
/// Matches `crc32(*files)` in the original tool: each source is drained to
/// EOF and folds into a single running CRC.
pub fn crc32_streams<R: Read>(sources: &mut [R]) -> std::io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 4096];
    for source in sources {
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hasher.finalize())
}

/// CRC-32 over a single byte slice.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 16-bit little-endian word-sum checksum used by the block-cipher frame
/// header: sum of 16-bit LE words of `data`, wrapping modulo 2^16.
///
/// `data` need not have even length; a trailing odd byte is summed as its
/// own little-endian word with an implicit zero high byte.
#[must_use]
pub fn checksum16_le(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_le_bytes([pair[0], pair[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last));
    }
    (sum & 0xffff) as u16
}

/// 32-bit byte-sum checksum used by ASH, DSLR, and MS-firm manifests:
/// the sum of every byte, wrapping modulo 2^32.
#[must_use]
pub fn checksum32_bytesum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = sum.wrapping_add(u32::from(b));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum16_matches_manual_sum() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        // words: 0x0201, 0x0403, then 0x05
        let expected = (0x0201u32 + 0x0403 + 0x05) & 0xffff;
        assert_eq!(checksum16_le(&data), expected as u16);
    }

    #[test]
    fn checksum32_bytesum_wraps() {
        let data = [0xffu8; 16];
        let sum = checksum32_bytesum(&data);
        assert_eq!(sum, 0xff * 16);
    }

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
