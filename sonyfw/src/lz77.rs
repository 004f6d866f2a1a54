//! LZ77 decompressor for the Sony kernel-side variant used by cramfs (when
//! flagged), warm-boot images, and LZPT-compressed flash images.
//!
//! Kernel source this mirrors: `lib/lz77/lz77_inflate.c`.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

/// Back-reference lengths selectable by the 4-bit length index in a
/// compressed-frame back-reference token.
const LENGTHS: [usize; 16] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 32, 64,
];

/// Decodes one LZ77 frame from `r`, returning the decompressed bytes.
///
/// Reads a one-byte type discriminator: `0x0F` is an uncompressed frame
/// (a reserved byte, a little-endian u16 length, then that many bytes
/// verbatim); `0xF0` is a compressed frame terminated in-stream by a
/// zero back-distance token. Any other discriminator is
/// [`Error::Unsupported`].
pub fn inflate<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let kind = r.read_u8()?;
    match kind {
        0x0f => inflate_uncompressed(r),
        0xf0 => inflate_compressed(r),
        other => Err(Error::Unsupported(format!(
            "lz77 frame type {other:#04x}"
        ))),
    }
}

fn inflate_uncompressed<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    // The reserved byte is never interpreted; it is read and discarded.
    let _reserved = r.read_u8()?;
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

fn inflate_compressed<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    loop {
        let flags = r.read_u8()?;
        if flags == 0x00 {
            // Performance shortcut: 8 literal bytes in one step.
            let mut lit = [0u8; 8];
            r.read_exact(&mut lit)?;
            out.extend_from_slice(&lit);
            continue;
        }

        for bit in 0..8 {
            if (flags >> bit) & 1 == 0 {
                out.push(r.read_u8()?);
                continue;
            }

            let b0 = r.read_u8()?;
            let b1 = r.read_u8()?;
            let length_index = (b0 >> 4) as usize;
            let back_distance = (u16::from(b0 & 0x0f) << 8 | u16::from(b1)) as usize;

            if back_distance == 0 {
                return Ok(out);
            }

            let length = LENGTHS[length_index];
            copy_overlapping(&mut out, back_distance, length)?;
        }
    }
}

/// Copies `length` bytes from `back_distance` bytes before the current end
/// of `out` onto the end of `out`, allowing the classic LZSS
/// repeat-overlap: when `length > back_distance`, the copy re-reads bytes
/// it has itself just emitted.
fn copy_overlapping(out: &mut Vec<u8>, back_distance: usize, length: usize) -> Result<()> {
    if back_distance > out.len() {
        return Err(Error::Malformed(format!(
            "lz77 back-reference of {back_distance} exceeds {} bytes of output",
            out.len()
        )));
    }
    let start = out.len() - back_distance;
    out.reserve(length);
    for i in 0..length {
        let b = out[start + i];
        out.push(b);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn uncompressed_frame_round_trips() {
        let mut input = vec![0x0f, 0x00];
        input.extend_from_slice(&5u16.to_le_bytes());
        input.extend_from_slice(b"hello");
        let out = inflate(&mut Cursor::new(input)).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn compressed_frame_overlap_rle() {
        // flag 0b11111110: bit0 is a back-reference, bits1-7 are literals
        // that never get read because the terminator fires first.
        let input = vec![0xf0, 0b1111_1110, 0x41, 0x11, 0x01, 0x00, 0x00];
        let out = inflate(&mut Cursor::new(input)).unwrap();
        assert_eq!(out, b"AAAAA");
    }

    #[test]
    fn literal_shortcut_emits_eight_bytes() {
        let mut input = vec![0xf0, 0x00];
        input.extend_from_slice(b"12345678");
        input.extend_from_slice(&[0x01, 0x00, 0x00]); // terminate
        let out = inflate(&mut Cursor::new(input)).unwrap();
        assert_eq!(out, b"12345678");
    }

    #[test]
    fn unknown_discriminator_is_unsupported() {
        let input = vec![0x55];
        let err = inflate(&mut Cursor::new(input)).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
