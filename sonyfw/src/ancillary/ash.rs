//! ASH: an older, whole-image-encrypted firmware container used before the
//! `.dat`/`FDAT` pipeline. Grounded on `fwtool/sony/ash.py`.
//!
//! Two candidate decryption functions are tried against the header in
//! turn — a byte-wise LUT (`b^3 mod 253`) and an xor55 keystream — and
//! whichever produces the right magic wins. Both are involutions only for
//! some input bytes, so re-encryption is deliberately not offered (the
//! original never implemented it either).

use crate::error::{Error, Result};
use crate::structio::wire_struct;
use crate::xor55;
use std::io::{Cursor, Read, Seek, SeekFrom};

wire_struct! {
    be struct AshHeader {
        magic: [u8; 8],
        model: [u8; 4],
        region: [u8; 4],
        checksum: u32,
        _reserved1: [u8; 4],
        size: [u8; 8],
        version: u16,
        _reserved2: [u8; 30],
    }
}

const MAGIC: [u8; 8] = *b"CX0900AP";
const XOR55_SEED: u32 = 0x1234_5678;

fn decrypt_lut(data: &[u8]) -> Vec<u8> {
    let lut: Vec<u8> = (0u32..256)
        .map(|b| if b < 253 { ((b * b * b) % 253) as u8 } else { b as u8 })
        .collect();
    data.iter().map(|&b| lut[b as usize]).collect()
}

fn decrypt_xor(data: &[u8]) -> Vec<u8> {
    xor55::crypt(XOR55_SEED, data, true)
}

type DecryptFn = fn(&[u8]) -> Vec<u8>;
const DECRYPTERS: [DecryptFn; 2] = [decrypt_lut, decrypt_xor];

fn find_decrypter<R: Read + Seek>(source: &mut R) -> Result<Option<DecryptFn>> {
    source.seek(SeekFrom::Start(0))?;
    let mut header_bytes = vec![0u8; AshHeader::SIZE];
    if source.read_exact(&mut header_bytes).is_err() {
        return Ok(None);
    }
    for &decrypt in &DECRYPTERS {
        let candidate = decrypt(&header_bytes);
        if let Some(header) = AshHeader::from_bytes(&candidate) {
            if header.magic == MAGIC {
                return Ok(Some(decrypt));
            }
        }
    }
    Ok(None)
}

/// Sniffs whether either decrypt function turns the header into the `ASH` magic.
pub fn is_ash<R: Read + Seek>(source: &mut R) -> bool {
    find_decrypter(source).ok().flatten().is_some()
}

/// A decoded ASH firmware image.
pub struct AshFile {
    /// Numeric model id.
    pub model: u32,
    /// Region code.
    pub region: u32,
    /// `"<major>.00"`-formatted firmware version.
    pub version: String,
    /// Decrypted image, including its header.
    pub firmware: Cursor<Vec<u8>>,
}

/// Decrypts and parses an ASH firmware image.
pub fn read_ash<R: Read + Seek>(mut source: R) -> Result<AshFile> {
    let decrypt = find_decrypter(&mut source)?.ok_or_else(|| Error::WrongMagic("ash header".to_string()))?;

    source.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    source.read_to_end(&mut raw)?;
    let data = decrypt(&raw);

    let header = AshHeader::from_bytes(&data).ok_or_else(|| Error::Truncated("ash header".to_string()))?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("ash header".to_string()));
    }

    let payload_sum: u64 = data[AshHeader::SIZE..].iter().map(|&b| u64::from(b)).sum();
    if (payload_sum & 0xFFFF_FFFF) as u32 != header.checksum {
        return Err(Error::WrongChecksum("ash payload".to_string()));
    }

    let model_text = std::str::from_utf8(&header.model).map_err(|_| Error::Malformed("ash model".to_string()))?;
    let model: u32 = model_text.parse().map_err(|_| Error::Malformed(format!("ash model {model_text:?}")))?;
    let region_text = std::str::from_utf8(&header.region).map_err(|_| Error::Malformed("ash region".to_string()))?;
    let region = u32::from_str_radix(region_text, 16).map_err(|_| Error::Malformed(format!("ash region {region_text:?}")))?;

    Ok(AshFile {
        model,
        region,
        version: format!("{}.00", header.version),
        firmware: Cursor::new(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_plaintext(payload: &[u8]) -> Vec<u8> {
        let checksum: u64 = payload.iter().map(|&b| u64::from(b)).sum();
        let mut header = AshHeader {
            magic: MAGIC,
            model: *b"0100",
            region: *b"0001",
            checksum: (checksum & 0xFFFF_FFFF) as u32,
            _reserved1: [0; 4],
            size: *b"00000000",
            version: 3,
            _reserved2: [0; 30],
        }
        .to_bytes();
        header.extend_from_slice(payload);
        header
    }

    #[test]
    fn round_trips_through_lut_decrypt() {
        let plaintext = build_plaintext(b"firmware payload bytes");
        let encrypted = decrypt_lut(&plaintext);

        assert!(is_ash(&mut Cursor::new(encrypted.clone())));
        let file = read_ash(Cursor::new(encrypted)).unwrap();
        assert_eq!(file.model, 100);
        assert_eq!(file.region, 1);
        assert_eq!(file.version, "3.00");
    }

    #[test]
    fn round_trips_through_xor_decrypt() {
        let plaintext = build_plaintext(b"other payload");
        let encrypted = decrypt_xor(&plaintext);

        assert!(is_ash(&mut Cursor::new(encrypted.clone())));
        let file = read_ash(Cursor::new(encrypted)).unwrap();
        assert_eq!(file.model, 100);
    }

    #[test]
    fn rejects_garbage() {
        let data = vec![0u8; AshHeader::SIZE + 16];
        assert!(!is_ash(&mut Cursor::new(data)));
    }
}
