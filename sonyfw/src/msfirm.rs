//! Memory-stick firmware: an HMAC-ish-sealed, section-framed container
//! used by the oldest cameras that shipped firmware updates on a Memory
//! Stick rather than over USB. Grounded on `fwtool/sony/msfirm.py`.

use crate::cipher::{CrypterId, KeyProvider};
use crate::error::{Error, Result};
use crate::primitive::checksum32_bytesum;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Read;

const HEADER_SIZE: usize = 0x80;
const MANIFEST_SIZE: usize = 0x5000;

/// HMAC-SHA1-shaped integrity hash: `H(K^0x5C || H(K^0x36 || data))`,
/// where `K` is the 64-byte per-device key (already the HMAC block size,
/// so there is no separate key-stretch step).
fn calc_hash(key: &[u8; 64], data: &[u8]) -> [u8; 20] {
    let ipad: Vec<u8> = key.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = key.iter().map(|b| b ^ 0x5c).collect();

    let mut inner = Sha1::new();
    inner.update(&ipad);
    inner.update(data);
    let inner_digest = inner.finalize();

    let mut outer = Sha1::new();
    outer.update(&opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

fn check_header_hash(key: &[u8; 64], header: &[u8; HEADER_SIZE]) -> bool {
    let mut zeroed = *header;
    zeroed[HEADER_SIZE - 20..].fill(0);
    calc_hash(key, &zeroed) == header[HEADER_SIZE - 20..]
}

/// Decrypts one `{0x80-byte header}{size bytes}` section starting at
/// `offset` in `data`, verifying the header hash and the data hash
/// before XOR-ing the body against the rolling SHA-1 keystream (the same
/// construction as [`crate::cipher::sha::ShaCrypter`], minus block
/// framing — a section's size is known up front from the manifest).
fn decrypt_section(data: &[u8], offset: usize, size: usize, key: &[u8; 64]) -> Result<Vec<u8>> {
    let header: [u8; HEADER_SIZE] = data
        .get(offset..offset + HEADER_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Truncated("msfirm section header".to_string()))?;
    if header[20..HEADER_SIZE - 20].iter().any(|&b| b != 0) {
        return Err(Error::Malformed(
            "msfirm section header padding not zero".to_string(),
        ));
    }
    if !check_header_hash(key, &header) {
        return Err(Error::WrongChecksum("msfirm header hash".to_string()));
    }

    let body = data
        .get(offset + HEADER_SIZE..offset + HEADER_SIZE + size)
        .ok_or_else(|| Error::Truncated("msfirm section body".to_string()))?;
    let data_hash = calc_hash(key, body);
    if data_hash != header[0..20] {
        return Err(Error::WrongChecksum("msfirm data hash".to_string()));
    }

    let mut digest: [u8; 20] = key[0..20].try_into().expect("slice of 20 is 20 bytes");
    let tail: [u8; 20] = key[20..40].try_into().expect("slice of 20 is 20 bytes");
    let keystream = crate::cipher::sha::rolling_keystream(&mut digest, &tail, body.len());
    Ok(body
        .iter()
        .zip(keystream.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}

/// One decrypted file carried by the container: `cntent.dat` (the
/// manifest itself) followed by every section named in it, in manifest order.
#[derive(Debug, Clone)]
pub struct MsFirmEntry {
    /// File name as it appears in the container (no leading slash).
    pub name: String,
    /// Decrypted file contents.
    pub data: Vec<u8>,
}

/// A parsed memory-stick firmware container.
#[derive(Debug, Clone)]
pub struct MsFirmRecord {
    /// Model identifier, if the manifest's `[header]` section carries one.
    pub model: Option<u32>,
    /// Region identifier, if present.
    pub region: Option<u32>,
    /// Firmware version string, if present.
    pub version: Option<String>,
    /// `cntent.dat` plus every section file, in manifest order.
    pub files: Vec<MsFirmEntry>,
}

/// Splits the manifest's INI-ish text into an ordered list of
/// `[section]` blocks, each a `key -> value` map. Unlike a strict INI
/// parser this tolerates trailing garbage (zero padding out to the fixed
/// 0x5000-byte manifest size decodes as blank/unmatched lines and is
/// simply dropped).
fn parse_sections(text: &str) -> Vec<HashMap<String, String>> {
    let mut sections = Vec::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let _ = name;
            sections.push(HashMap::new());
        } else if let Some((key, value)) = line.split_once('=') {
            if let Some(section) = sections.last_mut() {
                section.insert(key.to_string(), value.to_string());
            }
        }
    }
    sections
}

fn parse_hex_u32(section: &HashMap<String, String>, key: &str) -> Option<u32> {
    u32::from_str_radix(section.get(key)?.trim(), 16).ok()
}

fn parse_hex_usize(section: &HashMap<String, String>, key: &str) -> Result<usize> {
    let raw = section
        .get(key)
        .ok_or_else(|| Error::Malformed(format!("msfirm manifest missing '{key}'")))?;
    usize::from_str_radix(raw.trim(), 16)
        .map_err(|_| Error::Malformed(format!("msfirm manifest field '{key}' is not hex")))
}

/// True when `data` begins with a structurally valid (but not
/// necessarily key-matching) section header: right length, zero
/// padding, and — for the given `key` — a passing header hash. Trying
/// every catalogue `_ms` key against this is how the variant is identified.
pub fn is_ms_firm(data: &[u8], key: &[u8; 64]) -> bool {
    let Some(header) = data.get(0..HEADER_SIZE) else {
        return false;
    };
    let Ok(header): std::result::Result<[u8; HEADER_SIZE], _> = header.try_into() else {
        return false;
    };
    header[20..HEADER_SIZE - 20].iter().all(|&b| b == 0) && check_header_hash(key, &header)
}

/// Trial-decrypts `data` across the catalogue's `_ms` entries, parses the
/// manifest, verifies its checksum and file count, and decrypts every
/// section it names.
pub fn read_ms_firm(data: &[u8], keys: &dyn KeyProvider) -> Result<(CrypterId, MsFirmRecord)> {
    for id in [CrypterId::CXD4105_ms, CrypterId::CXD4108_ms] {
        let key = keys.ms_firm_key(id)?;
        if !is_ms_firm(data, &key) {
            continue;
        }
        return Ok((id, parse_with_key(data, &key)?));
    }
    Err(Error::WrongMagic(
        "no catalogue _ms key matched this input".to_string(),
    ))
}

fn parse_with_key(data: &[u8], key: &[u8; 64]) -> Result<MsFirmRecord> {
    let manifest = decrypt_section(data, 0, MANIFEST_SIZE, key)?;
    let text = String::from_utf8_lossy(&manifest);
    let sections = parse_sections(&text);
    if sections.len() < 3 {
        return Err(Error::Malformed(
            "msfirm manifest has fewer than 3 sections".to_string(),
        ));
    }

    let checksum = parse_hex_u32(&sections[1], "chksum")
        .ok_or_else(|| Error::Malformed("msfirm manifest missing 'chksum'".to_string()))?;
    let total = parse_hex_usize(&sections[2], "total_num")?;

    if checksum32_bytesum(&manifest[0x40..]) != checksum {
        return Err(Error::WrongChecksum("msfirm manifest checksum".to_string()));
    }
    if sections.len() - 3 != total {
        return Err(Error::Malformed(format!(
            "msfirm manifest declares {total} files, found {}",
            sections.len() - 3
        )));
    }

    let model = parse_hex_u32(&sections[0], "model");
    let region = parse_hex_u32(&sections[0], "region");
    let version = sections[0].get("version").cloned();

    let mut files = vec![MsFirmEntry {
        name: "cntent.dat".to_string(),
        data: manifest,
    }];
    for (i, entry) in sections[3..].iter().enumerate() {
        let name = entry
            .get("name")
            .ok_or_else(|| Error::Malformed("msfirm file entry missing 'name'".to_string()))?
            .clone();
        let offset = parse_hex_usize(entry, "offset")?;
        let size = parse_hex_usize(entry, "size")?;
        let section_offset = offset + (i + 1) * HEADER_SIZE;
        let body = decrypt_section(data, section_offset, size, key)?;
        files.push(MsFirmEntry { name, data: body });
    }

    Ok(MsFirmRecord {
        model,
        region,
        version,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(key: &[u8; 64], body: &[u8]) -> [u8; HEADER_SIZE] {
        let data_hash = calc_hash(key, body);
        let mut header = [0u8; HEADER_SIZE];
        header[0..20].copy_from_slice(&data_hash);
        let zeroed = header;
        let header_hash = calc_hash(key, &zeroed);
        header[HEADER_SIZE - 20..].copy_from_slice(&header_hash);
        header
    }

    fn encrypt_body(key: &[u8; 64], plain: &[u8]) -> Vec<u8> {
        let mut digest: [u8; 20] = key[0..20].try_into().unwrap();
        let tail: [u8; 20] = key[20..40].try_into().unwrap();
        let keystream = crate::cipher::sha::rolling_keystream(&mut digest, &tail, plain.len());
        plain.iter().zip(keystream.iter()).map(|(a, b)| a ^ b).collect()
    }

    fn build_section(key: &[u8; 64], plain: &[u8]) -> Vec<u8> {
        let body = encrypt_body(key, plain);
        let header = header_for(key, &body);
        let mut out = header.to_vec();
        out.extend(body);
        out
    }

    fn manifest_text(checksum: u32, n_files: usize) -> Vec<u8> {
        let mut text = String::new();
        text.push_str("[header]\nmodel=00a01234\nregion=00000001\nversion=4.01\n");
        text.push_str(&format!("[checksum]\nchksum={checksum:08x}\n"));
        text.push_str(&format!("[program data]\ntotal_num={n_files:08x}\n"));
        text.push_str("[file0]\nname=body.bin\noffset=00000000\nsize=00000005\n");
        let mut bytes = text.into_bytes();
        bytes.resize(MANIFEST_SIZE, 0);
        bytes
    }

    #[test]
    fn round_trips_a_single_file_container() {
        let key = [0x77u8; 64];
        let body_plain = b"hello".to_vec();

        // checksum covers manifest[0x40..] of the *plaintext* manifest.
        let mut manifest = manifest_text(0, 1);
        let checksum = checksum32_bytesum(&manifest[0x40..]);
        manifest = manifest_text(checksum, 1);
        assert_eq!(checksum32_bytesum(&manifest[0x40..]), checksum);

        let manifest_section = build_section(&key, &manifest);
        let body_section = build_section(&key, &body_plain);

        let mut data = manifest_section;
        data.extend(body_section);

        let record = parse_with_key(&data, &key).unwrap();
        assert_eq!(record.model, Some(0x00a0_1234));
        assert_eq!(record.version.as_deref(), Some("4.01"));
        assert_eq!(record.files.len(), 2);
        assert_eq!(record.files[0].name, "cntent.dat");
        assert_eq!(record.files[1].name, "body.bin");
        assert_eq!(record.files[1].data, body_plain);
    }

    #[test]
    fn tampered_data_hash_is_a_checksum_error() {
        let key = [0x11u8; 64];
        let mut section = build_section(&key, b"abcde");
        let last = section.len() - 1;
        section[last] ^= 0xff;
        let err = decrypt_section(&section, 0, 5, &key).unwrap_err();
        assert!(matches!(err, Error::WrongChecksum(_)));
    }
}
