//! DSLR-era firmware images: xor55-encrypted, with a flat table of named
//! file records following the header. Grounded on `fwtool/sony/dslr.py`.

use crate::error::{Error, Result};
use crate::io::FilePart;
use crate::structio::wire_struct;
use crate::xor55;
use std::io::{Cursor, Read, Seek, SeekFrom};

wire_struct! {
    le struct DslrFirmwareHeader {
        magic: [u8; 8],
        model: [u8; 4],
        version: [u8; 2],
        n_files: u8,
        _reserved1: [u8; 1],
        checksum: u32,
        size: u32,
        _reserved2: [u8; 8],
    }
}

wire_struct! {
    le struct DslrFileHeader {
        name: [u8; 12],
        size: u32,
        offset: u32,
        _reserved: [u8; 12],
    }
}

const MAGIC: [u8; 8] = *b"cnrjC012";
const XOR55_SEED: u32 = 0x8765_4321;

fn decrypt(data: &[u8], little: bool) -> Vec<u8> {
    xor55::crypt(XOR55_SEED, data, !little)
}

fn find_decrypter<R: Read + Seek>(source: &mut R) -> Result<Option<bool>> {
    source.seek(SeekFrom::Start(0))?;
    let mut header_bytes = vec![0u8; DslrFirmwareHeader::SIZE];
    if source.read_exact(&mut header_bytes).is_err() {
        return Ok(None);
    }
    for little in [false, true] {
        let candidate = decrypt(&header_bytes, little);
        if let Some(header) = DslrFirmwareHeader::from_bytes(&candidate) {
            if header.magic == MAGIC {
                return Ok(Some(little));
            }
        }
    }
    Ok(None)
}

/// Sniffs whether either xor55 endianness turns the header into the DSLR magic.
pub fn is_dslr_firmware<R: Read + Seek>(source: &mut R) -> bool {
    find_decrypter(source).ok().flatten().is_some()
}

/// Decrypts a DSLR firmware image into its plaintext bytes, without
/// parsing its file table.
pub fn decrypt_dslr_firmware<R: Read + Seek>(mut source: R) -> Result<Vec<u8>> {
    let little = find_decrypter(&mut source)?.ok_or_else(|| Error::WrongMagic("dslr firmware header".to_string()))?;
    source.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    source.read_to_end(&mut raw)?;
    Ok(decrypt(&raw, little))
}

/// One file staged inside a (decrypted) DSLR firmware image.
pub struct DslrFile {
    /// File name, trimmed of its `\0` padding.
    pub name: String,
    /// Lazy view of the file's bytes.
    pub contents: FilePart<Cursor<Vec<u8>>>,
}

/// A decoded DSLR firmware image.
pub struct DslrFirmwareFile {
    /// Numeric model id.
    pub model: u32,
    /// Either a literal digit-string version or a packed `major.minor` BCD pair.
    pub version: String,
    /// The staged files.
    pub files: Vec<DslrFile>,
}

/// Reads an already-decrypted DSLR firmware image (see
/// [`decrypt_dslr_firmware`]) and parses its file table.
pub fn read_dslr_firmware(data: Vec<u8>) -> Result<DslrFirmwareFile> {
    let header = DslrFirmwareHeader::from_bytes(&data[..DslrFirmwareHeader::SIZE.min(data.len())])
        .ok_or_else(|| Error::Truncated("dslr firmware header".to_string()))?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("dslr firmware header".to_string()));
    }

    let table_end = DslrFirmwareHeader::SIZE + header.n_files as usize * DslrFileHeader::SIZE;
    let payload_sum: u64 = data[table_end..].iter().map(|&b| u64::from(b)).sum();
    if (payload_sum & 0xFFFF_FFFF) as u32 != header.checksum {
        return Err(Error::WrongChecksum("dslr firmware payload".to_string()));
    }

    let version = if header.version.iter().all(u8::is_ascii_digit) {
        String::from_utf8_lossy(&header.version).into_owned()
    } else {
        let raw = u16::from_le_bytes(header.version);
        format!("{:x}.{:02x}", raw & 0xff, raw >> 8)
    };

    let model_text = std::str::from_utf8(&header.model).map_err(|_| Error::Malformed("dslr model".to_string()))?;
    let model: u32 = model_text.parse().map_err(|_| Error::Malformed(format!("dslr model {model_text:?}")))?;

    let shared = Cursor::new(data);
    let mut files = Vec::new();
    for i in 0..header.n_files as usize {
        let off = DslrFirmwareHeader::SIZE + i * DslrFileHeader::SIZE;
        let entry = DslrFileHeader::from_bytes(&shared.get_ref()[off..off + DslrFileHeader::SIZE])
            .ok_or_else(|| Error::Truncated("dslr file header".to_string()))?;
        let name = String::from_utf8_lossy(
            entry.name.split(|&b| b == 0).next().unwrap_or(&entry.name),
        )
        .into_owned();
        files.push(DslrFile {
            name,
            contents: FilePart::new(shared.clone(), u64::from(entry.offset), u64::from(entry.size)),
        });
    }

    Ok(DslrFirmwareFile { model, version, files })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_plaintext(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        let mut table = Vec::new();
        let mut offset = DslrFirmwareHeader::SIZE + files.len() * DslrFileHeader::SIZE;
        for (name, data) in files {
            let mut name_bytes = [0u8; 12];
            name_bytes[..name.len()].copy_from_slice(name.as_bytes());
            table.extend_from_slice(&DslrFileHeader {
                name: name_bytes,
                size: data.len() as u32,
                offset: offset as u32,
                _reserved: [0; 12],
            }.to_bytes());
            body.extend_from_slice(data);
            offset += data.len();
        }

        let checksum: u64 = body.iter().map(|&b| u64::from(b)).sum();
        let mut out = DslrFirmwareHeader {
            magic: MAGIC,
            model: *b"1000",
            version: *b"12",
            n_files: files.len() as u8,
            _reserved1: [0; 1],
            checksum: (checksum & 0xFFFF_FFFF) as u32,
            size: 0,
            _reserved2: [0; 8],
        }
        .to_bytes();
        out.extend_from_slice(&table);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn round_trips_through_big_endian_decrypt() {
        let plaintext = build_plaintext(&[("a.bin", b"abc"), ("b.bin", b"defgh")]);
        let encrypted = decrypt(&plaintext, false);

        assert!(is_dslr_firmware(&mut Cursor::new(encrypted.clone())));
        let decrypted = decrypt_dslr_firmware(Cursor::new(encrypted)).unwrap();
        let firmware = read_dslr_firmware(decrypted).unwrap();
        assert_eq!(firmware.model, 1000);
        assert_eq!(firmware.version, "12");
        assert_eq!(firmware.files.len(), 2);
        assert_eq!(firmware.files[0].name, "a.bin");

        let mut bytes = Vec::new();
        let mut contents = firmware.files.into_iter().next().unwrap().contents;
        contents.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn rejects_garbage() {
        let data = vec![0u8; DslrFirmwareHeader::SIZE + 8];
        assert!(!is_dslr_firmware(&mut Cursor::new(data)));
    }
}
