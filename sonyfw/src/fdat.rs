//! The inner `FDAT` firmware container: a fixed 512-byte header locating
//! an embedded filesystem image and a tar-archived on-device firmware
//! blob. Grounded on `fwtool/sony/fdat.py`'s `FdatFile`.

use crate::error::{Error, Result};
use crate::io::{FilePart, SharedSource};
use crate::primitive::crc32;
use std::io::{Read, Seek, SeekFrom, Write};

const HEADER_SIZE: usize = 512;
const MAGIC: &[u8; 8] = b"UDTRFIRM";
const MAX_FILESYSTEMS: usize = 28;
const DESCRIPTOR_SIZE: usize = 13;
const DESCRIPTORS_OFFSET: usize = 40;

/// One `{modeType, offset, size}` filesystem-descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsDescriptor {
    /// `'U'` for the flashable user filesystem; the writer also emits a
    /// zero-size `'P'` (prod) slot for symmetry with the original format.
    pub mode_type: u8,
    /// Byte offset of the filesystem image, relative to the start of the FDAT payload.
    pub offset: u32,
    /// Byte length of the filesystem image.
    pub size: u32,
}

struct ParsedHeader {
    version_major: u8,
    version_minor: u8,
    model: u32,
    region: u32,
    firmware_offset: u32,
    firmware_size: u32,
    descriptors: Vec<FsDescriptor>,
}

fn descriptor_at(data: &[u8], index: usize) -> FsDescriptor {
    let base = DESCRIPTORS_OFFSET + index * DESCRIPTOR_SIZE;
    FsDescriptor {
        mode_type: data[base],
        offset: u32::from_be_bytes([
            data[base + 1],
            data[base + 2],
            data[base + 3],
            data[base + 4],
        ]),
        size: u32::from_be_bytes([
            data[base + 5],
            data[base + 6],
            data[base + 7],
            data[base + 8],
        ]),
    }
}

fn parse_header(data: &[u8; HEADER_SIZE]) -> Result<ParsedHeader> {
    if &data[0..8] != MAGIC {
        return Err(Error::WrongMagic("fdat magic".to_string()));
    }
    let expected_crc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let actual_crc = crc32(&data[12..HEADER_SIZE]);
    if actual_crc != expected_crc {
        return Err(Error::WrongChecksum(format!(
            "fdat header crc: expected {expected_crc:#010x}, computed {actual_crc:#010x}"
        )));
    }
    if &data[12..16] != b"0100" {
        return Err(Error::WrongVersion("fdat format version".to_string()));
    }
    let mode_type = data[16];
    let luw_flag = data[17];
    if mode_type != b'U' {
        return Err(Error::Unsupported(format!(
            "fdat modeType {mode_type:#04x}, only 'U' is supported"
        )));
    }
    if luw_flag != b'N' {
        return Err(Error::Unsupported(format!(
            "fdat luwFlag {luw_flag:#04x}, only 'N' is supported"
        )));
    }
    let version_minor = data[18];
    let version_major = data[19];
    let model = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    let region = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);
    let firmware_offset = u32::from_be_bytes([data[28], data[29], data[30], data[31]]);
    let firmware_size = u32::from_be_bytes([data[32], data[33], data[34], data[35]]);
    let num_filesystems = u32::from_be_bytes([data[36], data[37], data[38], data[39]]) as usize;
    if num_filesystems > MAX_FILESYSTEMS {
        return Err(Error::Malformed(format!(
            "numFileSystems {num_filesystems} exceeds the {MAX_FILESYSTEMS}-slot table"
        )));
    }

    for i in num_filesystems..MAX_FILESYSTEMS {
        let d = descriptor_at(data, i);
        if d.mode_type != 0 || d.offset != 0 || d.size != 0 {
            return Err(Error::Malformed(format!(
                "filesystem descriptor {i} is populated past numFileSystems"
            )));
        }
    }
    let descriptors = (0..num_filesystems).map(|i| descriptor_at(data, i)).collect();

    Ok(ParsedHeader {
        version_major,
        version_minor,
        model,
        region,
        firmware_offset,
        firmware_size,
        descriptors,
    })
}

/// Derives the accessory flag from a model id: `model & 0xFF0000 == 0xA00000`.
#[must_use]
pub fn is_accessory(model: u32) -> bool {
    model & 0xFF_0000 == 0xA0_0000
}

/// Sniffs the header magic and the filesystem-descriptor zero-tail
/// invariant — enough to disambiguate a correctly-decrypted stream from
/// plausible-looking noise during [`crate::cipher::catalogue::decrypt_fdat`]'s trial loop.
pub fn is_fdat(data: &[u8]) -> bool {
    let Ok(header): std::result::Result<[u8; HEADER_SIZE], _> = data
        .get(0..HEADER_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or(())
    else {
        return false;
    };
    parse_header(&header).is_ok()
}

/// A parsed `FDAT` payload: metadata plus lazy views onto the embedded
/// firmware tar and filesystem image, both backed by the same shared
/// source.
pub struct FdatFile<R> {
    /// Raw model identifier.
    pub model: u32,
    /// Region identifier.
    pub region: u32,
    /// `"{major:x}.{minor:02x}"` formatted firmware version.
    pub version: String,
    /// Derived from `model`.
    pub is_accessory: bool,
    /// The embedded on-device firmware archive (a tar stream).
    pub firmware: FilePart<SharedSource<R>>,
    /// The embedded flashable filesystem image (cramfs or FAT).
    pub fs: FilePart<SharedSource<R>>,
}

/// Parses an `FDAT` payload from `source` (already decrypted — this
/// module never touches the block-cipher envelope).
pub fn read_fdat<R: Read + Seek>(source: R) -> Result<FdatFile<R>> {
    let shared = SharedSource::new(source);
    let mut probe = shared.clone();
    probe.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_SIZE];
    probe
        .read_exact(&mut header)
        .map_err(|_| Error::Truncated("fdat header".to_string()))?;
    let parsed = parse_header(&header)?;

    let fs_descriptor = parsed
        .descriptors
        .iter()
        .find(|d| d.mode_type == b'U')
        .ok_or_else(|| Error::Malformed("no 'U' filesystem descriptor".to_string()))?;

    let firmware = FilePart::new(
        shared.clone(),
        u64::from(parsed.firmware_offset),
        u64::from(parsed.firmware_size),
    );
    let fs = FilePart::new(
        shared,
        u64::from(fs_descriptor.offset),
        u64::from(fs_descriptor.size),
    );

    Ok(FdatFile {
        model: parsed.model,
        region: parsed.region,
        version: format!("{:x}.{:02x}", parsed.version_major, parsed.version_minor),
        is_accessory: is_accessory(parsed.model),
        firmware,
        fs,
    })
}

/// The metadata half of an `FDAT` payload the writer needs; the firmware
/// and filesystem contents are supplied separately as byte sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdatFields {
    /// Raw model identifier.
    pub model: u32,
    /// Region identifier.
    pub region: u32,
    /// Displayed as the high nibble of the firmware version.
    pub version_major: u8,
    /// Displayed as the low (two-digit) nibble of the firmware version.
    pub version_minor: u8,
}

/// Assembles `[header][fs][firmware]`, computing and patching the header
/// CRC over `[12, 512)` last. Emits exactly two filesystem descriptors: a
/// populated `'U'` (user) slot and a zero-size `'P'` (prod) slot, the
/// same pair the original writer always produces.
pub fn write_fdat<W: Write>(
    fields: &FdatFields,
    fs: &mut impl Read,
    firmware: &mut impl Read,
    sink: &mut W,
) -> Result<()> {
    let mut fs_bytes = Vec::new();
    fs.read_to_end(&mut fs_bytes)?;
    let mut firmware_bytes = Vec::new();
    firmware.read_to_end(&mut firmware_bytes)?;

    let fs_offset = HEADER_SIZE as u32;
    let fs_size = fs_bytes.len() as u32;
    let firmware_offset = fs_offset + fs_size;
    let firmware_size = firmware_bytes.len() as u32;

    let mut header = vec![0u8; HEADER_SIZE];
    header[0..8].copy_from_slice(MAGIC);
    // header[8..12] (crc) is patched once the rest of the header is filled.
    header[12..16].copy_from_slice(b"0100");
    header[16] = b'U';
    header[17] = b'N';
    header[18] = fields.version_minor;
    header[19] = fields.version_major;
    header[20..24].copy_from_slice(&fields.model.to_be_bytes());
    header[24..28].copy_from_slice(&fields.region.to_be_bytes());
    header[28..32].copy_from_slice(&firmware_offset.to_be_bytes());
    header[32..36].copy_from_slice(&firmware_size.to_be_bytes());
    header[36..40].copy_from_slice(&2u32.to_be_bytes());

    let user = FsDescriptor {
        mode_type: b'U',
        offset: fs_offset,
        size: fs_size,
    };
    let prod = FsDescriptor {
        mode_type: b'P',
        offset: 0,
        size: 0,
    };
    for (i, desc) in [user, prod].into_iter().enumerate() {
        let base = DESCRIPTORS_OFFSET + i * DESCRIPTOR_SIZE;
        header[base] = desc.mode_type;
        header[base + 1..base + 5].copy_from_slice(&desc.offset.to_be_bytes());
        header[base + 5..base + 9].copy_from_slice(&desc.size.to_be_bytes());
    }

    let crc = crc32(&header[12..HEADER_SIZE]);
    header[8..12].copy_from_slice(&crc.to_be_bytes());

    sink.write_all(&header)?;
    sink.write_all(&fs_bytes)?;
    sink.write_all(&firmware_bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_and_reports_accessory_model() {
        let fields = FdatFields {
            model: 0x00A0_1234,
            region: 1,
            version_major: 4,
            version_minor: 1,
        };
        let mut out = Vec::new();
        write_fdat(
            &fields,
            &mut Cursor::new(b"".to_vec()),
            &mut Cursor::new(vec![0x42u8]),
            &mut out,
        )
        .unwrap();

        assert!(is_fdat(&out));
        let parsed = read_fdat(Cursor::new(out)).unwrap();
        assert_eq!(parsed.model, 0x00A0_1234);
        assert_eq!(parsed.region, 1);
        assert_eq!(parsed.version, "4.01");
        assert!(parsed.is_accessory);

        let mut firmware = parsed.firmware;
        let mut bytes = Vec::new();
        firmware.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![0x42]);
    }

    #[test]
    fn non_u_mode_type_is_unsupported() {
        let fields = FdatFields {
            model: 1,
            region: 1,
            version_major: 1,
            version_minor: 0,
        };
        let mut out = Vec::new();
        write_fdat(
            &fields,
            &mut Cursor::new(Vec::new()),
            &mut Cursor::new(Vec::new()),
            &mut out,
        )
        .unwrap();
        out[16] = b'X';
        let crc = crc32(&out[12..HEADER_SIZE]);
        out[8..12].copy_from_slice(&crc.to_be_bytes());

        let err = read_fdat(Cursor::new(out)).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn accessory_flag_matches_model_mask() {
        assert!(is_accessory(0x00A0_1234));
        assert!(!is_accessory(0x0010_1234));
    }
}
