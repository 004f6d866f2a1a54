//! The outer `.dat` container: CRC-sealed, big-endian TLV chunks wrapping
//! USB descriptor tables and an opaque `FDAT` payload. Grounded on
//! `fwtool/sony/dat.py`.

use crate::error::{Error, Result};
use crate::primitive::crc32;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// `89 55 46 55 0D 0A 1A 0A` — the fixed 8-byte file signature.
pub const MAGIC: [u8; 8] = [0x89, 0x55, 0x46, 0x55, 0x0d, 0x0a, 0x1a, 0x0a];

/// One `{pid, vid}` USB descriptor entry from the `UDID` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDescriptor {
    /// USB product ID.
    pub pid: u16,
    /// USB vendor ID.
    pub vid: u16,
}

/// The parsed contents of a `.dat` container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatRecord {
    /// True when `DATV`'s `isLens` field is set.
    pub is_lens: bool,
    /// `UDID` descriptors with `mode == 1` (normal boot).
    pub normal_usb_descriptors: Vec<UsbDescriptor>,
    /// `UDID` descriptors with `mode == 2` (updater mode).
    pub updater_usb_descriptors: Vec<UsbDescriptor>,
    /// The opaque, still-encrypted `FDAT` chunk payload.
    pub firmware_data: Vec<u8>,
}

/// Sniffs the 8-byte magic without interpreting anything past it. Leaves
/// the cursor wherever the read left it; callers reseek before `read_dat`.
pub fn is_dat<R: Read>(source: &mut R) -> bool {
    let mut magic = [0u8; 8];
    source.read_exact(&mut magic).is_ok() && magic == MAGIC
}

fn read_chunk_header<R: Read>(source: &mut R) -> Result<(u32, [u8; 4])> {
    let size = source
        .read_u32::<BigEndian>()
        .map_err(|_| Error::Truncated("dat chunk header".to_string()))?;
    let mut ty = [0u8; 4];
    source
        .read_exact(&mut ty)
        .map_err(|_| Error::Truncated("dat chunk header".to_string()))?;
    Ok((size, ty))
}

/// Parses chunks in file order until `DEND`, verifying the trailing CRC
/// and the `DATV`/`PROV` version fields. Fails on a missing `FDAT` or
/// `DEND` chunk, on a version mismatch, or on a CRC mismatch.
pub fn read_dat<R: Read>(source: &mut R) -> Result<DatRecord> {
    let mut magic = [0u8; 8];
    source
        .read_exact(&mut magic)
        .map_err(|_| Error::Truncated("dat header".to_string()))?;
    if magic != MAGIC {
        return Err(Error::WrongMagic("dat magic".to_string()));
    }

    // Everything read so far (the header) plus every chunk before DEND
    // folds into the trailing CRC; track it by re-serialising what we
    // parse rather than re-reading the source (which may not be
    // seekable back to 0 once consumed).
    let mut crc_input = magic.to_vec();

    let mut is_lens = false;
    let mut saw_datv = false;
    let mut saw_prov = false;
    let mut normal_usb_descriptors = Vec::new();
    let mut updater_usb_descriptors = Vec::new();
    let mut firmware_data = None;

    loop {
        let (size, ty) = read_chunk_header(source)?;

        if &ty == b"DEND" {
            if size != 4 {
                return Err(Error::Malformed(format!(
                    "DEND payload must be 4 bytes, got {size}"
                )));
            }
            let expected = source
                .read_u32::<BigEndian>()
                .map_err(|_| Error::Truncated("DEND crc".to_string()))?;
            let actual = crc32(&crc_input);
            if actual != expected {
                return Err(Error::WrongChecksum(format!(
                    "dat trailer crc: expected {expected:#010x}, computed {actual:#010x}"
                )));
            }
            break;
        }

        let mut payload = vec![0u8; size as usize];
        source
            .read_exact(&mut payload)
            .map_err(|_| Error::Truncated(format!("dat chunk {ty:?} payload")))?;

        crc_input.extend_from_slice(&size.to_be_bytes());
        crc_input.extend_from_slice(&ty);
        crc_input.extend_from_slice(&payload);

        match &ty {
            b"DATV" => {
                if payload.len() != 4 {
                    return Err(Error::Malformed("DATV chunk must be 4 bytes".to_string()));
                }
                let data_version = u16::from_be_bytes([payload[0], payload[1]]);
                if data_version != 0x0100 {
                    return Err(Error::WrongVersion(format!(
                        "dataVersion {data_version:#06x}"
                    )));
                }
                is_lens = u16::from_be_bytes([payload[2], payload[3]]) != 0;
                saw_datv = true;
            },
            b"PROV" => {
                if payload.len() != 4 {
                    return Err(Error::Malformed("PROV chunk must be 4 bytes".to_string()));
                }
                let protocol_version = u16::from_be_bytes([payload[0], payload[1]]);
                if protocol_version != 0x0100 {
                    return Err(Error::WrongVersion(format!(
                        "protocolVersion {protocol_version:#06x}"
                    )));
                }
                saw_prov = true;
            },
            b"UDID" => {
                if payload.len() < 4 {
                    return Err(Error::Truncated("UDID count".to_string()));
                }
                let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let mut cursor = &payload[4..];
                for _ in 0..count {
                    if cursor.len() < 8 {
                        return Err(Error::Truncated("UDID descriptor".to_string()));
                    }
                    let pid = cursor.read_u16::<BigEndian>()?;
                    let vid = cursor.read_u16::<BigEndian>()?;
                    let mode = cursor.read_u8()?;
                    let mut reserved = [0u8; 3];
                    cursor.read_exact(&mut reserved)?;
                    let desc = UsbDescriptor { pid, vid };
                    match mode {
                        1 => normal_usb_descriptors.push(desc),
                        2 => updater_usb_descriptors.push(desc),
                        other => {
                            return Err(Error::Malformed(format!(
                                "UDID descriptor mode {other}"
                            )));
                        },
                    }
                }
            },
            b"FDAT" => firmware_data = Some(payload),
            other => {
                log::debug!("dat: skipping unrecognised chunk type {other:?}");
            },
        }
    }

    if !saw_datv {
        return Err(Error::Malformed("missing DATV chunk".to_string()));
    }
    if !saw_prov {
        return Err(Error::Malformed("missing PROV chunk".to_string()));
    }
    let firmware_data =
        firmware_data.ok_or_else(|| Error::Malformed("missing FDAT chunk".to_string()))?;

    Ok(DatRecord {
        is_lens,
        normal_usb_descriptors,
        updater_usb_descriptors,
        firmware_data,
    })
}

fn write_chunk(out: &mut Vec<u8>, ty: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(ty);
    out.extend_from_slice(payload);
}

/// Emits chunks in the fixed order `DATV, PROV, UDID, FDAT, DEND`, then
/// computes and patches the trailing CRC.
pub fn write_dat<W: Write>(record: &DatRecord, sink: &mut W) -> Result<()> {
    let mut out = MAGIC.to_vec();

    let mut datv = Vec::with_capacity(4);
    datv.write_u16::<BigEndian>(0x0100)?;
    datv.write_u16::<BigEndian>(u16::from(record.is_lens))?;
    write_chunk(&mut out, b"DATV", &datv);

    let mut prov = Vec::with_capacity(4);
    prov.write_u16::<BigEndian>(0x0100)?;
    prov.write_u16::<BigEndian>(0)?;
    write_chunk(&mut out, b"PROV", &prov);

    let total_descriptors =
        record.normal_usb_descriptors.len() + record.updater_usb_descriptors.len();
    let mut udid = Vec::with_capacity(4 + total_descriptors * 8);
    udid.write_u32::<BigEndian>(total_descriptors as u32)?;
    for desc in &record.normal_usb_descriptors {
        udid.write_u16::<BigEndian>(desc.pid)?;
        udid.write_u16::<BigEndian>(desc.vid)?;
        udid.write_u8(1)?;
        udid.extend_from_slice(&[0u8; 3]);
    }
    for desc in &record.updater_usb_descriptors {
        udid.write_u16::<BigEndian>(desc.pid)?;
        udid.write_u16::<BigEndian>(desc.vid)?;
        udid.write_u8(2)?;
        udid.extend_from_slice(&[0u8; 3]);
    }
    write_chunk(&mut out, b"UDID", &udid);

    write_chunk(&mut out, b"FDAT", &record.firmware_data);

    let crc = crc32(&out);
    write_chunk(&mut out, b"DEND", &crc.to_be_bytes());

    sink.write_all(&out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> DatRecord {
        DatRecord {
            is_lens: false,
            normal_usb_descriptors: vec![UsbDescriptor {
                pid: 0x1234,
                vid: 0x054c,
            }],
            updater_usb_descriptors: vec![UsbDescriptor {
                pid: 0x5678,
                vid: 0x054c,
            }],
            firmware_data: b"opaque fdat bytes".to_vec(),
        }
    }

    #[test]
    fn round_trips() {
        let record = sample();
        let mut buf = Vec::new();
        write_dat(&record, &mut buf).unwrap();

        assert!(is_dat(&mut Cursor::new(&buf)));

        let parsed = read_dat(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn wrong_crc_is_rejected() {
        let record = sample();
        let mut buf = Vec::new();
        write_dat(&record, &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let err = read_dat(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::WrongChecksum(_)));
    }

    #[test]
    fn missing_fdat_chunk_is_malformed() {
        let mut out = MAGIC.to_vec();
        let mut datv = Vec::new();
        datv.write_u16::<BigEndian>(0x0100).unwrap();
        datv.write_u16::<BigEndian>(0).unwrap();
        write_chunk(&mut out, b"DATV", &datv);
        let mut prov = Vec::new();
        prov.write_u16::<BigEndian>(0x0100).unwrap();
        prov.write_u16::<BigEndian>(0).unwrap();
        write_chunk(&mut out, b"PROV", &prov);
        let crc = crc32(&out);
        write_chunk(&mut out, b"DEND", &crc.to_be_bytes());

        let err = read_dat(&mut Cursor::new(&out)).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
