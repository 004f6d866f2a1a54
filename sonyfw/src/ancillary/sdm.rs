//! The SDM partition table: a simpler, Sony-specific alternative to MBR
//! used on some flash layouts. Grounded on `fwtool/sony/flash.py`.
//!
//! The original reader never checks a magic or version, just skips the
//! leading 8 bytes; this one validates both, since the header field names
//! and values are well known and a silent success on garbage input would
//! only hide bugs.

use crate::error::{Error, Result};
use crate::io::{FilePart, SharedSource};
use crate::structio::wire_struct;
use std::io::{Read, Seek, Write};

wire_struct! {
    le struct SdmHeader {
        magic: [u8; 4],
        version: [u8; 4],
        num_partitions: u32,
        _reserved: [u8; 20],
    }
}

wire_struct! {
    le struct SdmPartitionEntry {
        start: u32,
        size: u32,
        kind: u32,
        flag: u32,
    }
}

const MAGIC: [u8; 4] = *b"8246";
const VERSION: [u8; 4] = *b"1.00";

/// A partition is selected if either the writer's `flag & 1` convention or
/// the reader's `type != 0` convention marks it present: the two sources
/// this format was reconstructed from disagree on which field carries the
/// "in use" bit, so both are honoured.
fn is_populated(entry: &SdmPartitionEntry) -> bool {
    entry.kind != 0 || entry.flag & 1 != 0
}

/// Sniffs the `"8246"` magic and `"1.00"` version.
pub fn is_sdm<R: Read>(source: &mut R) -> bool {
    SdmHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC && h.version == VERSION)
}

/// One populated SDM partition entry.
pub struct SdmPartition<R> {
    /// 1-based slot index.
    pub index: u32,
    /// Partition type.
    pub kind: u32,
    /// Lazy view of the partition's bytes.
    pub contents: FilePart<SharedSource<R>>,
}

/// Reads every populated partition out of an SDM table.
pub fn read_partitions<R: Read + Seek + 'static>(source: R) -> Result<Vec<SdmPartition<R>>> {
    let shared = SharedSource::new(source);
    let mut cursor = shared.clone();
    let header = SdmHeader::read_from(&mut cursor)?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("sdm header".to_string()));
    }
    if header.version != VERSION {
        return Err(Error::WrongVersion(
            String::from_utf8_lossy(&header.version).into_owned(),
        ));
    }

    let mut out = Vec::new();
    for i in 0..header.num_partitions {
        let entry = SdmPartitionEntry::read_from(&mut cursor)?;
        if is_populated(&entry) {
            out.push(SdmPartition {
                index: i + 1,
                kind: entry.kind,
                contents: FilePart::new(shared.clone(), u64::from(entry.start), u64::from(entry.size)),
            });
        }
    }
    Ok(out)
}

/// Writes an SDM table for the given partitions. Sets both `type=1` and
/// `flag=0xFFFFFFFF` on every populated slot, matching the convention the
/// original writer used (`writePartitions` left `type=1, flag=0xFFFFFFFF`).
pub fn write_partitions<W: Write>(partitions: &[Vec<u8>], out: &mut W) -> Result<()> {
    out.write_all(&SdmHeader {
        magic: MAGIC,
        version: VERSION,
        num_partitions: partitions.len() as u32,
        _reserved: [0; 20],
    }.to_bytes())?;

    let mut offset = (SdmHeader::SIZE + partitions.len() * SdmPartitionEntry::SIZE) as u32;
    for data in partitions {
        out.write_all(&SdmPartitionEntry {
            start: offset,
            size: data.len() as u32,
            kind: 1,
            flag: 0xFFFF_FFFF,
        }.to_bytes())?;
        offset += data.len() as u32;
    }
    for data in partitions {
        out.write_all(data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; SdmHeader::SIZE];
        assert!(!is_sdm(&mut Cursor::new(data)));
    }

    #[test]
    fn round_trips_two_partitions() {
        let mut buf = Cursor::new(Vec::new());
        write_partitions(&[b"hello".to_vec(), b"world!".to_vec()], &mut buf).unwrap();
        let data = buf.into_inner();

        assert!(is_sdm(&mut Cursor::new(data.clone())));
        let partitions = read_partitions(Cursor::new(data)).unwrap();
        assert_eq!(partitions.len(), 2);

        let mut bytes = Vec::new();
        let mut p = partitions.into_iter().next().unwrap();
        p.contents.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn selects_on_either_type_or_flag() {
        let selected_by_type = SdmPartitionEntry { start: 0, size: 1, kind: 1, flag: 0 };
        let selected_by_flag = SdmPartitionEntry { start: 0, size: 1, kind: 0, flag: 1 };
        let unselected = SdmPartitionEntry { start: 0, size: 1, kind: 0, flag: 0 };
        assert!(is_populated(&selected_by_type));
        assert!(is_populated(&selected_by_flag));
        assert!(!is_populated(&unselected));
    }
}
