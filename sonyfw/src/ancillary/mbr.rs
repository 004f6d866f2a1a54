//! MBR partition tables: the generic x86 disk layout some bodies reuse to
//! carry the bootloader, kernel, and filesystem partitions. Grounded on
//! `fwtool/mbr/__init__.py`.

use crate::error::{Error, Result};
use crate::io::{FilePart, SharedSource};
use crate::structio::wire_struct;
use std::io::{Read, Seek, SeekFrom, Write};

/// Sector size every offset and length in the partition table is counted in.
pub const SECTOR_SIZE: u64 = 0x200;

wire_struct! {
    le struct MbrHeader {
        _bootstrap: [u8; 0x1be],
        partitions: [u8; 0x40],
        magic: [u8; 2],
    }
}

wire_struct! {
    le struct MbrPartitionEntry {
        status: u8,
        _chs_start: [u8; 3],
        kind: u8,
        _chs_end: [u8; 3],
        start: u32,
        size: u32,
    }
}

const MAGIC: [u8; 2] = [0x55, 0xaa];

/// One populated MBR partition entry.
pub struct MbrPartition<R> {
    /// 1-based slot index (1..=4).
    pub index: u32,
    /// Partition type byte.
    pub kind: u8,
    /// Lazy view of the partition's bytes.
    pub contents: FilePart<SharedSource<R>>,
}

/// Sniffs the `0x55 0xaa` boot signature at the end of the first sector.
pub fn is_mbr<R: Read>(source: &mut R) -> bool {
    MbrHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC)
}

/// Reads the (up to four) populated partitions of an MBR, skipping
/// entries whose type byte is zero.
pub fn read_mbr<R: Read + Seek + 'static>(source: R) -> Result<Vec<MbrPartition<R>>> {
    let shared = SharedSource::new(source);
    let mut cursor = shared.clone();
    let header = MbrHeader::read_from(&mut cursor)?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("mbr header".to_string()));
    }

    let mut out = Vec::new();
    for i in 0..4usize {
        let raw = &header.partitions[i * MbrPartitionEntry::SIZE..(i + 1) * MbrPartitionEntry::SIZE];
        let entry = MbrPartitionEntry::from_bytes(raw)
            .ok_or_else(|| Error::Malformed("mbr partition entry".to_string()))?;
        if entry.kind == 0 {
            continue;
        }
        out.push(MbrPartition {
            index: i as u32 + 1,
            kind: entry.kind,
            contents: FilePart::new(
                shared.clone(),
                u64::from(entry.start) * SECTOR_SIZE,
                u64::from(entry.size) * SECTOR_SIZE,
            ),
        });
    }
    Ok(out)
}

/// Writes an MBR with up to four partitions, padding each to a sector
/// boundary. `None` slots are left empty (zero size, type 0).
pub fn write_mbr<W: Write + Seek>(partitions: &[Option<(u8, Vec<u8>)>], out: &mut W) -> Result<()> {
    out.write_all(&[0u8; MbrHeader::SIZE])?;
    let padding = SECTOR_SIZE - MbrHeader::SIZE as u64;
    out.write_all(&vec![0xffu8; padding as usize])?;

    let mut entries = Vec::new();
    for slot in partitions.iter().take(4) {
        let start = out.stream_position()?;
        let (kind, size) = match slot {
            Some((kind, data)) => {
                out.write_all(data)?;
                let end = out.stream_position()?;
                if end % SECTOR_SIZE != 0 {
                    let pad = SECTOR_SIZE - (end % SECTOR_SIZE);
                    out.write_all(&vec![0xffu8; pad as usize])?;
                }
                (*kind, out.stream_position()? - start)
            },
            None => (0, 0),
        };
        entries.push(MbrPartitionEntry {
            status: 0,
            _chs_start: [0; 3],
            kind,
            _chs_end: [0; 3],
            start: (start / SECTOR_SIZE) as u32,
            size: (size / SECTOR_SIZE) as u32,
        });
    }

    let mut packed_partitions = [0u8; 0x40];
    for (i, entry) in entries.iter().enumerate() {
        packed_partitions[i * MbrPartitionEntry::SIZE..(i + 1) * MbrPartitionEntry::SIZE]
            .copy_from_slice(&entry.to_bytes());
    }

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&MbrHeader {
        _bootstrap: [0; 0x1be],
        partitions: packed_partitions,
        magic: MAGIC,
    }.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; MbrHeader::SIZE];
        assert!(!is_mbr(&mut Cursor::new(data)));
    }

    #[test]
    fn round_trips_two_partitions() {
        let mut buf = Cursor::new(Vec::new());
        write_mbr(
            &[Some((1, vec![0xaa; 300])), Some((2, vec![0xbb; 100])), None, None],
            &mut buf,
        )
        .unwrap();

        let data = buf.into_inner();
        assert!(is_mbr(&mut Cursor::new(data.clone())));
        let partitions = read_mbr(Cursor::new(data)).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].index, 1);
        assert_eq!(partitions[0].kind, 1);

        let mut bytes = Vec::new();
        let mut p = partitions.into_iter().next().unwrap();
        p.contents.read_to_end(&mut bytes).unwrap();
        assert_eq!(&bytes[..300], &vec![0xaa; 300][..]);
    }
}
