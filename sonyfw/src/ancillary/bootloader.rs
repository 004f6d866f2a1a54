//! Bootloader partition readers: a flat array of fixed-size page-addressed
//! file records following one of two header flavours (`EXBL`, a single
//! plane, or `INFO`, a multi-plane/die NAND layout). Grounded on
//! `fwtool/sony/bootloader.py`.

use crate::error::{Error, Result};
use crate::io::{FilePart, SharedSource};
use crate::structio::wire_struct;
use std::io::{Read, Seek, SeekFrom};

wire_struct! {
    le struct BootHeader {
        magic: [u8; 4],
        _reserved1: [u8; 4],
        page_size: u32,
        _reserved2: [u8; 4],
        page_size_alt: u32,
        _reserved3: [u8; 44],
    }
}

wire_struct! {
    le struct BootFileHeader1 {
        page: u32,
        n_page: u32,
        checksum: u32,
        version: u32,
        loadaddr: u32,
        _reserved: [u8; 4],
        name: [u8; 40],
    }
}

wire_struct! {
    le struct BootFileHeader2 {
        die: u32,
        plane: u32,
        block: u32,
        page: u32,
        n_page: u32,
        _reserved1: [u8; 4],
        checksum: u32,
        version: u32,
        loadaddr: u32,
        _reserved2: [u8; 4],
        name: [u8; 24],
    }
}

const MAGIC_EXBL: [u8; 4] = *b"EXBL";
const MAGIC_INFO: [u8; 4] = *b"INFO";

/// Sniffs either of the two bootloader header magics.
pub fn is_bootloader<R: Read>(source: &mut R) -> bool {
    BootHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC_EXBL || h.magic == MAGIC_INFO)
}

/// One file staged in a bootloader partition.
pub struct BootFile<R> {
    /// File name, trimmed of its `\0`/`\xff` padding.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// BCD-formatted `major.minor.patch` version, or `None` if zero.
    pub version: Option<String>,
    /// Load address for this file's contents.
    pub loadaddr: u32,
    /// Lazy view of the file's bytes.
    pub contents: FilePart<SharedSource<R>>,
}

fn format_version(raw: u32) -> Option<String> {
    if raw == 0 {
        return None;
    }
    Some(format!(
        "{}.{:02}.{:02}",
        (raw >> 24) & 0xff,
        (raw >> 16) & 0xff,
        (raw >> 8) & 0xff
    ))
}

fn clean_name(raw: &[u8]) -> String {
    let trimmed = raw
        .iter()
        .rposition(|&b| b != 0 && b != 0xff)
        .map_or(&raw[..0], |end| &raw[..=end]);
    String::from_utf8_lossy(trimmed).into_owned()
}

struct Entry {
    page: u32,
    n_page: u32,
    version: u32,
    loadaddr: u32,
    name: String,
}

/// Reads every named file record out of a bootloader partition.
pub fn read_bootloader<R: Read + Seek + 'static>(source: R) -> Result<Vec<BootFile<R>>> {
    let shared = SharedSource::new(source);
    let mut cursor = shared.clone();
    let header = BootHeader::read_from(&mut cursor)?;

    let page_size = if header.page_size == 0xFFFF_FFFF {
        header.page_size_alt
    } else {
        header.page_size
    };

    let entry_size = if header.magic == MAGIC_EXBL {
        BootFileHeader1::SIZE
    } else if header.magic == MAGIC_INFO {
        BootFileHeader2::SIZE
    } else {
        return Err(Error::WrongMagic("bootloader header".to_string()));
    };

    let mut out = Vec::new();
    let mut offset = BootHeader::SIZE as u64;
    while offset < u64::from(page_size) {
        cursor.seek(SeekFrom::Start(offset))?;
        let entry = if header.magic == MAGIC_EXBL {
            let h = BootFileHeader1::read_from(&mut cursor)?;
            Entry { page: h.page, n_page: h.n_page, version: h.version, loadaddr: h.loadaddr, name: clean_name(&h.name) }
        } else {
            let h = BootFileHeader2::read_from(&mut cursor)?;
            Entry { page: h.page, n_page: h.n_page, version: h.version, loadaddr: h.loadaddr, name: clean_name(&h.name) }
        };

        if !entry.name.is_empty() {
            let size = u64::from(entry.n_page) * u64::from(page_size);
            out.push(BootFile {
                name: entry.name,
                size,
                version: format_version(entry.version),
                loadaddr: entry.loadaddr,
                contents: FilePart::new(shared.clone(), u64::from(entry.page) * u64::from(page_size), size),
            });
        }
        offset += entry_size as u64;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; BootHeader::SIZE];
        assert!(!is_bootloader(&mut Cursor::new(data)));
    }

    #[test]
    fn formats_bcd_version() {
        assert_eq!(format_version(0x01_02_03_00), Some("1.02.03".to_string()));
        assert_eq!(format_version(0), None);
    }

    #[test]
    fn reads_a_single_exbl_entry() {
        let page_size = 256u32;
        let mut data = Vec::new();
        data.extend_from_slice(&BootHeader {
            magic: MAGIC_EXBL,
            _reserved1: [0; 4],
            page_size,
            _reserved2: [0; 4],
            page_size_alt: 0,
            _reserved3: [0; 44],
        }.to_bytes());

        let mut name = [0u8; 40];
        name[..9].copy_from_slice(b"BOOT.BIN\0");
        data.extend_from_slice(&BootFileHeader1 {
            page: 1,
            n_page: 1,
            checksum: 0,
            version: 0x01_00_00_00,
            loadaddr: 0x1000,
            _reserved: [0; 4],
            name,
        }.to_bytes());

        while (data.len() as u64) < u64::from(page_size) {
            data.push(0xff);
        }
        data.extend(vec![0u8; page_size as usize]);

        assert!(is_bootloader(&mut Cursor::new(data.clone())));
        let files = read_bootloader(Cursor::new(data)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "BOOT.BIN");
        assert_eq!(files[0].version, Some("1.00.00".to_string()));
        assert_eq!(files[0].size, u64::from(page_size));
    }
}
