//! Warm-boot images: a header plus a flat array of LZ77-compressed
//! sections, each loaded to a fixed physical/virtual address on resume.
//! Grounded on `fwtool/sony/wbi.py`.

use crate::error::{Error, Result};
use crate::io::{ChunkProducer, ChunkedFile, SharedSource};
use crate::lz77;
use crate::structio::wire_struct;
use std::io::{Read, Seek, SeekFrom};

wire_struct! {
    le struct WbiHeader {
        magic: [u8; 4],
        num_sections: u32,
        flag: u32,
        resume_vector: u32,
        version: u32,
        sector_size: u32,
        data_size: u32,
        kernel_start: u32,
        kernel_size: u32,
        kernel_checksum: u32,
        o_data_size: u32,
    }
}

wire_struct! {
    le struct WbiSectionHeader {
        addr: u32,
        size: u32,
        checksum: u32,
        flag: u32,
        osize: u32,
        virt: u32,
        _pad: u32,
        meta_checksum: u32,
    }
}

const MAGIC: [u8; 4] = *b"WBI1";
const VERSION: u32 = 0x2006_0224;
const FLAG_COMPRESSED: u32 = 1;

/// Sniffs the `WBI1` magic.
pub fn is_wbi<R: Read>(source: &mut R) -> bool {
    WbiHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC)
}

/// One decompressed warm-boot section.
pub struct WbiChunk {
    /// Physical load address.
    pub physical_addr: u32,
    /// Virtual load address.
    pub virtual_addr: u32,
    /// Decompressed size.
    pub size: u32,
    /// Lazily LZ77-decompressed contents.
    pub contents: ChunkedFile<'static>,
}

/// Decodes one section's LZ77 frames off a single advancing cursor until
/// `total_size` decompressed bytes have been produced. The cursor is
/// seeked once, to the section's start offset, and never reseeked by
/// byte count afterwards: compressed and decompressed lengths differ, so
/// tracking position by decompressed output produced would desync the
/// stream from the frame boundaries `lz77::inflate` expects.
struct LzSectionChunks<R> {
    cursor: SharedSource<R>,
    total_size: u64,
    produced: u64,
    started: bool,
    start_offset: u64,
}

impl<R: Read + Seek> Iterator for LzSectionChunks<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.produced >= self.total_size {
            return None;
        }
        if !self.started {
            if let Err(e) = self.cursor.seek(SeekFrom::Start(self.start_offset)) {
                return Some(Err(e));
            }
            self.started = true;
        }
        match lz77::inflate(&mut self.cursor) {
            Ok(chunk) => {
                self.produced += chunk.len() as u64;
                Some(Ok(chunk))
            },
            Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
        }
    }
}

/// Reads every section out of a (compressed) warm-boot image. Uncompressed
/// WBI images are not supported, matching the original.
pub fn read_wbi<R: Read + Seek + 'static>(mut source: R) -> Result<Vec<WbiChunk>> {
    source.seek(SeekFrom::Start(0))?;
    let header = WbiHeader::read_from(&mut source)?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("wbi header".to_string()));
    }
    if header.version != VERSION {
        return Err(Error::WrongVersion(header.version.to_string()));
    }
    if header.flag & FLAG_COMPRESSED == 0 {
        return Err(Error::Unsupported("uncompressed wbi image".to_string()));
    }

    let shared = SharedSource::new(source);

    // Skip past the header's reserved sectors: the first sector holding
    // real data (neither all-zero nor all-0xff) marks where the
    // compressed section data begins.
    let mut data_start = u64::from(header.sector_size);
    loop {
        let mut probe = shared.clone();
        probe.seek(SeekFrom::Start(data_start))?;
        let mut sector = vec![0u8; header.sector_size as usize];
        probe.read_exact(&mut sector)?;
        if sector.iter().any(|&b| b != 0x00) && sector.iter().any(|&b| b != 0xff) {
            break;
        }
        data_start += u64::from(header.sector_size);
    }

    let mut out = Vec::new();
    let mut cumulative_offset = 0u64;
    for i in 0..header.num_sections {
        let mut header_cursor = shared.clone();
        let section_offset =
            data_start + u64::from(header.data_size) + u64::from(i) * WbiSectionHeader::SIZE as u64;
        header_cursor.seek(SeekFrom::Start(section_offset))?;
        let section = WbiSectionHeader::read_from(&mut header_cursor)?;

        let start_offset = data_start + cumulative_offset;
        let total_size = u64::from(section.osize);
        let shared_for_chunks = shared.clone();
        let generate = move || -> ChunkProducer<'static> {
            Box::new(LzSectionChunks {
                cursor: shared_for_chunks.clone(),
                total_size,
                produced: 0,
                started: false,
                start_offset,
            })
        };

        out.push(WbiChunk {
            physical_addr: section.addr,
            virtual_addr: section.virt,
            size: section.osize,
            contents: ChunkedFile::new(generate, Some(total_size)),
        });
        cumulative_offset += u64::from(section.size);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; WbiHeader::SIZE];
        assert!(!is_wbi(&mut Cursor::new(data)));
    }

    fn build_lz77_uncompressed_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x0f, 0x00];
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_a_single_compressed_section() {
        let sector_size = 64u32;
        let payload = b"warm boot section contents";
        let frame = build_lz77_uncompressed_frame(payload);

        let header = WbiHeader {
            magic: MAGIC,
            num_sections: 1,
            flag: FLAG_COMPRESSED,
            resume_vector: 0,
            version: VERSION,
            sector_size,
            data_size: frame.len() as u32,
            kernel_start: 0,
            kernel_size: 0,
            kernel_checksum: 0,
            o_data_size: 0,
        };

        let mut data = header.to_bytes();
        while (data.len() as u64) < u64::from(sector_size) {
            data.push(0);
        }
        // The compressed section data starts right at the second sector;
        // its first byte (the lz77 frame tag) is non-zero, which is what
        // ends the empty-sector skip loop.
        data.extend_from_slice(&frame);

        let section = WbiSectionHeader {
            addr: 0x1000,
            size: frame.len() as u32,
            checksum: 0,
            flag: 0,
            osize: payload.len() as u32,
            virt: 0x2000,
            _pad: 0,
            meta_checksum: 0,
        };
        data.extend_from_slice(&section.to_bytes());
        // Padding so the empty-sector probe (which reads a full sector at a
        // time) never runs past the end of the buffer.
        while (data.len() as u64) < 2 * u64::from(sector_size) {
            data.push(0);
        }

        assert!(is_wbi(&mut Cursor::new(data.clone())));
        let sections = read_wbi(Cursor::new(data)).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].physical_addr, 0x1000);
        assert_eq!(sections[0].virtual_addr, 0x2000);

        let mut bytes = Vec::new();
        let mut contents = sections.into_iter().next().unwrap().contents;
        contents.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, payload);
    }
}
