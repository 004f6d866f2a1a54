//! LZPT: a block-compressed flash image container used for warm-boot and
//! kernel images (`struct wbi_lzp_hdr` in the Linux `cmpr.h`/`warmboot.h`
//! headers this format originates from). Grounded on `fwtool/archive/lzpt.py`.
//!
//! Unlike the other formats in this module, LZPT is not wired into
//! [`super::read_archive`]'s dispatch chain: it only ever appears nested
//! inside a warm-boot image section, never as a top-level body, so callers
//! reach it directly through [`read_lzpt`].

use super::UnixFile;
use crate::error::{Error, Result};
use crate::io::{ChunkProducer, ChunkedFile, SharedSource};
use crate::lz77;
use crate::structio::wire_struct;
use std::io::{Read, Seek, SeekFrom};

wire_struct! {
    le struct LzptHeader {
        magic: [u8; 4],
        block_size: u32,
        toc_offset: u32,
        toc_size: u32,
    }
}

wire_struct! {
    le struct LzptTocEntry {
        offset: u32,
        size: u32,
    }
}

const MAGIC: [u8; 4] = *b"TPZL";

/// Sniffs the `TPZL` magic.
pub fn is_lzpt<R: Read>(source: &mut R) -> bool {
    LzptHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC)
}

/// Decodes an LZPT image into its single decompressed content stream.
///
/// Each table-of-contents entry names a block of LZ77 frames; a block
/// keeps decoding frames until it has produced `2^block_size` bytes, the
/// uncompressed size every block in the image shares. The result is
/// presented as one lazily-decompressed [`UnixFile`], matching the
/// original's single-entry generator.
pub fn read_lzpt<R: Read + Seek + 'static>(mut source: R) -> Result<Vec<UnixFile<'static>>> {
    source.seek(SeekFrom::Start(0))?;
    let header = LzptHeader::read_from(&mut source)?;
    if header.magic != MAGIC {
        return Err(Error::WrongMagic("lzpt header".to_string()));
    }

    let block_len = 1u64 << header.block_size;
    let mut toc_entries = Vec::new();
    let mut toc_cursor = {
        let mut c = SharedSource::new(source);
        c.seek(SeekFrom::Start(u64::from(header.toc_offset)))?;
        c
    };
    let toc_end = u64::from(header.toc_offset) + u64::from(header.toc_size);
    while toc_cursor.stream_position()? < toc_end {
        toc_entries.push(LzptTocEntry::read_from(&mut toc_cursor)?);
    }

    let shared = toc_cursor;
    let generate = move || -> ChunkProducer<'static> {
        Box::new(LzptChunks {
            shared: shared.clone(),
            entries: toc_entries.clone(),
            entry_index: 0,
            block_len,
            produced_in_block: 0,
            at_entry_start: true,
        })
    };

    Ok(vec![UnixFile {
        path: String::new(),
        size: -1,
        mtime: 0,
        mode: super::S_IFREG,
        uid: 0,
        gid: 0,
        contents: Some(Box::new(ChunkedFile::new(generate, None))),
    }])
}

/// Walks the table of contents, decoding LZ77 frames one at a time. Each
/// entry's compressed bytes are read through a single cursor that keeps
/// advancing across frames (the compressed and decompressed lengths
/// differ, so tracking a byte offset by decompressed size produced would
/// desync the stream): only the first frame of each entry needs a seek,
/// to the entry's declared offset.
struct LzptChunks<R> {
    shared: SharedSource<R>,
    entries: Vec<LzptTocEntry>,
    entry_index: usize,
    block_len: u64,
    produced_in_block: u64,
    at_entry_start: bool,
}

impl<R: Read + Seek> Iterator for LzptChunks<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.entry_index >= self.entries.len() {
                return None;
            }
            if self.produced_in_block >= self.block_len {
                self.entry_index += 1;
                self.produced_in_block = 0;
                self.at_entry_start = true;
                continue;
            }
            if self.at_entry_start {
                let entry = self.entries[self.entry_index];
                if let Err(e) = self.shared.seek(SeekFrom::Start(u64::from(entry.offset))) {
                    return Some(Err(e));
                }
                self.at_entry_start = false;
            }
            return Some(match lz77::inflate(&mut self.shared) {
                Ok(chunk) => {
                    self.produced_in_block += chunk.len() as u64;
                    Ok(chunk)
                },
                Err(e) => Err(std::io::Error::other(e.to_string())),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn build_frame(data: &[u8]) -> Vec<u8> {
        let mut out = vec![0x0f, 0x00];
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; 16];
        assert!(!is_lzpt(&mut Cursor::new(data)));
    }

    #[test]
    fn decodes_a_single_uncompressed_block() {
        let payload = b"hello lzpt world";
        let frame = build_frame(payload);

        let header_size = LzptHeader::SIZE as u32;
        let toc_offset = header_size;
        let toc_size = LzptTocEntry::SIZE as u32;
        let block_offset = toc_offset + toc_size;

        let header = LzptHeader {
            magic: MAGIC,
            block_size: (payload.len() as f64).log2().ceil() as u32,
            toc_offset,
            toc_size,
        };
        let toc_entry = LzptTocEntry {
            offset: block_offset,
            size: frame.len() as u32,
        };

        let mut data = Vec::new();
        data.write_all(&header.to_bytes()).unwrap();
        data.write_all(&toc_entry.to_bytes()).unwrap();
        data.write_all(&frame).unwrap();

        assert!(is_lzpt(&mut Cursor::new(data.clone())));
        let entries = read_lzpt(Cursor::new(data)).unwrap();
        assert_eq!(entries.len(), 1);

        let mut out = Vec::new();
        entries
            .into_iter()
            .next()
            .unwrap()
            .contents
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, payload);
    }
}
