//! squashfs (v4.0, zlib compression only): the metadata-block/inode-table
//! layout used by later, Linux-based camera bodies as their `'U'`
//! filesystem. Grounded on `fwtool/archive/squashfs.py`.

use super::UnixFile;
use crate::error::{Error, Result};
use crate::io::{ChunkProducer, ChunkedFile, SharedSource};
use crate::structio::wire_struct;
use std::io::{Cursor, Read, Seek, SeekFrom};

wire_struct! {
    le struct SquashfsSuper {
        magic: [u8; 4],
        inode_count: u32,
        modification_time: u32,
        block_size: u32,
        fragment_entry_count: u32,
        compression_id: u16,
        block_log: u16,
        flags: u16,
        id_count: u16,
        version_major: u16,
        version_minor: u16,
        root_inode_ref: u64,
        bytes_used: u64,
        id_table_start: u64,
        xattr_id_table_start: u64,
        inode_table_start: u64,
        directory_table_start: u64,
        fragment_table_start: u64,
        export_table_start: u64,
    }
}

wire_struct! {
    le struct InodeHeader {
        inode_type: u16,
        permissions: u16,
        uid_idx: u16,
        gid_idx: u16,
        modified_time: u32,
        inode_number: u32,
    }
}

wire_struct! {
    le struct BasicDirectoryInode {
        dir_block_start: u32,
        hard_link_count: u32,
        file_size: u16,
        block_offset: u16,
        parent_inode_number: u32,
    }
}

wire_struct! {
    le struct ExtendedDirectoryInode {
        hard_link_count: u32,
        file_size: u32,
        dir_block_start: u32,
        parent_inode_number: u32,
        index_count: u16,
        block_offset: u16,
        xattr_idx: u32,
    }
}

wire_struct! {
    le struct BasicFileInode {
        blocks_start: u32,
        fragment_block_index: u32,
        block_offset: u32,
        file_size: u32,
    }
}

wire_struct! {
    le struct ExtendedFileInode {
        blocks_start: u64,
        file_size: u64,
        sparse: u64,
        hard_link_count: u32,
        fragment_block_index: u32,
        block_offset: u32,
        xattr_idx: u32,
    }
}

wire_struct! {
    le struct SymlinkInode {
        hard_link_count: u32,
        target_size: u32,
    }
}

wire_struct! {
    le struct DirectoryHeader {
        count: u32,
        start: u32,
        inode_number: u32,
    }
}

wire_struct! {
    le struct DirectoryEntry {
        offset: u16,
        inode_offset: u16,
        entry_type: u16,
        name_size: u16,
    }
}

wire_struct! {
    le struct FragmentBlockEntry {
        start: u64,
        size: u32,
        _unused: [u8; 4],
    }
}

const MAGIC: [u8; 4] = *b"hsqs";
const INODE_BASIC_DIRECTORY: u16 = 1;
const INODE_BASIC_FILE: u16 = 2;
const INODE_BASIC_SYMLINK: u16 = 3;
const INODE_EXTENDED_DIRECTORY: u16 = 8;
const INODE_EXTENDED_FILE: u16 = 9;
const INODE_EXTENDED_SYMLINK: u16 = 10;

/// Sniffs the `hsqs` magic.
pub fn is_squashfs<R: Read>(source: &mut R) -> bool {
    SquashfsSuper::read_opt(source).is_some_and(|s| s.magic == MAGIC)
}

/// Reads one compressed metadata block run starting at `start`,
/// decompressing each 2-byte-length-prefixed chunk (MSB of the length
/// marks "stored uncompressed") until at least `offset + size` bytes have
/// accumulated, then slices out `[offset, offset+size)`.
fn read_metadata<R: Read + Seek>(source: &mut R, start: u64, offset: usize, size: usize) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    source.seek(SeekFrom::Start(start))?;
    while block.len() < offset + size {
        let mut len_bytes = [0u8; 2];
        source.read_exact(&mut len_bytes)?;
        let header = u16::from_le_bytes(len_bytes);
        let chunk_len = (header & 0x7fff) as usize;
        let mut chunk = vec![0u8; chunk_len];
        source.read_exact(&mut chunk)?;
        if header & 0x8000 == 0 {
            let mut decoder = flate2::read::ZlibDecoder::new(&chunk[..]);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| Error::Malformed(format!("squashfs metadata zlib: {e}")))?;
            block.extend(decompressed);
        } else {
            block.extend(chunk);
        }
    }
    block
        .get(offset..offset + size)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::Truncated("squashfs metadata block".to_string()))
}

fn read_table<R: Read + Seek>(source: &mut R, start: u64, count: usize, entry_size: usize) -> Result<Vec<Vec<u8>>> {
    let entries_per_block = 0x2000 / entry_size;
    source.seek(SeekFrom::Start(start))?;
    let num_blocks = count.div_ceil(entries_per_block.max(1));
    let mut block_offsets = Vec::with_capacity(num_blocks);
    for _ in 0..num_blocks {
        let mut buf = [0u8; 8];
        source.read_exact(&mut buf)?;
        block_offsets.push(u64::from_le_bytes(buf));
    }

    let mut entries = Vec::with_capacity(count);
    for (i, &offset) in block_offsets.iter().enumerate() {
        let remaining = count - i * entries_per_block;
        let block_size = (remaining * entry_size).min(0x2000);
        let block = read_metadata(source, offset, 0, block_size)?;
        for chunk in block.chunks(entry_size) {
            entries.push(chunk.to_vec());
        }
    }
    Ok(entries)
}

/// A lazy, one-block-at-a-time producer of a regular file's data: the
/// file's own data blocks in order, followed by its tail fragment (if
/// any), matching `fwtool`'s block-then-fragment read order.
struct SquashfsBlocks<R> {
    shared: SharedSource<R>,
    blocks_start: u64,
    block_size: u64,
    block_sizes: Vec<u32>,
    block_index: usize,
    cursor: u64,
    file_size: u64,
    produced: u64,
    fragment: Option<(u64, u32, usize, usize)>,
}

impl<R: Read + Seek> Iterator for SquashfsBlocks<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.block_index < self.block_sizes.len() {
            let entry = self.block_sizes[self.block_index];
            self.block_index += 1;
            let remaining = (self.file_size - self.produced).min(self.block_size) as usize;
            if entry == 0 {
                self.produced += remaining as u64;
                return Some(Ok(vec![0u8; remaining]));
            }
            let stored_uncompressed = entry & (1 << 24) != 0;
            let real_size = (entry & !(1 << 24)) as usize;
            let seek_pos = self.blocks_start + self.cursor;
            self.cursor += real_size as u64;
            if let Err(e) = self.shared.seek(SeekFrom::Start(seek_pos)) {
                return Some(Err(e));
            }
            let mut block = vec![0u8; real_size];
            if let Err(e) = self.shared.read_exact(&mut block) {
                return Some(Err(e));
            }
            let mut block = if stored_uncompressed {
                block
            } else {
                let mut decoder = flate2::read::ZlibDecoder::new(&block[..]);
                let mut out = Vec::new();
                if let Err(e) = decoder.read_to_end(&mut out) {
                    return Some(Err(std::io::Error::other(e.to_string())));
                }
                out
            };
            block.resize(remaining, 0);
            self.produced += remaining as u64;
            return Some(Ok(block));
        }

        let (start, size, offset, take) = self.fragment.take()?;
        if let Err(e) = self.shared.seek(SeekFrom::Start(start)) {
            return Some(Err(e));
        }
        let stored_uncompressed = size & (1 << 24) != 0;
        let real_size = (size & !(1 << 24)) as usize;
        let mut block = vec![0u8; real_size];
        if let Err(e) = self.shared.read_exact(&mut block) {
            return Some(Err(e));
        }
        let block = if stored_uncompressed {
            block
        } else {
            let mut decoder = flate2::read::ZlibDecoder::new(&block[..]);
            let mut out = Vec::new();
            if let Err(e) = decoder.read_to_end(&mut out) {
                return Some(Err(std::io::Error::other(e.to_string())));
            }
            out
        };
        let end = (offset + take).min(block.len());
        let start_idx = offset.min(end);
        Some(Ok(block[start_idx..end].to_vec()))
    }
}

struct Context<'a, R> {
    source: &'a mut SharedSource<R>,
    super_block: SquashfsSuper,
    fragments: Vec<FragmentBlockEntry>,
    ids: Vec<u32>,
}

impl<R: Read + Seek + 'static> Context<'_, R> {
    fn read_inode(&mut self, start: u32, offset: u16, path: &str, out: &mut Vec<UnixFile<'static>>) -> Result<()> {
        let start = u64::from(start) + self.super_block.inode_table_start;
        let header_bytes = read_metadata(self.source, start, offset as usize, InodeHeader::SIZE)?;
        let header = InodeHeader::from_bytes(&header_bytes)
            .ok_or_else(|| Error::Truncated("squashfs inode header".to_string()))?;
        let uid = *self
            .ids
            .get(header.uid_idx as usize)
            .ok_or_else(|| Error::Malformed("squashfs uidIdx out of range".to_string()))?;
        let gid = *self
            .ids
            .get(header.gid_idx as usize)
            .ok_or_else(|| Error::Malformed("squashfs gidIdx out of range".to_string()))?;

        match header.inode_type {
            INODE_BASIC_DIRECTORY | INODE_EXTENDED_DIRECTORY => {
                let (dir_block_start, file_size, block_offset) = if header.inode_type == INODE_BASIC_DIRECTORY {
                    let f = BasicDirectoryInode::from_bytes(&read_metadata(
                        self.source,
                        start,
                        offset as usize + InodeHeader::SIZE,
                        BasicDirectoryInode::SIZE,
                    )?)
                    .ok_or_else(|| Error::Truncated("squashfs basic directory inode".to_string()))?;
                    (f.dir_block_start, u32::from(f.file_size), f.block_offset)
                } else {
                    let f = ExtendedDirectoryInode::from_bytes(&read_metadata(
                        self.source,
                        start,
                        offset as usize + InodeHeader::SIZE,
                        ExtendedDirectoryInode::SIZE,
                    )?)
                    .ok_or_else(|| Error::Truncated("squashfs extended directory inode".to_string()))?;
                    (f.dir_block_start, f.file_size, f.block_offset)
                };

                out.push(UnixFile {
                    path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                    size: 0,
                    mtime: u64::from(header.modified_time),
                    mode: super::S_IFDIR | u32::from(header.permissions),
                    uid,
                    gid,
                    contents: None,
                });

                let dir_size = file_size
                    .checked_sub(3)
                    .ok_or_else(|| Error::Malformed("squashfs directory fileSize < 3".to_string()))?;
                let dir_bytes = read_metadata(
                    self.source,
                    self.super_block.directory_table_start + u64::from(dir_block_start),
                    block_offset as usize,
                    dir_size as usize,
                )?;
                let mut dir = Cursor::new(dir_bytes);
                loop {
                    let Some(dir_header) = DirectoryHeader::read_opt(&mut dir) else {
                        break;
                    };
                    for _ in 0..=dir_header.count {
                        let entry = DirectoryEntry::read_from(&mut dir)?;
                        let mut name_bytes = vec![0u8; entry.name_size as usize + 1];
                        dir.read_exact(&mut name_bytes)?;
                        let name = String::from_utf8_lossy(&name_bytes).into_owned();
                        let child_path = format!("{path}/{name}");
                        self.read_inode(dir_header.start, entry.offset, &child_path, out)?;
                    }
                }
                Ok(())
            }
            INODE_BASIC_FILE | INODE_EXTENDED_FILE => {
                let (blocks_start, file_size, fragment_block_index, block_offset, header_skip) =
                    if header.inode_type == INODE_BASIC_FILE {
                        let f = BasicFileInode::from_bytes(&read_metadata(
                            self.source,
                            start,
                            offset as usize + InodeHeader::SIZE,
                            BasicFileInode::SIZE,
                        )?)
                        .ok_or_else(|| Error::Truncated("squashfs basic file inode".to_string()))?;
                        (
                            u64::from(f.blocks_start),
                            u64::from(f.file_size),
                            f.fragment_block_index,
                            f.block_offset,
                            BasicFileInode::SIZE,
                        )
                    } else {
                        let f = ExtendedFileInode::from_bytes(&read_metadata(
                            self.source,
                            start,
                            offset as usize + InodeHeader::SIZE,
                            ExtendedFileInode::SIZE,
                        )?)
                        .ok_or_else(|| Error::Truncated("squashfs extended file inode".to_string()))?;
                        (
                            f.blocks_start,
                            f.file_size,
                            f.fragment_block_index,
                            f.block_offset,
                            ExtendedFileInode::SIZE,
                        )
                    };

                let block_size = u64::from(self.super_block.block_size);
                let block_count = if fragment_block_index != 0xffff_ffff {
                    file_size / block_size
                } else {
                    file_size.div_ceil(block_size)
                };
                let sizes_bytes = read_metadata(
                    self.source,
                    start,
                    offset as usize + InodeHeader::SIZE + header_skip,
                    block_count as usize * 4,
                )?;
                let block_sizes: Vec<u32> = sizes_bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .collect();

                let full_blocks_size = block_sizes.len() as u64 * block_size;
                let fragment = if fragment_block_index != 0xffff_ffff {
                    let f = self
                        .fragments
                        .get(fragment_block_index as usize)
                        .ok_or_else(|| Error::Malformed("squashfs fragmentBlockIndex out of range".to_string()))?;
                    let take = (file_size - full_blocks_size.min(file_size)) as usize;
                    Some((f.start, f.size, block_offset as usize, take))
                } else {
                    None
                };

                let shared = self.source.clone();
                let generate = move || -> ChunkProducer<'static> {
                    Box::new(SquashfsBlocks {
                        shared: shared.clone(),
                        blocks_start,
                        block_size,
                        block_sizes: block_sizes.clone(),
                        block_index: 0,
                        cursor: 0,
                        file_size,
                        produced: 0,
                        fragment,
                    })
                };

                out.push(UnixFile {
                    path: path.to_string(),
                    size: file_size as i64,
                    mtime: u64::from(header.modified_time),
                    mode: super::S_IFREG | u32::from(header.permissions),
                    uid,
                    gid,
                    contents: Some(Box::new(ChunkedFile::new(generate, Some(file_size))) as Box<dyn Read>),
                });
                Ok(())
            }
            INODE_BASIC_SYMLINK | INODE_EXTENDED_SYMLINK => {
                let f = SymlinkInode::from_bytes(&read_metadata(
                    self.source,
                    start,
                    offset as usize + InodeHeader::SIZE,
                    SymlinkInode::SIZE,
                )?)
                .ok_or_else(|| Error::Truncated("squashfs symlink inode".to_string()))?;
                let target = read_metadata(
                    self.source,
                    start,
                    offset as usize + InodeHeader::SIZE + SymlinkInode::SIZE,
                    f.target_size as usize,
                )?;

                out.push(UnixFile {
                    path: path.to_string(),
                    size: target.len() as i64,
                    mtime: u64::from(header.modified_time),
                    mode: super::S_IFLNK | u32::from(header.permissions),
                    uid,
                    gid,
                    contents: Some(Box::new(Cursor::new(target)) as Box<dyn Read>),
                });
                Ok(())
            }
            other => Err(Error::Unsupported(format!("squashfs inode type {other}"))),
        }
    }
}

/// Reads a squashfs v4.0, zlib-only image from its root inode down.
pub fn read_squashfs<R: Read + Seek + 'static>(source: R) -> Result<Vec<UnixFile<'static>>> {
    let mut source = SharedSource::new(source);
    let super_block = SquashfsSuper::read_from(&mut source)?;
    if super_block.magic != MAGIC {
        return Err(Error::WrongMagic("squashfs superblock".to_string()));
    }
    if super_block.version_major != 4 || super_block.version_minor != 0 {
        return Err(Error::WrongVersion("squashfs format version".to_string()));
    }
    if 1u32 << super_block.block_log != super_block.block_size {
        return Err(Error::Malformed("squashfs blockLog/blockSize mismatch".to_string()));
    }
    if super_block.compression_id != 1 {
        return Err(Error::Unsupported(format!(
            "squashfs compression id {} (only zlib is supported)",
            super_block.compression_id
        )));
    }

    let fragment_entries = read_table(
        &mut source,
        super_block.fragment_table_start,
        super_block.fragment_entry_count as usize,
        FragmentBlockEntry::SIZE,
    )?;
    let fragments = fragment_entries
        .iter()
        .map(|e| FragmentBlockEntry::from_bytes(e).ok_or_else(|| Error::Truncated("fragment entry".to_string())))
        .collect::<Result<Vec<_>>>()?;

    let id_entries = read_table(&mut source, super_block.id_table_start, super_block.id_count as usize, 4)?;
    let ids = id_entries
        .iter()
        .map(|e| u32::from_le_bytes(e[..4].try_into().unwrap()))
        .collect();

    let root_start = ((super_block.root_inode_ref >> 16) & 0xffff_ffff) as u32;
    let root_offset = (super_block.root_inode_ref & 0xffff) as u16;

    let mut ctx = Context {
        source: &mut source,
        super_block,
        fragments,
        ids,
    };
    let mut out = Vec::new();
    ctx.read_inode(root_start, root_offset, "", &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; SquashfsSuper::SIZE];
        assert!(!is_squashfs(&mut Cursor::new(data)));
    }
}
