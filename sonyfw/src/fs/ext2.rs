//! ext2: a read-only reader for the classic Linux filesystem, used on a
//! handful of bodies as the `'U'` filesystem instead of cramfs/FAT.
//! Grounded on `fwtool/archive/ext2.py`.

use super::UnixFile;
use crate::error::{Error, Result};
use crate::io::{ChunkProducer, ChunkedFile, SharedSource};
use std::io::{Cursor, Read, Seek, SeekFrom};

const MAGIC: [u8; 2] = [0x53, 0xef];

const S_IFMT: u16 = 0o170_000;
const S_IFDIR: u16 = 0o040_000;
const S_IFLNK: u16 = 0o120_000;

struct Header {
    inodes_count: u32,
    blocks_count: u32,
    block_size: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
}

fn read_header<R: Read + Seek>(source: &mut R) -> Result<Header> {
    source.seek(SeekFrom::Start(1024))?;
    let mut buf = [0u8; 1024];
    source.read_exact(&mut buf)?;
    let magic = [buf[56 + 4], buf[56 + 5]];
    if magic != MAGIC {
        return Err(Error::WrongMagic("ext2 super block".to_string()));
    }
    Ok(Header {
        inodes_count: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        blocks_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        block_size: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        blocks_per_group: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        inodes_per_group: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
    })
}

/// Sniffs the `53 EF` magic at `1024 + 56`.
pub fn is_ext2<R: Read + Seek>(source: &mut R) -> bool {
    read_header(source).is_ok()
}

struct Inode {
    mode: u16,
    uid: u16,
    size: u32,
    mtime: u32,
    gid: u16,
    blocks: [u8; 60],
}

fn read_inode<R: Read + Seek>(
    source: &mut R,
    inode_tables: &[u32],
    block_size: u32,
    inodes_per_group: u32,
    index: u32,
) -> Result<Inode> {
    let group = (index - 1) / inodes_per_group;
    let table_block = *inode_tables
        .get(group as usize)
        .ok_or_else(|| Error::Malformed("ext2 inode references an unknown block group".to_string()))?;
    const INODE_SIZE: u64 = 128;
    let offset =
        u64::from(table_block) * u64::from(block_size) + u64::from((index - 1) % inodes_per_group) * INODE_SIZE;
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 128];
    source.read_exact(&mut buf)?;
    let mut blocks = [0u8; 60];
    blocks.copy_from_slice(&buf[40..100]);
    Ok(Inode {
        mode: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
        uid: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
        size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        mtime: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        gid: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
        blocks,
    })
}

/// Flattens the 15-slot direct/indirect/double-indirect/triple-indirect
/// blocks vector into a single ordered list of data-block pointers,
/// resolving indirection levels from the top down exactly as the
/// original's iterative `ptrs[i:]` expansion does.
fn resolve_data_pointers<R: Read + Seek>(
    source: &mut R,
    blocks: &[u8; 60],
    block_size: u32,
) -> Result<Vec<u32>> {
    let mut contents = blocks.to_vec();
    let mut ptrs: Vec<u32> = Vec::new();
    for i in (12..=15).rev() {
        contents.truncate(i * 4);
        for &ptr in &ptrs[i.min(ptrs.len())..] {
            if ptr != 0 {
                source.seek(SeekFrom::Start(u64::from(ptr) * u64::from(block_size)))?;
                let mut block = vec![0u8; block_size as usize];
                source.read_exact(&mut block)?;
                contents.extend(block);
            }
        }
        ptrs = contents
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
    }
    Ok(ptrs)
}

/// Reads a directory or small index structure's full contents eagerly:
/// this is the directory-entry table itself (an index structure, per the
/// same allowance as FAT's directory entries or cramfs's block-pointer
/// table), never a regular file's data.
fn extract<R: Read + Seek>(source: &mut R, inode: &Inode, block_size: u32) -> Result<Vec<u8>> {
    let size = inode.size as usize;
    let ptrs = resolve_data_pointers(source, &inode.blocks, block_size)?;
    let mut out = Vec::with_capacity(size);
    for ptr in ptrs {
        if out.len() >= size {
            break;
        }
        if ptr == 0 {
            continue;
        }
        source.seek(SeekFrom::Start(u64::from(ptr) * u64::from(block_size)))?;
        let mut block = vec![0u8; block_size as usize];
        source.read_exact(&mut block)?;
        let take = block.len().min(size - out.len());
        out.extend(&block[..take]);
    }
    Ok(out)
}

/// A lazy, one-block-at-a-time producer of a regular file's or long
/// symlink's data, walking the already-resolved block-pointer index and
/// pulling each data block from the shared source on demand.
struct Ext2Blocks<R> {
    shared: SharedSource<R>,
    ptrs: Vec<u32>,
    index: usize,
    block_size: u32,
    remaining: usize,
}

impl<R: Read + Seek> Iterator for Ext2Blocks<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let Some(&ptr) = self.ptrs.get(self.index) else {
                return None;
            };
            self.index += 1;
            if ptr == 0 {
                continue;
            }
            if let Err(e) = self
                .shared
                .seek(SeekFrom::Start(u64::from(ptr) * u64::from(self.block_size)))
            {
                return Some(Err(e));
            }
            let mut block = vec![0u8; self.block_size as usize];
            if let Err(e) = self.shared.read_exact(&mut block) {
                return Some(Err(e));
            }
            let take = block.len().min(self.remaining);
            block.truncate(take);
            self.remaining -= take;
            return Some(Ok(block));
        }
        None
    }
}

/// Builds the lazy contents stream for a regular file or a long symlink
/// (target longer than 60 bytes). Fast symlinks (target `<= 60` bytes,
/// stored inline in the inode's own blocks vector per spec §4.8) need no
/// stream at all since their "contents" never touch the source again.
fn lazy_contents<R: Read + Seek + 'static>(
    shared: &SharedSource<R>,
    inode: &Inode,
    block_size: u32,
) -> Result<Box<dyn Read>> {
    let size = inode.size as usize;
    let is_link = inode.mode & S_IFMT == S_IFLNK;
    if is_link && size <= 60 {
        return Ok(Box::new(Cursor::new(inode.blocks[..size].to_vec())));
    }

    let mut probe = shared.clone();
    let ptrs = resolve_data_pointers(&mut probe, &inode.blocks, block_size)?;
    let shared = shared.clone();
    let generate = move || -> ChunkProducer<'static> {
        Box::new(Ext2Blocks {
            shared: shared.clone(),
            ptrs: ptrs.clone(),
            index: 0,
            block_size,
            remaining: size,
        })
    };
    Ok(Box::new(ChunkedFile::new(generate, Some(size as u64))))
}

struct Reader<'a, R> {
    source: SharedSource<R>,
    header: &'a Header,
    inode_tables: Vec<u32>,
    out: Vec<UnixFile<'static>>,
}

impl<R: Read + Seek + 'static> Reader<'_, R> {
    fn visit(&mut self, index: u32, path: &str) -> Result<()> {
        let inode = read_inode(
            &mut self.source,
            &self.inode_tables,
            self.header.block_size,
            self.header.inodes_per_group,
            index,
        )?;
        let is_dir = inode.mode & S_IFMT == S_IFDIR;
        let contents = if is_dir {
            None
        } else {
            Some(lazy_contents(&self.source, &inode, self.header.block_size)?)
        };

        self.out.push(UnixFile {
            path: path.to_string(),
            size: if is_dir { 0 } else { i64::from(inode.size) },
            mtime: u64::from(inode.mtime),
            mode: u32::from(inode.mode),
            uid: u32::from(inode.uid),
            gid: u32::from(inode.gid),
            contents,
        });

        if is_dir {
            let dir_bytes = extract(&mut self.source, &inode, self.header.block_size)?;
            let mut offset = 0usize;
            while offset + 8 <= dir_bytes.len() {
                let dir_inode = u32::from_le_bytes(dir_bytes[offset..offset + 4].try_into().unwrap());
                let rec_len = u16::from_le_bytes(dir_bytes[offset + 4..offset + 6].try_into().unwrap()) as usize;
                let name_len = dir_bytes[offset + 6] as usize;
                if rec_len == 0 {
                    break;
                }
                let name = &dir_bytes[offset + 8..(offset + 8 + name_len).min(dir_bytes.len())];
                let name = String::from_utf8_lossy(name);
                if dir_inode != 0 && name != "." && name != ".." {
                    let child_path = if path.is_empty() {
                        format!("/{name}")
                    } else {
                        format!("{path}/{name}")
                    };
                    self.visit(dir_inode, &child_path)?;
                }
                offset += rec_len;
            }
        }
        Ok(())
    }
}

/// Reads an ext2 image from its root inode (inode 2) down, resolving
/// block-group descriptors and inode-table offsets, and recursing through
/// directory entries.
pub fn read_ext2<R: Read + Seek + 'static>(source: R) -> Result<Vec<UnixFile<'static>>> {
    let mut shared = SharedSource::new(source);
    let header = read_header(&mut shared)?;
    let bgd_offset = header.block_size.max(2048);
    let num_groups = (header.blocks_count - 1) / header.blocks_per_group + 1;
    let mut inode_tables = Vec::with_capacity(num_groups as usize);
    for i in 0..num_groups {
        shared.seek(SeekFrom::Start(u64::from(bgd_offset) + u64::from(i) * 32))?;
        let mut buf = [0u8; 32];
        shared.read_exact(&mut buf)?;
        inode_tables.push(u32::from_le_bytes(buf[8..12].try_into().unwrap()));
    }

    let _ = header.inodes_count;
    let mut reader = Reader {
        source: shared,
        header: &header,
        inode_tables,
        out: Vec::new(),
    };
    reader.visit(2, "")?;
    Ok(reader.out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; 2048];
        assert!(!is_ext2(&mut Cursor::new(data)));
    }
}
