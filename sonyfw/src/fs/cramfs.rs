//! cramfs: a compressed, read-only image format used for the flashable
//! user filesystem on many camera bodies. Grounded on
//! `fwtool/archive/cramfs.py`.

use super::UnixFile;
use crate::error::{Error, Result};
use crate::io::{ChunkProducer, ChunkedFile, SharedSource};
use crate::primitive::crc32;
use crate::structio::wire_struct;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

const BLOCK_SIZE: usize = 4096;
const SUPER_MAGIC: [u8; 4] = [0x45, 0x3d, 0xcd, 0x28];
const SIGNATURE: &[u8; 16] = b"Compressed ROMFS";
const LZO_FLAG: u32 = 0x1000_0000;
const LZ77_FLAG: u32 = 0x2000_0000;

const S_IFMT: u16 = 0o170_000;
const S_IFDIR: u16 = 0o040_000;
const S_IFREG: u16 = 0o100_000;
const S_IFLNK: u16 = 0o120_000;

wire_struct! {
    be struct CramfsSuper {
        magic: [u8; 4],
        size: u32,
        flags: u32,
        future: u32,
        signature: [u8; 16],
        crc: u32,
        edition: u32,
        blocks: u32,
        files: u32,
        name: [u8; 16],
    }
}

wire_struct! {
    le struct CramfsInode {
        mode: u16,
        uid: u16,
        size_gid: u32,
        name_len_offset: u32,
    }
}

/// Sniffs the magic and signature without validating the CRC.
pub fn is_cramfs<R: Read>(source: &mut R) -> bool {
    let Some(sup) = CramfsSuper::read_opt(source) else {
        return false;
    };
    sup.magic == SUPER_MAGIC && &sup.signature == SIGNATURE
}

fn decompress(flags: u32, block: &[u8]) -> Result<Vec<u8>> {
    if flags & LZO_FLAG != 0 {
        return Err(Error::Unsupported(
            "cramfs LZO-compressed blocks are not supported".to_string(),
        ));
    }
    if flags & LZ77_FLAG != 0 {
        return crate::lz77::inflate(&mut Cursor::new(block));
    }
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(block)
        .read_to_end(&mut out)
        .map_err(|e| Error::Malformed(format!("cramfs zlib block: {e}")))?;
    Ok(out)
}

/// Reads the block-pointer index for a file at `offset` (index data only,
/// no block bodies): a small, eagerly-materialised table of `n_blocks + 1`
/// absolute offsets bounding each compressed block, synthesising the
/// implicit first entry (`offset + 4*n_blocks`, where block 0 starts).
fn read_pointer_table<R: Read + Seek>(source: &mut R, offset: u32, size: u32) -> Result<Vec<u64>> {
    let n_blocks = (size as usize).div_ceil(BLOCK_SIZE);
    source.seek(SeekFrom::Start(u64::from(offset)))?;
    let mut pointers = vec![u64::from(offset) + (n_blocks as u64) * 4];
    for _ in 0..n_blocks {
        let mut buf = [0u8; 4];
        source.read_exact(&mut buf)?;
        pointers.push(u64::from(u32::from_le_bytes(buf)));
    }
    Ok(pointers)
}

/// A lazy, one-block-at-a-time producer of a cramfs file's decompressed
/// contents: each call to `next` seeks to the next compressed block named
/// by the pointer table, reads exactly that block, and decompresses it,
/// never materialising the whole file.
struct CramfsBlocks<R> {
    shared: SharedSource<R>,
    flags: u32,
    pointers: Vec<u64>,
    index: usize,
    remaining: usize,
}

impl<R: Read + Seek> Iterator for CramfsBlocks<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.index + 1 >= self.pointers.len() {
            return None;
        }
        let start = self.pointers[self.index];
        let end = self.pointers[self.index + 1];
        self.index += 1;
        if end < start {
            return Some(Err(std::io::Error::other(
                "cramfs block pointer table is not monotonic",
            )));
        }
        if let Err(e) = self.shared.seek(SeekFrom::Start(start)) {
            return Some(Err(e));
        }
        let mut compressed = vec![0u8; (end - start) as usize];
        if let Err(e) = self.shared.read_exact(&mut compressed) {
            return Some(Err(e));
        }
        match decompress(self.flags, &compressed) {
            Ok(mut block) => {
                if block.len() > self.remaining {
                    block.truncate(self.remaining);
                }
                self.remaining -= block.len();
                Some(Ok(block))
            },
            Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
        }
    }
}

/// Builds the restartable [`ChunkedFile`] factory for one file's contents,
/// closing over the already-read pointer table (index data) and a clone of
/// the shared source; block decompression happens lazily as the consumer
/// reads, matching [`super::lzpt::read_lzpt`]'s and
/// [`crate::ancillary::wbi::read_wbi`]'s producer pattern.
fn lazy_contents<R: Read + Seek + 'static>(
    shared: SharedSource<R>,
    flags: u32,
    pointers: Vec<u64>,
    size: u32,
) -> ChunkedFile<'static> {
    let generate = move || -> ChunkProducer<'static> {
        Box::new(CramfsBlocks {
            shared: shared.clone(),
            flags,
            pointers: pointers.clone(),
            index: 0,
            remaining: size as usize,
        })
    };
    ChunkedFile::new(generate, Some(u64::from(size)))
}

/// Streams `source` from byte 0 to EOF, folding every byte into a running
/// CRC-32 except the `field_len` bytes starting at `field_offset`, which
/// are treated as zero — the "CRC with the header's own CRC field zeroed"
/// check, computed without ever holding the whole image in memory at once.
fn crc_with_field_zeroed<R: Read + Seek>(
    source: &mut R,
    field_offset: u64,
    field_len: u64,
) -> Result<u32> {
    source.seek(SeekFrom::Start(0))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 8192];
    let mut pos = 0u64;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk_start = pos;
        let chunk_end = pos + n as u64;
        if chunk_end > field_offset && chunk_start < field_offset + field_len {
            let mut patched = buf[..n].to_vec();
            let lo = field_offset.saturating_sub(chunk_start) as usize;
            let hi = ((field_offset + field_len).min(chunk_end) - chunk_start) as usize;
            patched[lo..hi].fill(0);
            hasher.update(&patched);
        } else {
            hasher.update(&buf[..n]);
        }
        pos = chunk_end;
    }
    Ok(hasher.finalize())
}

struct Walker<R> {
    source: SharedSource<R>,
    flags: u32,
    out: Vec<UnixFile<'static>>,
}

impl<R: Read + Seek + 'static> Walker<R> {
    fn read_inode(&mut self, path: &str) -> Result<()> {
        let off = self.source.stream_position()?;
        let inode = CramfsInode::read_from(&mut self.source)?;
        let size = inode.size_gid & 0x00ff_ffff;
        let gid = inode.size_gid >> 24;
        let name_len = (inode.name_len_offset & 0x3f) as usize * 4;
        let offset = (inode.name_len_offset >> 6) * 4;

        self.source
            .seek(SeekFrom::Start(off + CramfsInode::SIZE as u64))?;
        let mut name_buf = vec![0u8; name_len];
        self.source.read_exact(&mut name_buf)?;
        let name_end = name_buf.iter().position(|&b| b == 0).unwrap_or(name_len);
        let name = String::from_utf8_lossy(&name_buf[..name_end]).into_owned();

        let entry_path = format!("{path}{name}");
        let is_dir = inode.mode & S_IFMT == S_IFDIR;
        let is_reg = inode.mode & S_IFMT == S_IFREG;
        let is_link = inode.mode & S_IFMT == S_IFLNK;

        let contents = if is_reg || is_link {
            let pointers = read_pointer_table(&mut self.source, offset, size)?;
            Some(Box::new(lazy_contents(self.source.clone(), self.flags, pointers, size)) as Box<dyn Read>)
        } else {
            None
        };

        self.out.push(UnixFile {
            path: entry_path.clone(),
            size: if is_dir { 0 } else { i64::from(size) },
            mtime: 0,
            mode: u32::from(inode.mode),
            uid: u32::from(inode.uid),
            gid,
            contents,
        });

        if is_dir {
            let dir_end = u64::from(offset) + u64::from(size);
            self.source.seek(SeekFrom::Start(u64::from(offset)))?;
            let child_prefix = format!("{entry_path}/");
            while self.source.stream_position()? < dir_end {
                self.read_inode(&child_prefix)?;
            }
        }

        self.source
            .seek(SeekFrom::Start(off + CramfsInode::SIZE as u64 + name_len as u64))?;
        Ok(())
    }
}

/// Parses a cramfs image, verifying the whole-image CRC-32 (computed with
/// the header's own CRC field zeroed) before walking the inode tree
/// depth-first from the root.
pub fn read_cramfs<R: Read + Seek + 'static>(source: R) -> Result<Vec<UnixFile<'static>>> {
    let mut shared = SharedSource::new(source);
    shared.seek(SeekFrom::Start(0))?;
    let sup = CramfsSuper::read_from(&mut shared)?;
    if sup.magic != SUPER_MAGIC || &sup.signature != SIGNATURE {
        return Err(Error::WrongMagic("cramfs super block".to_string()));
    }

    if crc_with_field_zeroed(&mut shared, 32, 4)? != sup.crc {
        return Err(Error::WrongChecksum("cramfs image crc".to_string()));
    }

    shared.seek(SeekFrom::Start(CramfsSuper::SIZE as u64))?;
    let mut walker = Walker {
        source: shared,
        flags: sup.flags,
        out: Vec::new(),
    };
    walker.read_inode("")?;
    Ok(walker.out)
}

/// A file or directory staged for [`write_cramfs`]; unlike [`UnixFile`] this
/// owns its contents outright, since the writer must read them twice
/// (once to size the block table, once to compress).
pub struct StagedFile {
    /// Absolute, slash-separated path (no trailing slash, `""` for root).
    pub path: String,
    /// Full unix mode, including the `S_IFDIR`/`S_IFREG`/`S_IFLNK` type bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// File contents; ignored for directories.
    pub data: Vec<u8>,
}

struct Node {
    path: String,
    mode: u16,
    uid: u16,
    gid: u32,
    data: Vec<u8>,
    inode_offset: usize,
}

/// Two-pass writer: pass 1 lays out every directory's immediate-children
/// inode+name records depth-first (a directory's own record describes an
/// `[offset, offset+size)` range holding only its direct children, never
/// its descendants — the classic cramfs layout); pass 2 compresses each
/// regular file's contents into its block-pointer-table region and patches
/// the recorded inode offsets/sizes, then patches the super-block CRC last.
pub fn write_cramfs(files: &[StagedFile]) -> Result<Vec<u8>> {
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut by_path: std::collections::HashMap<String, &StagedFile> =
        std::collections::HashMap::new();
    for f in files {
        let path = f.path.trim_end_matches('/').to_string();
        by_path.insert(path.clone(), f);
        if !path.is_empty() {
            let parent = path.rsplit_once('/').map_or("", |(p, _)| p).to_string();
            children.entry(parent).or_default().push(path);
        }
    }

    let mut out = vec![0u8; CramfsSuper::SIZE];
    let mut nodes: Vec<Node> = Vec::new();

    fn emit(out: &mut Vec<u8>, name: &str, mode: u16, uid: u16) -> usize {
        let off = out.len();
        out.extend(
            CramfsInode {
                mode,
                uid,
                size_gid: 0,
                name_len_offset: 0,
            }
            .to_bytes(),
        );
        let padded = name.len().div_ceil(4) * 4;
        out.extend(name.as_bytes());
        out.resize(out.len() + (padded - name.len()), 0);
        off
    }

    #[allow(clippy::too_many_arguments)]
    fn layout_dir(
        out: &mut Vec<u8>,
        children: &BTreeMap<String, Vec<String>>,
        by_path: &std::collections::HashMap<String, &StagedFile>,
        nodes: &mut Vec<Node>,
        node_ids: &mut std::collections::HashMap<String, usize>,
        path: &str,
    ) -> (u32, u32) {
        let start = out.len() as u32;
        let mut dir_children: Vec<String> = Vec::new();
        for child_path in children.get(path).cloned().unwrap_or_default() {
            let f = by_path[&child_path];
            let name = child_path.rsplit_once('/').map_or(child_path.as_str(), |(_, n)| n);
            let mode = f.mode as u16;
            let uid = f.uid as u16;
            let inode_offset = emit(out, name, mode, uid);
            nodes.push(Node {
                path: child_path.clone(),
                mode,
                uid,
                gid: f.gid,
                data: f.data.clone(),
                inode_offset,
            });
            node_ids.insert(child_path.clone(), nodes.len() - 1);
            if mode & S_IFMT == S_IFDIR {
                dir_children.push(child_path);
            }
        }
        let size = out.len() as u32 - start;

        for child_path in dir_children {
            let (c_off, c_size) = layout_dir(out, children, by_path, nodes, node_ids, &child_path);
            let id = node_ids[&child_path];
            let gid = nodes[id].gid;
            let inode_offset = nodes[id].inode_offset;
            let size_gid = (gid << 24) | (c_size & 0x00ff_ffff);
            let name_len_offset = ((c_off >> 2) << 6) | (nodes[id].path.rsplit_once('/').map_or(nodes[id].path.as_str(), |(_, n)| n).len().div_ceil(4) as u32 & 0x3f);
            out[inode_offset + 4..inode_offset + 8].copy_from_slice(&size_gid.to_le_bytes());
            out[inode_offset + 8..inode_offset + 12].copy_from_slice(&name_len_offset.to_le_bytes());
        }
        (start, size)
    }

    let root_mode = u16::try_from(super::S_IFDIR | 0o755).unwrap_or(0);
    let root_inode_offset = emit(&mut out, "", root_mode, 0);
    let mut node_ids = std::collections::HashMap::new();
    let (root_off, root_size) = layout_dir(&mut out, &children, &by_path, &mut nodes, &mut node_ids, "");
    {
        let size_gid = root_size & 0x00ff_ffff;
        let name_len_offset = (root_off >> 2) << 6;
        out[root_inode_offset + 4..root_inode_offset + 8].copy_from_slice(&size_gid.to_le_bytes());
        out[root_inode_offset + 8..root_inode_offset + 12]
            .copy_from_slice(&name_len_offset.to_le_bytes());
    }

    // Pass 2: regular-file data regions, compressed to zlib level 9.
    let mut file_count = 0u32;
    for node in &nodes {
        if node.mode & S_IFMT == S_IFDIR {
            continue;
        }
        file_count += 1;
        let data_start = out.len() as u32;
        let n_blocks = node.data.len().div_ceil(BLOCK_SIZE);
        let table_start = out.len();
        out.resize(table_start + n_blocks * 4, 0);
        let mut end = (table_start + n_blocks * 4) as u32;
        for (i, chunk) in node.data.chunks(BLOCK_SIZE).enumerate() {
            let mut z = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(9));
            z.write_all(chunk)?;
            let compressed = z.finish().map_err(Error::Io)?;
            out.extend(&compressed);
            end += compressed.len() as u32;
            out[table_start + i * 4..table_start + i * 4 + 4].copy_from_slice(&end.to_le_bytes());
        }
        let gid = node.gid;
        let size = node.data.len() as u32;
        let size_gid = (gid << 24) | (size & 0x00ff_ffff);
        let name_len = node.path.rsplit_once('/').map_or(node.path.as_str(), |(_, n)| n).len();
        let name_len_offset = ((data_start >> 2) << 6) | ((name_len.div_ceil(4) as u32) & 0x3f);
        out[node.inode_offset + 4..node.inode_offset + 8].copy_from_slice(&size_gid.to_le_bytes());
        out[node.inode_offset + 8..node.inode_offset + 12]
            .copy_from_slice(&name_len_offset.to_le_bytes());
    }

    let super_header = CramfsSuper {
        magic: SUPER_MAGIC,
        size: out.len() as u32,
        flags: 0,
        future: 0,
        signature: *SIGNATURE,
        crc: 0,
        edition: 0,
        blocks: (out.len().div_ceil(BLOCK_SIZE)) as u32,
        files: file_count,
        name: *b"Compressed\0\0\0\0\0\0",
    };
    out[0..CramfsSuper::SIZE].copy_from_slice(&super_header.to_bytes());
    let mut crc_input = out.clone();
    crc_input[32..36].fill(0);
    let crc = crc32(&crc_input);
    out[32..36].copy_from_slice(&crc.to_le_bytes());

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn magic_and_signature_are_recognised() {
        let mut bad = vec![0u8; CramfsSuper::SIZE];
        assert!(!is_cramfs(&mut Cursor::new(&mut bad)));

        let good = CramfsSuper {
            magic: SUPER_MAGIC,
            size: 0,
            flags: 0,
            future: 0,
            signature: *SIGNATURE,
            crc: 0,
            edition: 0,
            blocks: 0,
            files: 0,
            name: [0u8; 16],
        };
        assert!(is_cramfs(&mut Cursor::new(good.to_bytes())));
    }

    #[test]
    fn round_trips_two_files_in_a_subdirectory() {
        let files = vec![
            StagedFile {
                path: "/a".to_string(),
                mode: u32::from(S_IFREG) | 0o644,
                uid: 0,
                gid: 0,
                data: b"hello".to_vec(),
            },
            StagedFile {
                path: "/sub".to_string(),
                mode: u32::from(S_IFDIR) | 0o755,
                uid: 0,
                gid: 0,
                data: Vec::new(),
            },
            StagedFile {
                path: "/sub/b".to_string(),
                mode: u32::from(S_IFREG) | 0o644,
                uid: 0,
                gid: 0,
                data: b"world".to_vec(),
            },
        ];
        let image = write_cramfs(&files).unwrap();
        let entries = read_cramfs(Cursor::new(image)).unwrap();

        let mut seen: Vec<(String, Vec<u8>)> = Vec::new();
        for mut e in entries {
            if e.is_regular() {
                let mut data = Vec::new();
                e.contents.as_mut().unwrap().read_to_end(&mut data).unwrap();
                seen.push((e.path, data));
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("/a".to_string(), b"hello".to_vec()),
                ("/sub/b".to_string(), b"world".to_vec()),
            ]
        );
    }
}
