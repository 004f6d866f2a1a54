//! axfs ("Advanced XIP FS"): a flash filesystem built around an 18-region
//! columnar table layout — some regions are raw byte ranges (string pool,
//! XIP pages, byte-aligned files, zlib-compressed blocks), the rest are
//! per-inode integer arrays packed as fixed-width byte planes. Grounded on
//! `fwtool/archive/axfs.py`.
//!
//! The 18-region count comes straight from the header's 144-byte `regions`
//! table (144 / 8-byte offsets = 18): four raw regions followed by
//! fourteen table regions.

use super::UnixFile;
use crate::error::{Error, Result};
use crate::structio::wire_struct;
use std::io::{Cursor, Read, Seek};

wire_struct! {
    be struct AxfsHeader {
        magic: [u8; 4],
        signature: [u8; 16],
        digest: [u8; 40],
        block_size: u32,
        files: u64,
        size: u64,
        blocks: u64,
        mmap_size: u64,
        regions: [u8; 144],
        _reserved: [u8; 13],
    }
}

wire_struct! {
    be struct AxfsRegionDesc {
        offset: u64,
        size: u64,
        compressed_size: u64,
        max_index: u64,
        table_byte_depth: u8,
        incore: u8,
    }
}

const MAGIC: [u8; 4] = [0x48, 0xa0, 0xe4, 0xcd];
const SIGNATURE: &[u8; 16] = b"Advanced XIP FS\0";

/// Region names in table order, matching the header's region-descriptor
/// offset table slot-for-slot. The first four are raw byte ranges; the
/// rest are per-inode integer arrays.
const REGIONS: [&str; 18] = [
    "strings",
    "xip",
    "byteAligned",
    "compressed",
    "nodeType",
    "nodeIndex",
    "cnodeOffset",
    "cnodeIndex",
    "banodeOffset",
    "cblockOffset",
    "fileSize",
    "nameOffset",
    "numEntries",
    "modeIndex",
    "arrayIndex",
    "modes",
    "uids",
    "gids",
];

/// Sniffs the magic and the `"Advanced XIP FS\0"` signature string.
pub fn is_axfs<R: Read + Seek>(source: &mut R) -> bool {
    let Some(header) = AxfsHeader::read_opt(source) else {
        return false;
    };
    header.magic == MAGIC && &header.signature == SIGNATURE
}

struct Tables {
    strings: Vec<u8>,
    xip: Vec<u8>,
    byte_aligned: Vec<u8>,
    compressed: Vec<u8>,
    arrays: std::collections::HashMap<&'static str, Vec<u64>>,
}

fn region_offset(regions: &[u8; 144], index: usize) -> u64 {
    let base = index * 8;
    u64::from_be_bytes(regions[base..base + 8].try_into().unwrap())
}

fn read_tables(data: &[u8], header: &AxfsHeader) -> Result<Tables> {
    let mut raw: Vec<Vec<u8>> = Vec::with_capacity(4);
    let mut arrays = std::collections::HashMap::new();

    for (i, name) in REGIONS.iter().enumerate() {
        let desc_offset = region_offset(&header.regions, i) as usize;
        let desc_bytes = data
            .get(desc_offset..desc_offset + AxfsRegionDesc::SIZE)
            .ok_or_else(|| Error::Truncated(format!("axfs region descriptor {name}")))?;
        let desc = AxfsRegionDesc::from_bytes(desc_bytes)
            .ok_or_else(|| Error::Truncated(format!("axfs region descriptor {name}")))?;
        let region_data = data
            .get(desc.offset as usize..(desc.offset + desc.size) as usize)
            .ok_or_else(|| Error::Truncated(format!("axfs region body {name}")))?;

        if i < 4 {
            raw.push(region_data.to_vec());
        } else {
            let depth = desc.table_byte_depth as usize;
            let max_index = desc.max_index as usize;
            let mut values = Vec::with_capacity(max_index);
            for idx in 0..max_index {
                let mut value: u64 = 0;
                for j in 0..depth {
                    let byte = *region_data
                        .get(j * max_index + idx)
                        .ok_or_else(|| Error::Truncated(format!("axfs table {name}")))?;
                    value |= u64::from(byte) << (8 * j);
                }
                values.push(value);
            }
            arrays.insert(*name, values);
        }
    }

    Ok(Tables {
        strings: raw[0].clone(),
        xip: raw[1].clone(),
        byte_aligned: raw[2].clone(),
        compressed: raw[3].clone(),
        arrays,
    })
}

fn table<'a>(tables: &'a Tables, name: &str) -> Result<&'a [u64]> {
    tables
        .arrays
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Malformed(format!("axfs table '{name}' missing")))
}

fn read_name(strings: &[u8], offset: usize) -> Result<String> {
    let end = strings[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .ok_or_else(|| Error::Malformed("axfs name not nul-terminated".to_string()))?;
    Ok(String::from_utf8_lossy(&strings[offset..end]).into_owned())
}

fn read_contents(tables: &Tables, array_index: u64, num_entries: u64, size: u64) -> Result<Vec<u8>> {
    let node_type = table(tables, "nodeType")?;
    let node_index = table(tables, "nodeIndex")?;
    let cnode_index = table(tables, "cnodeIndex")?;
    let cblock_offset = table(tables, "cblockOffset")?;
    let banode_offset = table(tables, "banodeOffset")?;

    let mut out = Vec::new();
    for i in 0..num_entries {
        let slot = (array_index + i) as usize;
        let ty = *node_type
            .get(slot)
            .ok_or_else(|| Error::Malformed("axfs nodeType index out of range".to_string()))?;
        let index = *node_index
            .get(slot)
            .ok_or_else(|| Error::Malformed("axfs nodeIndex index out of range".to_string()))? as usize;
        match ty {
            0 => {
                let offset = index << 12;
                let end = (offset + 4096).min(tables.xip.len());
                out.extend_from_slice(&tables.xip[offset.min(end)..end]);
            }
            1 => {
                let cnode = *cnode_index
                    .get(index)
                    .ok_or_else(|| Error::Malformed("axfs cnodeIndex out of range".to_string()))? as usize;
                let offset = *cblock_offset
                    .get(cnode)
                    .ok_or_else(|| Error::Malformed("axfs cblockOffset out of range".to_string()))? as usize;
                let compressed = tables
                    .compressed
                    .get(offset..)
                    .ok_or_else(|| Error::Truncated("axfs compressed block".to_string()))?;
                let mut decoder = flate2::read::ZlibDecoder::new(compressed);
                let mut block = Vec::new();
                decoder
                    .read_to_end(&mut block)
                    .map_err(|e| Error::Malformed(format!("axfs zlib block: {e}")))?;
                out.extend(block);
            }
            2 => {
                let offset = *banode_offset
                    .get(index)
                    .ok_or_else(|| Error::Malformed("axfs banodeOffset out of range".to_string()))? as usize;
                let end = (offset + size as usize).min(tables.byte_aligned.len());
                out.extend_from_slice(&tables.byte_aligned[offset.min(end)..end]);
            }
            other => {
                return Err(Error::Unsupported(format!("axfs node type {other}")));
            }
        }
    }
    Ok(out)
}

fn visit(tables: &Tables, id: u64, path_prefix: &str, out: &mut Vec<UnixFile<'static>>) -> Result<()> {
    let file_size = *table(tables, "fileSize")?
        .get(id as usize)
        .ok_or_else(|| Error::Malformed("axfs fileSize index out of range".to_string()))?;
    let name_offset = *table(tables, "nameOffset")?
        .get(id as usize)
        .ok_or_else(|| Error::Malformed("axfs nameOffset index out of range".to_string()))? as usize;
    let name = read_name(&tables.strings, name_offset)?;
    let mode_index = *table(tables, "modeIndex")?
        .get(id as usize)
        .ok_or_else(|| Error::Malformed("axfs modeIndex index out of range".to_string()))? as usize;
    let mode = *table(tables, "modes")?
        .get(mode_index)
        .ok_or_else(|| Error::Malformed("axfs modes index out of range".to_string()))? as u32;
    let uid = *table(tables, "uids")?
        .get(mode_index)
        .ok_or_else(|| Error::Malformed("axfs uids index out of range".to_string()))? as u32;
    let gid = *table(tables, "gids")?
        .get(mode_index)
        .ok_or_else(|| Error::Malformed("axfs gids index out of range".to_string()))? as u32;
    let num_entries = *table(tables, "numEntries")?
        .get(id as usize)
        .ok_or_else(|| Error::Malformed("axfs numEntries index out of range".to_string()))?;
    let array_index = *table(tables, "arrayIndex")?
        .get(id as usize)
        .ok_or_else(|| Error::Malformed("axfs arrayIndex index out of range".to_string()))?;

    let path = if id == 0 {
        String::new()
    } else {
        format!("{path_prefix}{name}")
    };
    let is_dir = mode & super::S_IFMT == super::S_IFDIR;

    let contents = if is_dir {
        None
    } else {
        let bytes = read_contents(tables, array_index, num_entries, file_size)?;
        Some(Box::new(Cursor::new(bytes)) as Box<dyn Read>)
    };

    out.push(UnixFile {
        path: path.clone(),
        size: if is_dir { 0 } else { file_size as i64 },
        mtime: 0,
        mode,
        uid,
        gid,
        contents,
    });

    if is_dir {
        let child_prefix = format!("{path}/");
        for i in 0..num_entries {
            visit(tables, array_index + i, &child_prefix, out)?;
        }
    }
    Ok(())
}

/// Reads an axfs image: the header, its 18-region table, then a
/// depth-first walk of the inode tree starting at inode 0 (the root
/// directory).
pub fn read_axfs<R: Read + Seek>(mut source: R) -> Result<Vec<UnixFile<'static>>> {
    let mut data = Vec::new();
    source.read_to_end(&mut data)?;

    let header_bytes = data
        .get(0..AxfsHeader::SIZE)
        .ok_or_else(|| Error::Truncated("axfs header".to_string()))?;
    let header =
        AxfsHeader::from_bytes(header_bytes).ok_or_else(|| Error::Truncated("axfs header".to_string()))?;
    if header.magic != MAGIC || &header.signature != SIGNATURE {
        return Err(Error::WrongMagic("axfs header".to_string()));
    }

    let tables = read_tables(&data, &header)?;
    let mut out = Vec::new();
    visit(&tables, 0, "", &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; AxfsHeader::SIZE];
        assert!(!is_axfs(&mut Cursor::new(data)));
    }

    #[test]
    fn region_table_has_eighteen_slots() {
        assert_eq!(REGIONS.len(), 144 / 8);
    }
}
