//! FAT12/16 with VFAT long names: the filesystem most pre-2010 camera
//! bodies shipped as their `'U'` flashable image before cramfs took over.
//! Grounded on `fwtool/archive/fat.py`.

use super::{UnixFile, S_IFDIR, S_IFLNK, S_IFREG};
use crate::error::{Error, Result};
use crate::structio::wire_struct;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

wire_struct! {
    le struct FatHeader {
        jump: [u8; 3],
        oem_name: [u8; 8],
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
        reserved_sectors: u16,
        fat_copies: u8,
        root_entries: u16,
        sectors: u16,
        media_descriptor: u8,
        sectors_per_fat: u16,
        _reserved1: [u8; 14],
        extended_signature: u8,
        serial_number: u32,
        volume_label: [u8; 11],
        fs_type: [u8; 8],
        _reserved2: [u8; 448],
        signature: [u8; 2],
    }
}

wire_struct! {
    le struct FatDirEntry {
        name: [u8; 8],
        ext: [u8; 3],
        attr: u8,
        _reserved1: u8,
        ctime_cs: u8,
        _reserved2: [u8; 8],
        time: u16,
        date: u16,
        cluster: u16,
        size: u32,
    }
}

wire_struct! {
    le struct VfatDirEntry {
        sequence: u8,
        name1: [u8; 10],
        attr: u8,
        _reserved1: u8,
        checksum: u8,
        name2: [u8; 12],
        _reserved2: [u8; 2],
        name3: [u8; 4],
    }
}

const SIGNATURE: [u8; 2] = [0x55, 0xaa];
const EXTENDED_SIGNATURE: u8 = 0x29;
const VFAT_ATTR: u8 = 0x0f;

/// Sniffs the boot-sector signature, extended-signature byte, and a
/// `FAT`-prefixed `fsType` string.
pub fn is_fat<R: Read>(source: &mut R) -> bool {
    let Some(header) = FatHeader::read_opt(source) else {
        return false;
    };
    header.signature == SIGNATURE
        && header.extended_signature == EXTENDED_SIGNATURE
        && header.fs_type.starts_with(b"FAT")
}

struct Layout {
    fat_offset: u64,
    root_offset: u64,
    data_offset: u64,
    cluster_bytes: u64,
    end_marker: u32,
}

fn read_cluster_table<R: Read + Seek>(
    source: &mut R,
    header: &FatHeader,
    layout: &Layout,
) -> Result<Vec<u32>> {
    source.seek(SeekFrom::Start(layout.fat_offset))?;
    let fat_bytes = u64::from(header.sectors_per_fat) * u64::from(header.bytes_per_sector);
    let mut raw = vec![0u8; fat_bytes as usize];
    source.read_exact(&mut raw)?;

    let clusters = if header.fs_type == *b"FAT12   " {
        raw.chunks_exact(3)
            .flat_map(|chunk| {
                let packed = u32::from(chunk[0]) | (u32::from(chunk[1]) << 8) | (u32::from(chunk[2]) << 16);
                [packed & 0xfff, (packed >> 12) & 0xfff]
            })
            .collect()
    } else if header.fs_type == *b"FAT16   " {
        raw.chunks_exact(2)
            .map(|chunk| u32::from(u16::from_le_bytes([chunk[0], chunk[1]])))
            .collect()
    } else {
        return Err(Error::Unsupported(format!(
            "unknown FAT width: {:?}",
            String::from_utf8_lossy(&header.fs_type)
        )));
    };
    Ok(clusters)
}

/// Walks one cluster chain, concatenating whole clusters. Bounded by the
/// cluster table's own length so a chain cycle fails closed instead of
/// looping forever.
fn read_chain<R: Read + Seek>(
    source: &mut R,
    clusters: &[u32],
    layout: &Layout,
    start: u32,
    size: u32,
    is_dir: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut cluster = start;
    let mut steps = 0usize;
    while cluster != 0 && cluster != layout.end_marker && (is_dir || (out.len() as u32) < size) {
        if steps > clusters.len() + 1 {
            return Err(Error::Malformed(
                "fat cluster chain exceeds cluster count (cycle?)".to_string(),
            ));
        }
        steps += 1;
        let offset = layout.data_offset + u64::from(cluster - 2) * layout.cluster_bytes;
        source.seek(SeekFrom::Start(offset))?;
        let mut block = vec![0u8; layout.cluster_bytes as usize];
        source.read_exact(&mut block)?;
        out.extend(block);
        cluster = *clusters
            .get(cluster as usize)
            .ok_or_else(|| Error::Malformed("fat cluster chain index out of range".to_string()))?;
    }
    if !is_dir {
        out.truncate(size as usize);
    }
    Ok(out)
}

fn le_u16_units(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]))
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (i64::from(m) + 9) % 12;
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// DOS date/time (days since 1980, 2-second resolution) to Unix seconds.
fn dos_to_unix(date: u16, time: u16) -> u64 {
    let year = 1980 + i64::from(date >> 9);
    let month = u32::from((date >> 5) & 0xf);
    let day = u32::from(date & 0x1f);
    if month == 0 || day == 0 {
        return 0;
    }
    let hour = i64::from(time >> 11);
    let minute = i64::from((time >> 5) & 0x3f);
    let second = i64::from((time & 0x1f) * 2);
    let days = days_from_civil(year, month, day);
    (days * 86400 + hour * 3600 + minute * 60 + second).max(0) as u64
}

fn unix_to_dos(mtime: u64) -> (u16, u16) {
    let days = (mtime / 86400) as i64;
    let secs = mtime % 86400;
    let (year, month, day) = civil_from_days(days);
    let hour = secs / 3600;
    let minute = (secs % 3600) / 60;
    let second = secs % 60;
    let date = ((year - 1980).max(0) as u16) << 9 | (month as u16) << 5 | day as u16;
    let time = (hour as u16) << 11 | (minute as u16) << 5 | (second / 2) as u16;
    (date, time)
}

fn parse_dir<R: Read + Seek>(
    source: &mut R,
    clusters: &[u32],
    layout: &Layout,
    entries: &[u8],
    path: &str,
    out: &mut Vec<UnixFile<'static>>,
) -> Result<()> {
    let mut offset = 0usize;
    let mut vfat_units: Vec<u16> = Vec::new();
    while offset < entries.len() && entries[offset] != 0 {
        let Some(entry) = FatDirEntry::from_bytes(&entries[offset..]) else {
            break;
        };
        if entry.name[0] != 0xe5 {
            if entry.attr == VFAT_ATTR {
                if let Some(v) = VfatDirEntry::from_bytes(&entries[offset..]) {
                    let mut piece: Vec<u16> = le_u16_units(&v.name1).collect();
                    piece.extend(le_u16_units(&v.name2));
                    piece.extend(le_u16_units(&v.name3));
                    piece.extend(vfat_units.drain(..));
                    vfat_units = piece;
                }
            } else {
                let name = if !vfat_units.is_empty() {
                    let units = std::mem::take(&mut vfat_units);
                    String::from_utf16_lossy(&units)
                        .trim_end_matches(['\0', '\u{ffff}'])
                        .to_string()
                } else {
                    let mut raw_name = entry.name;
                    if raw_name[0] == 0x05 {
                        raw_name[0] = 0xe5;
                    }
                    let name = String::from_utf8_lossy(&raw_name).trim_end().to_string();
                    let ext = String::from_utf8_lossy(&entry.ext).trim_end().to_string();
                    if ext.is_empty() {
                        name
                    } else {
                        format!("{name}.{ext}")
                    }
                };

                if name != "." && name != ".." {
                    let is_link = entry.attr & 0x04 != 0 && entry.ctime_cs & 0xe1 == 0x21;
                    let is_dir = entry.attr & 0x10 != 0;
                    let entry_path = format!("{path}/{name}");
                    let contents = read_chain(
                        source,
                        clusters,
                        layout,
                        u32::from(entry.cluster),
                        entry.size,
                        is_dir,
                    )?;
                    let mode = if is_dir {
                        S_IFDIR
                    } else if is_link {
                        S_IFLNK
                    } else {
                        S_IFREG
                    };
                    out.push(UnixFile {
                        path: entry_path.clone(),
                        size: if is_dir { 0 } else { i64::from(entry.size) },
                        mtime: dos_to_unix(entry.date, entry.time),
                        mode,
                        uid: 0,
                        gid: 0,
                        contents: if is_dir {
                            None
                        } else {
                            Some(Box::new(Cursor::new(contents.clone())) as Box<dyn Read>)
                        },
                    });
                    if is_dir {
                        parse_dir(source, clusters, layout, &contents, &entry_path, out)?;
                    }
                }
            }
        }
        offset += FatDirEntry::SIZE;
    }
    Ok(())
}

/// Reads a FAT12/16 image: the boot sector, then the cluster table, then
/// the root directory recursively, resolving VFAT long-name entries as it
/// goes and every cluster chain through [`read_chain`].
pub fn read_fat<R: Read + Seek>(mut source: R) -> Result<Vec<UnixFile<'static>>> {
    let header = FatHeader::read_from(&mut source)?;
    if header.signature != SIGNATURE || header.extended_signature != EXTENDED_SIGNATURE {
        return Err(Error::WrongMagic("fat boot sector".to_string()));
    }

    let fat_offset = u64::from(header.reserved_sectors) * u64::from(header.bytes_per_sector);
    let root_offset =
        fat_offset + u64::from(header.fat_copies) * u64::from(header.sectors_per_fat) * u64::from(header.bytes_per_sector);
    let root_bytes = u64::from(header.root_entries) * FatDirEntry::SIZE as u64;
    let root_sectors = root_bytes.div_ceil(u64::from(header.bytes_per_sector));
    let data_offset = root_offset + root_sectors * u64::from(header.bytes_per_sector);
    let end_marker = if header.fs_type == *b"FAT12   " {
        0xfff
    } else {
        0xffff
    };

    let layout = Layout {
        fat_offset,
        root_offset,
        data_offset,
        cluster_bytes: u64::from(header.sectors_per_cluster) * u64::from(header.bytes_per_sector),
        end_marker,
    };
    let clusters = read_cluster_table(&mut source, &header, &layout)?;

    source.seek(SeekFrom::Start(layout.root_offset))?;
    let mut root_entries = vec![0u8; (layout.data_offset - layout.root_offset) as usize];
    source.read_exact(&mut root_entries)?;

    let mut out = Vec::new();
    parse_dir(&mut source, &clusters, &layout, &root_entries, "", &mut out)?;
    Ok(out)
}

/// One file or empty directory to stage into a freshly-written image.
pub struct StagedFile {
    /// Absolute, slash-separated path (matching [`UnixFile::path`]).
    pub path: String,
    /// Unix mode bits: file type plus permissions (permissions are
    /// dropped — FAT carries none).
    pub mode: u32,
    /// Modification time in Unix seconds, quantised to FAT's 2-second resolution.
    pub mtime: u64,
    /// File contents; empty for directories.
    pub data: Vec<u8>,
}

const S_IFMT: u32 = 0o170_000;

fn short_name(basename: &str) -> ([u8; 8], [u8; 3]) {
    let upper = basename.to_uppercase();
    let (stem, ext) = upper.split_once('.').unwrap_or((&upper, ""));
    let mut name = [b' '; 8];
    for (i, b) in stem.bytes().take(8).enumerate() {
        name[i] = b;
    }
    let mut ext_bytes = [b' '; 3];
    for (i, b) in ext.bytes().take(3).enumerate() {
        ext_bytes[i] = b;
    }
    (name, ext_bytes)
}

fn short_name_checksum(name: &[u8; 8], ext: &[u8; 3]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name.iter().chain(ext.iter()) {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

fn vfat_chunks(basename: &str) -> Vec<[u8; 26]> {
    let mut units: Vec<u16> = basename.encode_utf16().collect();
    units.push(0);
    units
        .chunks(13)
        .map(|chunk| {
            let mut buf = [0xffu8; 26];
            for (i, u) in chunk.iter().enumerate() {
                buf[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
            }
            buf
        })
        .collect()
}

struct WriteCtx {
    out: Vec<u8>,
    clusters: Vec<u32>,
    data_offset: u64,
    cluster_bytes: u64,
    dirs: Vec<(String, u32)>,
}

impl WriteCtx {
    /// Writes `data` into fresh clusters, returning `(first_cluster, len)`.
    fn write_data(&mut self, data: &[u8]) -> (u32, u32) {
        let nc = data.len().div_ceil(self.cluster_bytes as usize);
        let first_cluster = self.clusters.len() as u32;
        if nc > 0 {
            let offset = self.data_offset + u64::from(first_cluster - 2) * self.cluster_bytes;
            let end = offset as usize + data.len();
            if end > self.out.len() {
                self.out.resize(end, 0);
            }
            self.out[offset as usize..end].copy_from_slice(data);
        }
        for i in 0..nc {
            let next = if i + 1 < nc {
                (self.clusters.len() + 1) as u32
            } else {
                0xfff
            };
            self.clusters.push(next);
        }
        let fc = if nc > 0 { first_cluster } else { 0 };
        (fc, data.len() as u32)
    }
}

fn dir_entries(parent_cluster: u32, cluster: u32) -> Vec<u8> {
    let dot = FatDirEntry {
        name: *b".       ",
        ext: *b"   ",
        attr: 0x10,
        _reserved1: 0,
        ctime_cs: 0,
        _reserved2: [0u8; 8],
        time: 0,
        date: 0,
        cluster,
        size: 0,
    };
    let dotdot = FatDirEntry {
        name: *b"..      ",
        ext: *b"   ",
        attr: 0x10,
        _reserved1: 0,
        ctime_cs: 0,
        _reserved2: [0u8; 8],
        time: 0,
        date: 0,
        cluster: parent_cluster,
        size: 0,
    };
    let mut out = dot.to_bytes();
    out.extend(dotdot.to_bytes());
    out
}

fn write_dir(
    ctx: &mut WriteCtx,
    children: &BTreeMap<String, BTreeSet<String>>,
    by_path: &BTreeMap<String, &StagedFile>,
    path: &str,
) -> Vec<u8> {
    let mut data = if path.is_empty() {
        Vec::new()
    } else {
        dir_entries(0, 0)
    };
    let Some(kids) = children.get(path) else {
        return data;
    };
    for child_path in kids {
        let placeholder = StagedFile {
            path: child_path.clone(),
            mode: super::S_IFDIR | 0o775,
            mtime: 0,
            data: Vec::new(),
        };
        let file = by_path.get(child_path).copied().unwrap_or(&placeholder);
        let is_dir = file.mode & S_IFMT == super::S_IFDIR;
        let is_link = file.mode & S_IFMT == super::S_IFLNK;

        let child_data = if is_dir {
            write_dir(ctx, children, by_path, child_path)
        } else {
            file.data.clone()
        };
        let (cluster, written) = ctx.write_data(&child_data);
        if is_dir {
            ctx.dirs.push((child_path.clone(), cluster));
        }

        let basename = child_path.rsplit('/').next().unwrap_or(child_path);
        let (name, ext) = short_name(basename);
        let checksum = short_name_checksum(&name, &ext);

        let chunks = vfat_chunks(basename);
        for (i, chunk) in chunks.iter().enumerate().rev() {
            let sequence = (i as u8 + 1) | if i == chunks.len() - 1 { 0x40 } else { 0 };
            let entry = VfatDirEntry {
                sequence,
                name1: chunk[0..10].try_into().unwrap(),
                attr: VFAT_ATTR,
                _reserved1: 0,
                checksum,
                name2: chunk[10..22].try_into().unwrap(),
                _reserved2: [0u8; 2],
                name3: chunk[22..26].try_into().unwrap(),
            };
            data.extend(entry.to_bytes());
        }

        let (date, time) = unix_to_dos(file.mtime);
        let entry = FatDirEntry {
            name,
            ext,
            attr: if is_dir { 0x10 } else if is_link { 0x04 } else { 0 },
            _reserved1: 0,
            ctime_cs: if is_link { 0x21 } else { 0 },
            _reserved2: [0u8; 8],
            time,
            date,
            cluster,
            size: if is_dir { 0 } else { written },
        };
        data.extend(entry.to_bytes());
    }
    data
}

/// Writes a FAT12 image of exactly `size` bytes containing `files`,
/// building the VFAT long-name chain and 8.3 short-name checksum for
/// every entry and laying out directories depth-first.
pub fn write_fat(files: &[StagedFile], size: u64) -> Result<Vec<u8>> {
    let sector_size: u64 = 0x200;
    let cluster_size: u64 = 0x4000;
    let sectors = size / sector_size;
    let fat_size = (size / cluster_size + 1) / 2 * 3;
    let fat_sectors = fat_size.div_ceil(sector_size);

    let header = FatHeader {
        jump: [0xeb, 0x00, 0x90],
        oem_name: [0u8; 8],
        bytes_per_sector: sector_size as u16,
        sectors_per_cluster: (cluster_size / sector_size) as u8,
        reserved_sectors: 1,
        fat_copies: 1,
        root_entries: (cluster_size / FatDirEntry::SIZE as u64) as u16,
        sectors: sectors as u16,
        media_descriptor: 0xf8,
        sectors_per_fat: fat_sectors as u16,
        _reserved1: [0u8; 14],
        extended_signature: EXTENDED_SIGNATURE,
        serial_number: 0,
        volume_label: [b' '; 11],
        fs_type: *b"FAT12   ",
        _reserved2: [0u8; 448],
        signature: SIGNATURE,
    };

    let mut out = vec![0u8; size as usize];
    out[0..FatHeader::SIZE].copy_from_slice(&header.to_bytes());

    let fat_offset = sector_size;
    let root_offset = fat_offset + fat_sectors * sector_size;
    let data_offset = root_offset + cluster_size;

    let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    children.entry(String::new()).or_default();
    let mut by_path = BTreeMap::new();
    for f in files {
        by_path.insert(f.path.clone(), f);
        let mut path = f.path.clone();
        while !path.is_empty() {
            let parent = match path.rsplit_once('/') {
                Some((p, _)) => p.to_string(),
                None => String::new(),
            };
            children.entry(parent.clone()).or_default().insert(path.clone());
            path = parent;
        }
    }

    let mut ctx = WriteCtx {
        out,
        clusters: vec![0xff8, 0xfff],
        data_offset,
        cluster_bytes: cluster_size,
        dirs: Vec::new(),
    };

    let root = write_dir(&mut ctx, &children, &by_path, "");
    let root_region = &mut ctx.out[root_offset as usize..(root_offset + cluster_size) as usize];
    root_region[..root.len()].copy_from_slice(&root);

    let dirs = ctx.dirs.clone();
    for (path, cluster) in &dirs {
        let parent = match path.rsplit_once('/') {
            Some(("", _)) => 0,
            Some((p, _)) => dirs.iter().find(|(dp, _)| dp == p).map_or(0, |(_, c)| *c),
            None => 0,
        };
        let offset = data_offset + u64::from(*cluster - 2) * cluster_size;
        let entries = dir_entries(parent, *cluster);
        ctx.out[offset as usize..offset as usize + entries.len()].copy_from_slice(&entries);
    }

    let mut fat_bytes = Vec::new();
    let mut i = 0;
    while i < ctx.clusters.len() {
        let lo = ctx.clusters[i];
        let hi = if i + 1 < ctx.clusters.len() {
            ctx.clusters[i + 1]
        } else {
            0
        };
        let packed = lo | (hi << 12);
        fat_bytes.extend_from_slice(&packed.to_le_bytes()[..3]);
        i += 2;
    }
    let fat_region = &mut ctx.out[fat_offset as usize..(fat_offset + fat_sectors * sector_size) as usize];
    fat_region[..fat_bytes.len().min(fat_region.len())]
        .copy_from_slice(&fat_bytes[..fat_bytes.len().min(fat_region.len())]);

    let mut sink = Cursor::new(Vec::new());
    sink.write_all(&ctx.out)?;
    Ok(sink.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; 512];
        assert!(!is_fat(&mut Cursor::new(data)));
    }

    #[test]
    fn short_name_checksum_matches_reference_values() {
        let (name, ext) = short_name("AUTORUN.INF");
        let checksum = short_name_checksum(&name, &ext);
        let (name2, ext2) = short_name("autorun.inf");
        assert_eq!(checksum, short_name_checksum(&name2, &ext2));
    }

    #[test]
    fn round_trips_a_small_tree_with_long_names() {
        let files = vec![
            StagedFile {
                path: "/a-very-long-filename.txt".to_string(),
                mode: super::super::S_IFREG | 0o644,
                mtime: 1_700_000_000,
                data: b"hello world".to_vec(),
            },
            StagedFile {
                path: "/sub".to_string(),
                mode: super::super::S_IFDIR | 0o755,
                mtime: 1_700_000_000,
                data: Vec::new(),
            },
            StagedFile {
                path: "/sub/child.bin".to_string(),
                mode: super::super::S_IFREG | 0o644,
                mtime: 1_700_000_000,
                data: vec![1, 2, 3, 4],
            },
        ];
        let image = write_fat(&files, 1024 * 1024).unwrap();
        assert!(is_fat(&mut Cursor::new(image.clone())));

        let entries = read_fat(Cursor::new(image)).unwrap();
        let long = entries
            .iter()
            .find(|e| e.path == "/a-very-long-filename.txt")
            .expect("long name round-trips");
        assert!(long.is_regular());

        let sub = entries.iter().find(|e| e.path == "/sub").expect("subdir present");
        assert!(sub.is_dir());

        let mut bytes = Vec::new();
        let mut child = entries
            .into_iter()
            .find(|e| e.path == "/sub/child.bin")
            .expect("nested file present")
            .contents
            .expect("regular file has contents");
        child.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn dos_unix_time_round_trips_to_two_second_resolution() {
        let mtime = 1_700_000_000u64 / 2 * 2;
        let (date, time) = unix_to_dos(mtime);
        assert_eq!(dos_to_unix(date, time), mtime);
    }
}
