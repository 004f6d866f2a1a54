//! Filesystem readers and writers: cramfs, ext2, FAT12/16 (+VFAT), axfs,
//! squashfs, cpio, tar, gzip, and the LZPT flash-block container, unified
//! behind [`UnixFile`] and the magic-sniffing [`read_archive`] dispatcher.
//!
//! Every reader materialises its directory/inode index eagerly (the
//! index is small and the spec allows it) but never a file's contents:
//! each [`UnixFile::contents`] is a lazy byte source — a
//! [`crate::io::FilePart`] or [`crate::io::ChunkedFile`] — that pulls
//! from the shared underlying source on first read.

pub mod axfs;
pub mod cpio;
pub mod cramfs;
pub mod ext2;
pub mod fat;
pub mod gzip;
pub mod lzpt;
pub mod squashfs;
pub mod tar;

use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom};

/// Regular file type bits (`S_IFREG`).
pub const S_IFREG: u32 = 0o100_000;
/// Directory type bits (`S_IFDIR`).
pub const S_IFDIR: u32 = 0o040_000;
/// Symlink type bits (`S_IFLNK`).
pub const S_IFLNK: u32 = 0o120_000;
const S_IFMT: u32 = 0o170_000;

/// One filesystem entry, as yielded by every archive reader.
///
/// `path` is absolute and slash-separated (`""` for a bare single-file
/// archive's one entry, `/...` inside a filesystem image). `contents` is
/// present for regular files and symlinks (the link target, for the
/// latter) and absent for directories.
pub struct UnixFile<'a> {
    /// Absolute, slash-separated path.
    pub path: String,
    /// Size in bytes, or `-1` if unknown/streaming.
    pub size: i64,
    /// Modification time, in seconds since the epoch (0 if the format carries none).
    pub mtime: u64,
    /// Unix mode bits: file type (`S_IFREG`/`S_IFDIR`/`S_IFLNK`) and permissions.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Lazy contents: file data for a regular file, link target for a symlink.
    pub contents: Option<Box<dyn Read + 'a>>,
}

impl UnixFile<'_> {
    /// True when `mode`'s type bits mark a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// True when `mode`'s type bits mark a regular file.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// True when `mode`'s type bits mark a symlink.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Probes `source` against every known archive format's magic test, in
/// the same order [`read_archive`] tries them. Leaves the cursor
/// wherever the last probe left it.
///
/// Each format's `is_*`/`read_*` pair stays generic over the caller's
/// concrete reader rather than going through a type-erased dispatch
/// table: a `Probe` list of `(isFn, readFn)` pairs only works when every
/// entry shares one instantiation, so this tries each format in turn
/// against the same `source` instead. Whichever magic test fires first
/// wins, so formats whose headers could otherwise collide are ordered
/// most-specific first.
pub fn is_archive<R: Read + Seek>(source: &mut R) -> Result<bool> {
    macro_rules! probe {
        ($is:expr) => {{
            source.seek(SeekFrom::Start(0))?;
            if $is(source) {
                return Ok(true);
            }
        }};
    }
    probe!(cramfs::is_cramfs);
    probe!(squashfs::is_squashfs);
    probe!(ext2::is_ext2);
    probe!(axfs::is_axfs);
    probe!(fat::is_fat);
    probe!(gzip::is_gzip);
    probe!(cpio::is_cpio);
    probe!(tar::is_tar);
    Ok(false)
}

/// Detects the format of `source` and delegates to its reader.
pub fn read_archive<R: Read + Seek + 'static>(mut source: R) -> Result<Vec<UnixFile<'static>>> {
    macro_rules! probe {
        ($is:expr, $read:expr) => {{
            source.seek(SeekFrom::Start(0))?;
            if $is(&mut source) {
                source.seek(SeekFrom::Start(0))?;
                return $read(source);
            }
        }};
    }
    probe!(cramfs::is_cramfs, cramfs::read_cramfs);
    probe!(squashfs::is_squashfs, squashfs::read_squashfs);
    probe!(ext2::is_ext2, ext2::read_ext2);
    probe!(axfs::is_axfs, axfs::read_axfs);
    probe!(fat::is_fat, fat::read_fat);
    probe!(gzip::is_gzip, gzip::read_gzip);
    probe!(cpio::is_cpio, cpio::read_cpio);
    probe!(tar::is_tar, tar::read_tar);
    Err(Error::WrongMagic(
        "no archive reader recognised this input".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bit_classification() {
        let dir = UnixFile {
            path: "/a".to_string(),
            size: 0,
            mtime: 0,
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            contents: None,
        };
        assert!(dir.is_dir());
        assert!(!dir.is_regular());

        let link = UnixFile {
            path: "/b".to_string(),
            size: 3,
            mtime: 0,
            mode: S_IFLNK | 0o777,
            uid: 0,
            gid: 0,
            contents: Some(Box::new(std::io::Cursor::new(b"../c".to_vec()))),
        };
        assert!(link.is_symlink());
    }
}
