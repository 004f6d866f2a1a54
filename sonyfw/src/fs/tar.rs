//! A thin `UnixFile` wrapper around the [`tar`] crate: used for the
//! on-device firmware archive embedded in `FDAT` and, less often, as the
//! `'U'` filesystem image itself. Grounded on `fwtool/archive/tar.py`,
//! which does the equivalent wrapping around Python's `tarfile`.

use super::UnixFile;
use crate::error::{Error, Result};
use std::io::{Cursor, Read};
use tar::EntryType;

const MAGIC: &[u8; 6] = b"ustar\0";
const MAGIC_OFFSET: usize = 257;

const S_IFCHR: u32 = 0o020_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFIFO: u32 = 0o010_000;

fn convert_file_type(entry_type: EntryType) -> u32 {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => super::S_IFREG,
        EntryType::Link | EntryType::Symlink => super::S_IFLNK,
        EntryType::Char => S_IFCHR,
        EntryType::Block => S_IFBLK,
        EntryType::Directory => super::S_IFDIR,
        EntryType::Fifo => S_IFIFO,
        _ => super::S_IFREG,
    }
}

/// Sniffs the `ustar\0` magic at offset 257, the standard USTAR header layout.
pub fn is_tar<R: Read>(source: &mut R) -> bool {
    let mut buf = [0u8; MAGIC_OFFSET + 6];
    if source.read_exact(&mut buf).is_err() {
        return false;
    }
    &buf[MAGIC_OFFSET..MAGIC_OFFSET + 6] == MAGIC
}

/// Reads every entry of a USTAR tar archive, materialising contents
/// eagerly (the underlying reader is consumed streaming, entry by entry,
/// same as the original's `tarfile` iteration).
pub fn read_tar<R: Read>(source: R) -> Result<Vec<UnixFile<'static>>> {
    let mut archive = tar::Archive::new(source);
    let mut out = Vec::new();
    let entries = archive.entries().map_err(Error::Io)?;
    for entry in entries {
        let mut entry = entry.map_err(Error::Io)?;
        let header = entry.header().clone();
        let entry_type = header.entry_type();
        let path = entry.path().map_err(Error::Io)?.to_string_lossy().into_owned();
        let permissions = header.mode().map_err(Error::Io)?;
        let mode = convert_file_type(entry_type) | (permissions & 0o7777);
        let uid = header.uid().map_err(Error::Io)? as u32;
        let gid = header.gid().map_err(Error::Io)? as u32;
        let mtime = header.mtime().map_err(Error::Io)?;
        let size = header.size().map_err(Error::Io)?;

        let contents = if entry_type == EntryType::Directory {
            None
        } else {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(Error::Io)?;
            Some(Box::new(Cursor::new(data)) as Box<dyn Read>)
        };

        out.push(UnixFile {
            path: format!("/{path}"),
            size: size as i64,
            mtime,
            mode,
            uid,
            gid,
            contents,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; 512];
        assert!(!is_tar(&mut Cursor::new(data)));
    }

    #[test]
    fn round_trips_a_single_file() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_path("hello.txt").unwrap();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"hello"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        assert!(is_tar(&mut Cursor::new(data.clone())));
        let entries = read_tar(Cursor::new(data)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/hello.txt");
        assert!(entries[0].is_regular());
    }
}
