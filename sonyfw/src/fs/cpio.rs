//! "New ASCII" cpio archives (`070701` magic): used to wrap the initramfs
//! some bodies carry alongside their main filesystem image. Grounded on
//! `fwtool/archive/cpio.py`.

use super::UnixFile;
use crate::error::{Error, Result};
use crate::io::FilePart;
use crate::structio::wire_struct;
use std::io::{Read, Seek, SeekFrom};

wire_struct! {
    be struct CpioHeader {
        magic: [u8; 6],
        inode: [u8; 8],
        mode: [u8; 8],
        uid: [u8; 8],
        gid: [u8; 8],
        nlink: [u8; 8],
        mtime: [u8; 8],
        size: [u8; 8],
        _reserved: [u8; 32],
        name_size: [u8; 8],
        check: [u8; 8],
    }
}

const MAGIC: [u8; 6] = *b"070701";

fn parse_hex_field(field: &[u8; 8]) -> Result<u32> {
    let text = std::str::from_utf8(field).map_err(|_| Error::Malformed("cpio header field is not ASCII".to_string()))?;
    u32::from_str_radix(text, 16).map_err(|_| Error::Malformed(format!("cpio header field {text:?} is not hex")))
}

fn round_up(n: u64, i: u64) -> u64 {
    n.div_ceil(i) * i
}

/// Sniffs the `070701` magic.
pub fn is_cpio<R: Read>(source: &mut R) -> bool {
    CpioHeader::read_opt(source).is_some_and(|h| h.magic == MAGIC)
}

/// Reads a "new ASCII" cpio archive entry by entry until the
/// `TRAILER!!!` sentinel, decoding each ASCII-hex field and rounding the
/// name and data regions up to 4-byte boundaries.
pub fn read_cpio<R: Read + Seek + 'static>(source: R) -> Result<Vec<UnixFile<'static>>> {
    use crate::io::SharedSource;
    let shared = SharedSource::new(source);

    let mut offset = 0u64;
    let mut out = Vec::new();
    loop {
        let mut cursor = shared.clone();
        cursor.seek(SeekFrom::Start(offset))?;
        let header = CpioHeader::read_from(&mut cursor)?;
        if header.magic != MAGIC {
            return Err(Error::WrongMagic("cpio header".to_string()));
        }

        let mode = parse_hex_field(&header.mode)?;
        let uid = parse_hex_field(&header.uid)?;
        let gid = parse_hex_field(&header.gid)?;
        let mtime = parse_hex_field(&header.mtime)?;
        let size = u64::from(parse_hex_field(&header.size)?);
        let name_size = u64::from(parse_hex_field(&header.name_size)?);

        let mut name_bytes = vec![0u8; name_size as usize];
        cursor.read_exact(&mut name_bytes)?;
        let name = String::from_utf8_lossy(&name_bytes)
            .trim_end_matches('\0')
            .to_string();

        if name == "TRAILER!!!" {
            break;
        }

        let data_start = round_up(offset + CpioHeader::SIZE as u64 + name_size, 4);
        offset = round_up(data_start + size, 4);

        out.push(UnixFile {
            path: format!("/{name}"),
            size: size as i64,
            mtime: u64::from(mtime),
            mode,
            uid,
            gid,
            contents: Some(Box::new(FilePart::new(shared.clone(), data_start, size))),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn hex_field(v: u32) -> [u8; 8] {
        let s = format!("{v:08x}");
        let mut out = [0u8; 8];
        out.copy_from_slice(s.as_bytes());
        out
    }

    fn write_entry(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
        let header = CpioHeader {
            magic: MAGIC,
            inode: hex_field(1),
            mode: hex_field(mode),
            uid: hex_field(0),
            gid: hex_field(0),
            nlink: hex_field(1),
            mtime: hex_field(0),
            size: hex_field(data.len() as u32),
            _reserved: [b'0'; 32],
            name_size: hex_field(name.len() as u32 + 1),
            check: hex_field(0),
        };
        out.write_all(&header.to_bytes()).unwrap();
        out.write_all(name.as_bytes()).unwrap();
        out.push(0);
        while (out.len() as u64) % 4 != 0 {
            out.push(0);
        }
        out.write_all(data).unwrap();
        while (out.len() as u64) % 4 != 0 {
            out.push(0);
        }
    }

    fn write_trailer(out: &mut Vec<u8>) {
        write_entry(out, "TRAILER!!!", 0, &[]);
    }

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; CpioHeader::SIZE];
        assert!(!is_cpio(&mut Cursor::new(data)));
    }

    #[test]
    fn reads_a_single_file_entry() {
        let mut data = Vec::new();
        write_entry(&mut data, "hello.txt", 0o100_644, b"hi");
        write_trailer(&mut data);

        assert!(is_cpio(&mut Cursor::new(data.clone())));
        let entries = read_cpio(Cursor::new(data)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/hello.txt");
        let mut bytes = Vec::new();
        let mut c = entries.into_iter().next().unwrap().contents.unwrap();
        c.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"hi");
    }
}
