//! A single-file gzip wrapper: some bodies ship their `'U'` filesystem
//! image gzip-compressed rather than raw. Grounded on `fwtool/archive/gz.py`.

use super::UnixFile;
use crate::error::{Error, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};

const MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Sniffs the 2-byte gzip magic.
pub fn is_gzip<R: Read>(source: &mut R) -> bool {
    let mut magic = [0u8; 2];
    source.read_exact(&mut magic).is_ok() && magic == MAGIC
}

/// Decompresses a gzip stream to a single unnamed file (size unknown
/// until fully decompressed, mirroring the original's lazy `extractTo`).
pub fn read_gzip<R: Read + Seek>(mut source: R) -> Result<Vec<UnixFile<'static>>> {
    source.seek(SeekFrom::Start(0))?;
    let mut decoder = flate2::read::GzDecoder::new(source);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| Error::Malformed(format!("gzip stream: {e}")))?;

    Ok(vec![UnixFile {
        path: String::new(),
        size: data.len() as i64,
        mtime: 0,
        mode: super::S_IFREG,
        uid: 0,
        gid: 0,
        contents: Some(Box::new(Cursor::new(data))),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = vec![0u8; 16];
        assert!(!is_gzip(&mut Cursor::new(data)));
    }

    #[test]
    fn round_trips_a_compressed_file() {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(is_gzip(&mut Cursor::new(compressed.clone())));
        let entries = read_gzip(Cursor::new(compressed)).unwrap();
        assert_eq!(entries.len(), 1);
        let mut bytes = Vec::new();
        entries
            .into_iter()
            .next()
            .unwrap()
            .contents
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, b"hello world");
    }
}
