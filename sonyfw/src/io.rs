//! Stream views: [`FilePart`] (a sub-range view over a seekable source) and
//! [`ChunkedFile`] (a lazy, restartable sequence of byte chunks presented
//! as a read-only stream).
//!
//! Both exist so filesystem readers can hand out file contents without
//! materialising them: a `FilePart` borrows a byte range of the underlying
//! source, a `ChunkedFile` wraps a block decompressor/decrypter so each
//! read pulls exactly as much plaintext as the consumer asks for.

use std::cell::RefCell;
use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use std::rc::Rc;

/// A view of `[offset, offset+size)` of an underlying seekable source,
/// addressable like a standalone file.
///
/// Reads past `size` are truncated; seeks outside `[0, size]` clamp to the
/// valid range, matching the original `FilePart`.
pub struct FilePart<T> {
    inner: T,
    offset: u64,
    size: u64,
    pos: u64,
}

impl<T: Read + Seek> FilePart<T> {
    /// Creates a view of `size` bytes starting at `offset`.
    pub fn new(inner: T, offset: u64, size: u64) -> Self {
        Self {
            inner,
            offset,
            size,
            pos: 0,
        }
    }

    /// Creates a view spanning from `offset` to the end of `inner`.
    pub fn to_end(mut inner: T, offset: u64) -> IoResult<Self> {
        let end = inner.seek(SeekFrom::End(0))?;
        let size = end.saturating_sub(offset);
        Ok(Self {
            inner,
            offset,
            size,
            pos: 0,
        })
    }

    /// Size of the view in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consumes the view, returning the underlying source.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Seek> Read for FilePart<T> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        self.inner.seek(SeekFrom::Start(self.offset + self.pos))?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<T: Read + Seek> Seek for FilePart<T> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(p) => self.pos as i64 + p,
            SeekFrom::End(p) => self.size as i64 + p,
        };
        self.pos = target.clamp(0, self.size as i64) as u64;
        Ok(self.pos)
    }
}

/// A factory that (re)creates the chunk producer for a [`ChunkedFile`].
/// Calling it again restarts the generator from the beginning, mirroring a
/// re-invocable Python generator function.
pub type ChunkProducer<'a> = Box<dyn Iterator<Item = IoResult<Vec<u8>>> + 'a>;

/// Presents a lazy sequence of byte chunks as a read-only stream.
///
/// Only two seeks are legal: [`SeekFrom::Start`]`(0)` (restart the
/// producer) and [`SeekFrom::End`]`(0)` (drain to EOF; only when the total
/// size is known). Any other seek returns an error — this is intentional,
/// not a gap: it is exactly the contract archive recursion and `FilePart`
/// construction over a chunked source need.
pub struct ChunkedFile<'a> {
    factory: Box<dyn Fn() -> ChunkProducer<'a> + 'a>,
    iter: ChunkProducer<'a>,
    buf: Vec<u8>,
    buf_pos: usize,
    pos: u64,
    total_size: Option<u64>,
    exhausted: bool,
}

impl<'a> ChunkedFile<'a> {
    /// Builds a chunked stream from a restartable factory and an optional
    /// declared total size.
    pub fn new<F>(factory: F, total_size: Option<u64>) -> Self
    where
        F: Fn() -> ChunkProducer<'a> + 'a,
    {
        let factory: Box<dyn Fn() -> ChunkProducer<'a> + 'a> = Box::new(factory);
        let iter = factory();
        Self {
            factory,
            iter,
            buf: Vec::new(),
            buf_pos: 0,
            pos: 0,
            total_size,
            exhausted: false,
        }
    }

    /// The declared total size, if known.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    fn restart(&mut self) {
        self.iter = (self.factory)();
        self.buf.clear();
        self.buf_pos = 0;
        self.pos = 0;
        self.exhausted = false;
    }

    fn fill(&mut self) -> IoResult<bool> {
        if self.buf_pos < self.buf.len() {
            return Ok(true);
        }
        self.buf.clear();
        self.buf_pos = 0;
        match self.iter.next() {
            Some(Ok(chunk)) => {
                self.buf = chunk;
                Ok(true)
            },
            Some(Err(e)) => Err(e),
            None => {
                self.exhausted = true;
                if let Some(total) = self.total_size {
                    if self.pos != total {
                        return Err(std::io::Error::other(format!(
                            "chunked stream ended at {} bytes, expected {total}",
                            self.pos
                        )));
                    }
                }
                Ok(false)
            },
        }
    }
}

impl Read for ChunkedFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.fill()? {
            return Ok(0);
        }
        let avail = &self.buf[self.buf_pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.buf_pos += n;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ChunkedFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        match pos {
            SeekFrom::Start(0) => {
                self.restart();
                Ok(0)
            },
            SeekFrom::End(0) => {
                let Some(total) = self.total_size else {
                    return Err(std::io::Error::other(
                        "cannot seek to end of a chunked stream with unknown size",
                    ));
                };
                while self.fill()? {
                    self.buf_pos = self.buf.len();
                }
                Ok(total)
            },
            _ => Err(std::io::Error::other(
                "chunked streams only support seek(0, Start) and seek(0, End)",
            )),
        }
    }
}

/// A cloneable handle onto a shared byte source.
///
/// Nested readers (DAT containing FDAT containing a filesystem image
/// containing individual files) all need their own cursor over the same
/// underlying source, but Rust's ownership rules forbid handing out more
/// than one `&mut` to it. `SharedSource` is the single-threaded
/// equivalent of the original's implicit aliasing: every clone borrows
/// the same `RefCell`-guarded source, and every access re-seeks before
/// reading, matching the "never trust the cursor you didn't just
/// position" contract shared byte-sources operate under.
pub struct SharedSource<R>(Rc<RefCell<R>>);

impl<R> SharedSource<R> {
    /// Wraps `inner` for sharing.
    pub fn new(inner: R) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }
}

impl<R> Clone for SharedSource<R> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<R: Read> Read for SharedSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl<R: Seek> Seek for SharedSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn file_part_reads_window() {
        let data = b"0123456789".to_vec();
        let mut part = FilePart::new(Cursor::new(data), 2, 5);
        let mut out = Vec::new();
        part.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"23456");
    }

    #[test]
    fn file_part_seek_clamps() {
        let data = b"0123456789".to_vec();
        let mut part = FilePart::new(Cursor::new(data), 0, 4);
        part.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(part.seek(SeekFrom::Current(0)).unwrap(), 4);
    }

    #[test]
    fn chunked_file_restart_and_drain() {
        let chunks: Vec<Vec<u8>> = vec![b"ab".to_vec(), b"cd".to_vec()];
        let make = move || -> ChunkProducer<'static> {
            Box::new(chunks.clone().into_iter().map(Ok))
        };
        let mut cf = ChunkedFile::new(make, Some(4));
        let mut out = Vec::new();
        cf.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");

        cf.seek(SeekFrom::Start(0)).unwrap();
        let mut out2 = Vec::new();
        cf.read_to_end(&mut out2).unwrap();
        assert_eq!(out2, b"abcd");
    }

    #[test]
    fn chunked_file_rejects_arbitrary_seek() {
        let make = move || -> ChunkProducer<'static> { Box::new(std::iter::empty()) };
        let mut cf = ChunkedFile::new(make, Some(0));
        assert!(cf.seek(SeekFrom::Start(3)).is_err());
    }

    #[test]
    fn shared_source_clones_see_each_others_seeks() {
        let shared = SharedSource::new(Cursor::new(b"0123456789".to_vec()));
        let mut a = shared.clone();
        let mut b = shared.clone();
        a.seek(SeekFrom::Start(5)).unwrap();
        let mut byte = [0u8; 1];
        b.read_exact(&mut byte).unwrap();
        assert_eq!(byte, *b"5");
    }
}
