//! # sonyfw
//!
//! Unpacks, inspects, and re-packs Sony camera firmware images: the
//! `.dat`/`FDAT` container pair, the three-generation block-cipher
//! envelope guarding the firmware payload, and read-only filesystem
//! readers (cramfs, ext2, FAT12/16 with VFAT long names, axfs, squashfs,
//! cpio, tar, gzip) plus writers for cramfs and FAT.
//!
//! ## Layers
//!
//! - [`primitive`] / [`structio`] / [`io`] — byte-level building blocks:
//!   checksums, declarative wire structs, stream views.
//! - [`lz77`] / [`xor55`] — the two compression/keystream primitives the
//!   ancillary readers and warm-boot images build on.
//! - [`cipher`] — the block-cipher envelope and its crypter catalogue.
//! - [`dat`] / [`fdat`] / [`msfirm`] — the container formats.
//! - [`fs`] — filesystem readers and writers, dispatched by [`fs::read_archive`].
//! - [`ancillary`] — partition tables, bootloaders, and the older
//!   ASH/DSLR-era firmware formats.
//!
//! None of this crate talks to a device or a serial port: every entry
//! point takes a `Read + Seek` (or `Write + Seek`) byte source the caller
//! owns. Secret key material (AES keys, SHA-HMAC seeds, memory-stick
//! keys) is never embedded here; callers implement [`cipher::KeyProvider`]
//! over whatever store they keep those in.
//!
//! ## Example
//!
//! ```ignore
//! use sonyfw::dat;
//! use std::fs::File;
//!
//! let mut f = File::open("firmware.dat")?;
//! let container = dat::read_dat(&mut f)?;
//! # Ok::<(), sonyfw::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ancillary;
pub mod cipher;
pub mod dat;
pub mod error;
pub mod fdat;
pub mod fs;
pub mod io;
pub mod lz77;
pub mod msfirm;
pub mod primitive;
pub mod structio;
pub mod xor55;

pub use cipher::{CrypterId, KeyProvider};
pub use error::{Error, Result};
pub use fs::UnixFile;
