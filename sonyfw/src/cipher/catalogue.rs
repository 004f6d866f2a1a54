//! The ordered crypter catalogue and the `decryptFdat` trial-detection
//! entry point: `fwtool/sony/fdat.py`'s `CRYPTERS` list and the
//! first-match loop that walks it.

use super::aes::{AesCrypter, DoubleAesCrypter};
use super::aes_cbc::{AesCbcCrypter, IV_TRAILER_OFFSET};
use super::sha::ShaCrypter;
use super::{CipherBlock, decrypt_framed, encrypt_framed};
use crate::error::{Error, Result};
use crate::io::{ChunkedFile, SharedSource};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

/// One entry in the crypter catalogue. Identifiers are part of the public
/// interface: they appear in external device-key configuration and in
/// `decrypt_fdat`'s return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum CrypterId {
    CXD4105,
    MB8AC102,
    CXD4115,
    CXD4115_ilc,
    CXD4120,
    CXD4120_pro,
    CXD4132,
    CXD90014,
    CXD90045,
    CXD4105_ms,
    CXD4108_ms,
}

impl CrypterId {
    /// The catalogue in trial-detection order. Order is part of the
    /// contract: gen-3 ciphertext also happens to satisfy part of the
    /// gen-2 frame invariant, so only iterating in this order and
    /// checking full `FDAT` validity disambiguates them.
    pub const ALL: [CrypterId; 11] = [
        CrypterId::CXD4105,
        CrypterId::MB8AC102,
        CrypterId::CXD4115,
        CrypterId::CXD4115_ilc,
        CrypterId::CXD4120,
        CrypterId::CXD4120_pro,
        CrypterId::CXD4132,
        CrypterId::CXD90014,
        CrypterId::CXD90045,
        CrypterId::CXD4105_ms,
        CrypterId::CXD4108_ms,
    ];

    /// True for the `_ms` suffix entries, which select memory-stick
    /// (`MsFirm`) section framing instead of `DAT`/`FDAT`.
    #[must_use]
    pub fn is_memory_stick(self) -> bool {
        matches!(self, CrypterId::CXD4105_ms | CrypterId::CXD4108_ms)
    }
}

impl fmt::Display for CrypterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrypterId::CXD4105 => "CXD4105",
            CrypterId::MB8AC102 => "MB8AC102",
            CrypterId::CXD4115 => "CXD4115",
            CrypterId::CXD4115_ilc => "CXD4115_ilc",
            CrypterId::CXD4120 => "CXD4120",
            CrypterId::CXD4120_pro => "CXD4120_pro",
            CrypterId::CXD4132 => "CXD4132",
            CrypterId::CXD90014 => "CXD90014",
            CrypterId::CXD90045 => "CXD90045",
            CrypterId::CXD4105_ms => "CXD4105_ms",
            CrypterId::CXD4108_ms => "CXD4108_ms",
        };
        f.write_str(s)
    }
}

/// Supplies the per-crypter secret key material the core does not embed
/// by value. One method per cipher realisation the catalogue uses; a
/// caller backs this with whatever store it likes (an embedded table, a
/// file, a remote secret manager) without sonyfw knowing or caring.
pub trait KeyProvider {
    /// 40-byte SHA-1 keystream seed for a gen-1 `CrypterId`.
    fn sha_key(&self, id: CrypterId) -> Result<[u8; 40]>;
    /// 16-byte AES-128 key for a gen-2 `CrypterId`.
    fn aes_key(&self, id: CrypterId) -> Result<[u8; 16]>;
    /// `(inner, outer)` AES-128 key pair for a gen-3 `CrypterId`.
    fn double_aes_keys(&self, id: CrypterId) -> Result<([u8; 16], [u8; 16])>;
    /// `(ecb_key, cbc_key)` AES-128 key pair for a gen-4 `CrypterId`.
    fn aes_cbc_keys(&self, id: CrypterId) -> Result<([u8; 16], [u8; 16])>;
    /// 64-byte HMAC-ish key for an `_ms` `CrypterId`, used by `sonyfw::msfirm`.
    fn ms_firm_key(&self, id: CrypterId) -> Result<[u8; 64]>;
}

fn read_trailer_iv<R: Read + Seek>(source: &mut R) -> Result<[u8; 16]> {
    let len = source.seek(SeekFrom::End(0))?;
    let offset = len
        .checked_sub(IV_TRAILER_OFFSET)
        .ok_or_else(|| Error::Truncated(format!("input of {len} bytes too short for a gen-4 trailer")))?;
    source.seek(SeekFrom::Start(offset))?;
    let mut iv = [0u8; 16];
    source.read_exact(&mut iv)?;
    Ok(iv)
}

/// Builds a fresh [`CipherBlock`] on every call; see [`decrypt_framed`]
/// for why the pipeline needs a constructor rather than one instance.
type CipherFactory = Box<dyn Fn() -> Box<dyn CipherBlock>>;

/// Builds the decrypt-direction cipher factory for `id`. Gen-4 is the one
/// generation whose key material depends on the ciphertext itself (the
/// CBC initialisation vector lives in `source`'s own trailer), so this is
/// the only case that touches `source`.
fn build_decrypt_cipher_factory<R: Read + Seek>(
    id: CrypterId,
    keys: &dyn KeyProvider,
    source: &mut R,
) -> Result<CipherFactory> {
    match id {
        CrypterId::CXD4105 | CrypterId::MB8AC102 => {
            let key = keys.sha_key(id)?;
            Ok(Box::new(move || Box::new(ShaCrypter::new(key, 1000)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD4115
        | CrypterId::CXD4115_ilc
        | CrypterId::CXD4120
        | CrypterId::CXD4120_pro
        | CrypterId::CXD4132 => {
            let key = keys.aes_key(id)?;
            Ok(Box::new(move || Box::new(AesCrypter::new(key, 1024)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD90014 => {
            let (inner, outer) = keys.double_aes_keys(id)?;
            Ok(Box::new(move || Box::new(DoubleAesCrypter::new(inner, outer, 1024)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD90045 => {
            let (key1, key2) = keys.aes_cbc_keys(id)?;
            let iv = read_trailer_iv(source)?;
            Ok(Box::new(move || Box::new(AesCbcCrypter::new(key1, key2, iv, 1024)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD4105_ms | CrypterId::CXD4108_ms => Err(Error::Unsupported(
            "_ms crypters use MsFirm framing, not decrypt_fdat".to_string(),
        )),
    }
}

/// Builds the encrypt-direction cipher factory for `id`. Gen-4 AES-CBC
/// and the `_ms` entries never support an encrypt direction, so neither
/// needs a `source` to inspect.
fn build_encrypt_cipher_factory(id: CrypterId, keys: &dyn KeyProvider) -> Result<CipherFactory> {
    match id {
        CrypterId::CXD4105 | CrypterId::MB8AC102 => {
            let key = keys.sha_key(id)?;
            Ok(Box::new(move || Box::new(ShaCrypter::new(key, 1000)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD4115
        | CrypterId::CXD4115_ilc
        | CrypterId::CXD4120
        | CrypterId::CXD4120_pro
        | CrypterId::CXD4132 => {
            let key = keys.aes_key(id)?;
            Ok(Box::new(move || Box::new(AesCrypter::new(key, 1024)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD90014 => {
            let (inner, outer) = keys.double_aes_keys(id)?;
            Ok(Box::new(move || Box::new(DoubleAesCrypter::new(inner, outer, 1024)) as Box<dyn CipherBlock>))
        },
        CrypterId::CXD90045 => Err(Error::Unsupported(
            "gen-4 AES-CBC crypter is decrypt-only".to_string(),
        )),
        CrypterId::CXD4105_ms | CrypterId::CXD4108_ms => Err(Error::Unsupported(
            "_ms crypters use MsFirm section framing, not encrypt_fdat".to_string(),
        )),
    }
}

/// Recovers the [`Error`] a framing failure was wrapped in by
/// [`super::to_io_error`]; any I/O error that did not originate there
/// (a genuine read failure on the underlying source) becomes a plain
/// [`Error::Io`] instead of being misreported as a frame mismatch.
fn unwrap_io_error(e: std::io::Error) -> Error {
    let message = e.to_string();
    match e.into_inner() {
        Some(inner) => match inner.downcast::<Error>() {
            Ok(boxed) => *boxed,
            Err(_) => Error::Malformed(message),
        },
        None => Error::Io(std::io::Error::other(message)),
    }
}

/// Encrypts `source` under the named crypter, for the three generations
/// that support an encrypt direction (gen 1-3; gen-4 AES-CBC and the
/// `_ms` entries are decrypt/trial-only and return [`Error::Unsupported`]).
/// The counterpart to [`decrypt_fdat`] for the
/// `encryptFdat(stream, crypterName) -> stream` consumer entry point.
pub fn encrypt_fdat<R: Read + Seek + 'static>(
    source: R,
    id: CrypterId,
    keys: &dyn KeyProvider,
) -> Result<ChunkedFile<'static>> {
    let factory = build_encrypt_cipher_factory(id, keys)?;
    Ok(encrypt_framed(source, factory))
}

/// Trial-decrypts `source` against the `DAT`/`FDAT` crypter catalogue
/// (the `_ms` entries are skipped; those belong to `sonyfw::msfirm`), in
/// catalogue order, and returns the first whose decrypted stream passes
/// `is_valid` together with a freshly-rewound stream of its content. Any
/// non-`FrameError` failure aborts the search immediately; a
/// `FrameError` or a structurally-fine-but-invalid decode just tries the
/// next crypter.
pub fn decrypt_fdat<R: Read + Seek + 'static>(
    source: R,
    keys: &dyn KeyProvider,
    is_valid: impl Fn(&[u8]) -> bool,
) -> Result<(CrypterId, ChunkedFile<'static>)> {
    let mut shared = SharedSource::new(source);
    for id in CrypterId::ALL {
        if id.is_memory_stick() {
            continue;
        }
        let factory = build_decrypt_cipher_factory(id, keys, &mut shared)?;
        let mut chunked = decrypt_framed(shared.clone(), factory);
        let mut probe = Vec::new();
        match chunked.read_to_end(&mut probe) {
            Ok(_) if is_valid(&probe) => {
                chunked.seek(SeekFrom::Start(0))?;
                return Ok((id, chunked));
            },
            Ok(_) => continue,
            Err(e) => {
                let err = unwrap_io_error(e);
                if err.is_frame_error() {
                    continue;
                }
                return Err(err);
            },
        }
    }
    Err(Error::Unsupported(
        "no crypter in the catalogue produced a valid FDAT stream".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FixedKeys;
    impl KeyProvider for FixedKeys {
        fn sha_key(&self, _id: CrypterId) -> Result<[u8; 40]> {
            Ok([0x11u8; 40])
        }
        fn aes_key(&self, id: CrypterId) -> Result<[u8; 16]> {
            // Give CXD4132 a distinctive key so only it matches our fixture.
            if id == CrypterId::CXD4132 {
                Ok([0x42u8; 16])
            } else {
                Ok([0x99u8; 16])
            }
        }
        fn double_aes_keys(&self, _id: CrypterId) -> Result<([u8; 16], [u8; 16])> {
            Ok(([0x22u8; 16], [0x33u8; 16]))
        }
        fn aes_cbc_keys(&self, _id: CrypterId) -> Result<([u8; 16], [u8; 16])> {
            Ok(([0x44u8; 16], [0x55u8; 16]))
        }
        fn ms_firm_key(&self, _id: CrypterId) -> Result<[u8; 64]> {
            Ok([0x66u8; 64])
        }
    }

    #[test]
    fn trial_detection_identifies_the_matching_gen2_crypter() {
        let keys = FixedKeys;
        let plaintext = b"payload".to_vec();
        let mut framed = Vec::new();
        super::super::encrypt_framed(Cursor::new(plaintext.clone()), move || {
            Box::new(AesCrypter::new([0x42u8; 16], 1024)) as Box<dyn CipherBlock>
        })
        .read_to_end(&mut framed)
        .unwrap();

        let (id, mut decrypted) = decrypt_fdat(Cursor::new(framed), &keys, |d| d == plaintext).unwrap();
        assert_eq!(id, CrypterId::CXD4132);
        let mut out = Vec::new();
        decrypted.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn no_match_is_unsupported_not_a_panic() {
        let keys = FixedKeys;
        let garbage = vec![0u8; 2048];
        let err = decrypt_fdat(Cursor::new(garbage), &keys, |_| false).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn memory_stick_entries_are_skipped() {
        assert!(CrypterId::CXD4105_ms.is_memory_stick());
        assert!(CrypterId::CXD4108_ms.is_memory_stick());
        assert!(!CrypterId::CXD4132.is_memory_stick());
    }
}
