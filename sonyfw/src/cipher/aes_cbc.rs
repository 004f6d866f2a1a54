//! Gen-4 crypter: decrypt-only AES-CBC with a trailer-carried IV and a
//! first-block split between plain ECB and the start of the CBC chain.
//! Grounded on `fwtool/sony/fdat.py`'s `decryptBlockV4` (the only gen the
//! original never implements an encrypt side for).

use super::CipherBlock;
use crate::error::{Error, Result};
use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit};

type CbcDec = cbc::Decryptor<Aes128>;

/// Offset from end-of-file at which the CBC initialisation vector lives.
pub const IV_TRAILER_OFFSET: u64 = 0x110;

/// AES-CBC with the first block split: `[0..512)` is plain AES-128-ECB
/// under `key1` (as gen 2), `[512..)` begins the CBC chain under `key2`
/// and the trailer IV, continuing across every later block.
pub struct AesCbcCrypter {
    key1: [u8; 16],
    cbc: CbcDec,
    block_size: usize,
}

impl AesCbcCrypter {
    #[must_use]
    pub fn new(key1: [u8; 16], key2: [u8; 16], iv: [u8; 16], block_size: usize) -> Self {
        Self {
            key1,
            cbc: CbcDec::new((&key2).into(), (&iv).into()),
            block_size,
        }
    }

    fn half(&self) -> usize {
        self.block_size / 2
    }

    fn cbc_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        for chunk in buf.chunks_mut(16) {
            self.cbc.decrypt_block_mut(chunk.into());
        }
        Ok(buf)
    }
}

impl CipherBlock for AesCbcCrypter {
    fn decrypt_block_size(&self) -> usize {
        self.block_size
    }

    fn decrypt_block(&mut self, index: usize, _is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        if index == 0 {
            let half = self.half();
            let first_half = super::aes::AesCrypter::new(self.key1, half)
                .decrypt_block(0, false, &block[..half])?;
            let second_half = self.cbc_decrypt(&block[half..])?;
            let mut out = first_half;
            out.extend(second_half);
            Ok(out)
        } else {
            self.cbc_decrypt(block)
        }
    }

    fn encrypt_block(&mut self, _index: usize, _is_last: bool, _block: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Unsupported(
            "gen-4 AES-CBC crypter is decrypt-only".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_is_explicitly_unsupported() {
        let mut c = AesCbcCrypter::new([0u8; 16], [1u8; 16], [2u8; 16], 1024);
        let err = c.encrypt_block(0, true, &[0u8; 1024]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn first_block_half_uses_plain_ecb() {
        let key1 = [9u8; 16];
        let key2 = [8u8; 16];
        let iv = [7u8; 16];
        let mut c = AesCbcCrypter::new(key1, key2, iv, 1024);

        // A first-half that round trips through the gen-2 cipher with the
        // same key should decode identically via either path.
        let plain_half = vec![0x10u8; 512];
        let cipher_half = super::super::aes::AesCrypter::new(key1, 512)
            .encrypt_block(0, false, &plain_half)
            .unwrap();

        let mut block = cipher_half;
        block.extend(vec![0u8; 512]);
        let decoded = c.decrypt_block(0, false, &block).unwrap();
        assert_eq!(&decoded[..512], &plain_half[..]);
    }
}
